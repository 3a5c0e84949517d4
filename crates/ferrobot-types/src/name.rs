//! Resource naming: [`Api`], [`Model`] and [`ResourceName`].
//!
//! A fully qualified name reads `namespace:type:subtype/remote1:remote2:name`.
//! The part after the slash is the *short name*; every `:` in it marks one
//! federation hop, outermost remote first.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RobotError;

/// Namespace used by every built-in API and model.
pub const DEFAULT_NAMESPACE: &str = "rdk";

/// Separates federation hops in a short name (`foo:bar:arm1`).
pub const REMOTE_DELIMITER: char = ':';

const RESERVED_CHARACTERS: [char; 2] = [':', '+'];

/// Return the first reserved character contained in `s`, if any.
///
/// Resource and remote names may not contain `:` (the hop delimiter) or `+`.
pub fn reserved_character(s: &str) -> Option<char> {
    s.chars().find(|c| RESERVED_CHARACTERS.contains(c))
}

// ─────────────────────────────────────────────────────────────────────────────
// Api
// ─────────────────────────────────────────────────────────────────────────────

/// The `(namespace, type, subtype)` triple identifying a resource API,
/// e.g. `rdk:component:arm`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Api {
    pub namespace: String,
    pub resource_type: String,
    pub subtype: String,
}

impl Api {
    pub fn new(
        namespace: impl Into<String>,
        resource_type: impl Into<String>,
        subtype: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            resource_type: resource_type.into(),
            subtype: subtype.into(),
        }
    }

    /// `rdk:component:<subtype>`
    pub fn component(subtype: impl Into<String>) -> Self {
        Self::new(DEFAULT_NAMESPACE, "component", subtype)
    }

    /// `rdk:service:<subtype>`
    pub fn service(subtype: impl Into<String>) -> Self {
        Self::new(DEFAULT_NAMESPACE, "service", subtype)
    }

    /// The internal API under which remote robots appear as graph nodes.
    pub fn remote() -> Self {
        Self::new("rdk-internal", "remote", "robot")
    }

    pub fn is_component(&self) -> bool {
        self.resource_type == "component"
    }

    pub fn is_service(&self) -> bool {
        self.resource_type == "service"
    }

    pub fn is_remote(&self) -> bool {
        *self == Self::remote()
    }
}

impl fmt::Display for Api {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.namespace, self.resource_type, self.subtype)
    }
}

impl FromStr for Api {
    type Err = RobotError;

    /// Accepts `namespace:type:subtype`, or `type:subtype` in the default
    /// namespace.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [ns, ty, sub] if !ns.is_empty() && !ty.is_empty() && !sub.is_empty() => {
                Ok(Self::new(*ns, *ty, *sub))
            }
            [ty, sub] if !ty.is_empty() && !sub.is_empty() => {
                Ok(Self::new(DEFAULT_NAMESPACE, *ty, *sub))
            }
            _ => Err(RobotError::Config(format!(
                "invalid api {s:?}: expected namespace:type:subtype"
            ))),
        }
    }
}

impl TryFrom<String> for Api {
    type Error = RobotError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Api> for String {
    fn from(api: Api) -> Self {
        api.to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Model
// ─────────────────────────────────────────────────────────────────────────────

/// The `(namespace, family, name)` triple identifying a resource
/// implementation, e.g. `rdk:builtin:fake`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Model {
    pub namespace: String,
    pub family: String,
    pub name: String,
}

impl Model {
    pub fn new(
        namespace: impl Into<String>,
        family: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            family: family.into(),
            name: name.into(),
        }
    }

    /// `rdk:builtin:<name>`
    pub fn builtin(name: impl Into<String>) -> Self {
        Self::new(DEFAULT_NAMESPACE, "builtin", name)
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.namespace, self.family, self.name)
    }
}

impl FromStr for Model {
    type Err = RobotError;

    /// Accepts `namespace:family:name`, or a bare `name` in `rdk:builtin`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [ns, family, name] if !ns.is_empty() && !family.is_empty() && !name.is_empty() => {
                Ok(Self::new(*ns, *family, *name))
            }
            [name] if !name.is_empty() => Ok(Self::builtin(*name)),
            _ => Err(RobotError::Config(format!(
                "invalid model {s:?}: expected namespace:family:name"
            ))),
        }
    }
}

impl TryFrom<String> for Model {
    type Error = RobotError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Model> for String {
    fn from(model: Model) -> Self {
        model.to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ResourceName
// ─────────────────────────────────────────────────────────────────────────────

/// Globally unique key of a resource within one graph.
///
/// `remote` is the federation chain, outermost hop first. A local resource
/// has an empty chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceName {
    pub api: Api,
    pub remote: Vec<String>,
    pub name: String,
}

impl ResourceName {
    pub fn new(api: Api, name: impl Into<String>) -> Self {
        Self {
            api,
            remote: Vec::new(),
            name: name.into(),
        }
    }

    pub fn component(subtype: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(Api::component(subtype), name)
    }

    pub fn service(subtype: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(Api::service(subtype), name)
    }

    /// Graph key of the remote robot called `name`.
    pub fn remote_robot(name: impl Into<String>) -> Self {
        Self::new(Api::remote(), name)
    }

    /// Build a name from `api` and a short name such as `foo:bar:arm1`.
    pub fn from_short(api: Api, short: &str) -> Self {
        let mut hops: Vec<String> = short.split(REMOTE_DELIMITER).map(str::to_string).collect();
        let name = hops.pop().unwrap_or_default();
        Self {
            api,
            remote: hops,
            name,
        }
    }

    pub fn is_local(&self) -> bool {
        self.remote.is_empty()
    }

    /// The outermost federation hop, if any.
    pub fn first_remote(&self) -> Option<&str> {
        self.remote.first().map(String::as_str)
    }

    /// Return a copy reached through one more hop, `remote`.
    pub fn prepend_remote(&self, remote: &str) -> Self {
        let mut chain = Vec::with_capacity(self.remote.len() + 1);
        chain.push(remote.to_string());
        chain.extend(self.remote.iter().cloned());
        Self {
            api: self.api.clone(),
            remote: chain,
            name: self.name.clone(),
        }
    }

    /// Return a copy with the outermost hop removed.
    pub fn pop_remote(&self) -> Self {
        Self {
            api: self.api.clone(),
            remote: self.remote.iter().skip(1).cloned().collect(),
            name: self.name.clone(),
        }
    }

    pub fn with_name(&self, name: impl Into<String>) -> Self {
        Self {
            api: self.api.clone(),
            remote: self.remote.clone(),
            name: name.into(),
        }
    }

    /// `remote1:remote2:name`, or just `name` for local resources.
    pub fn short_name(&self) -> String {
        if self.remote.is_empty() {
            return self.name.clone();
        }
        let mut out = self.remote.join(":");
        out.push(REMOTE_DELIMITER);
        out.push_str(&self.name);
        out
    }

    /// True when `query` names this resource, possibly with fewer leading
    /// hops: `a:b:arm` matches the queries `arm`, `b:arm` and `a:b:arm`.
    pub fn matches_suffix(&self, query: &ResourceName) -> bool {
        self.api == query.api && self.name == query.name && self.remote.ends_with(&query.remote)
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api, self.short_name())
    }
}

impl FromStr for ResourceName {
    type Err = RobotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (api, short) = s.split_once('/').ok_or_else(|| {
            RobotError::Config(format!("invalid resource name {s:?}: missing '/'"))
        })?;
        if short.is_empty() || short.split(REMOTE_DELIMITER).any(str::is_empty) {
            return Err(RobotError::Config(format!(
                "invalid resource name {s:?}: empty name segment"
            )));
        }
        Ok(Self::from_short(api.parse()?, short))
    }
}

impl TryFrom<String> for ResourceName {
    type Error = RobotError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ResourceName> for String {
    fn from(name: ResourceName) -> Self {
        name.to_string()
    }
}
