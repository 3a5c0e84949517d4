//! Declarations that make up one robot configuration snapshot.
//!
//! A [`RobotConfig`] is always handled as a whole: the differ compares two
//! complete snapshots and never applies incremental edits.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RobotError;
use crate::name::{Api, Model, ResourceName, reserved_character};

/// Free-form resource attributes.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// Per-call extra arguments, e.g. the payload handed to `stop`.
pub type Extra = serde_json::Map<String, serde_json::Value>;

// ─────────────────────────────────────────────────────────────────────────────
// Components and services
// ─────────────────────────────────────────────────────────────────────────────

/// One component or service declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub name: String,
    pub api: Api,
    pub model: Model,
    #[serde(default)]
    pub attributes: Attributes,
    /// Hard dependencies, as short (`arm1`, `foo:arm1`) or full names.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ResourceConfig {
    pub fn new(name: impl Into<String>, api: Api, model: Model) -> Self {
        Self {
            name: name.into(),
            api,
            model,
            attributes: Attributes::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: serde_json::Value) -> Self {
        self.attributes.insert(key.to_string(), value);
        self
    }

    pub fn with_depends_on(mut self, dep: impl Into<String>) -> Self {
        self.depends_on.push(dep.into());
        self
    }

    pub fn resource_name(&self) -> ResourceName {
        ResourceName::new(self.api.clone(), self.name.clone())
    }

    /// Equality after normalization: attributes compare as maps and
    /// `depends_on` compares as a set.
    pub fn normalized_eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.api == other.api
            && self.model == other.model
            && self.attributes == other.attributes
            && sorted_unique(&self.depends_on) == sorted_unique(&other.depends_on)
    }
}

fn sorted_unique(items: &[String]) -> Vec<&str> {
    let mut out: Vec<&str> = items.iter().map(String::as_str).collect();
    out.sort_unstable();
    out.dedup();
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Remotes
// ─────────────────────────────────────────────────────────────────────────────

/// Credentials presented when dialing a remote.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<String>,
}

impl fmt::Debug for RemoteAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteAuth")
            .field("entity", &self.entity)
            .field(
                "credentials",
                if self.credentials.is_none() { &"<not set>" } else { &"<redacted>" },
            )
            .finish()
    }
}

/// A peer robot whose resources are federated into this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub name: String,
    pub address: String,

    /// Prepended to every simple name exposed by this remote, so that
    /// `pieceArm` on the peer reads `<prefix>pieceArm` locally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    #[serde(default)]
    pub insecure: bool,

    #[serde(default)]
    pub auth: RemoteAuth,

    #[serde(default = "default_connection_check_interval_ms")]
    pub connection_check_interval_ms: u64,

    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    #[serde(default = "default_dial_attempts")]
    pub dial_attempts: u32,
}

fn default_connection_check_interval_ms() -> u64 {
    10_000
}
fn default_reconnect_interval_ms() -> u64 {
    1_000
}
fn default_dial_attempts() -> u32 {
    3
}

impl RemoteConfig {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            prefix: None,
            insecure: false,
            auth: RemoteAuth::default(),
            connection_check_interval_ms: default_connection_check_interval_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            dial_attempts: default_dial_attempts(),
        }
    }

    pub fn resource_name(&self) -> ResourceName {
        ResourceName::remote_robot(self.name.clone())
    }

    pub fn connection_check_interval(&self) -> Duration {
        Duration::from_millis(self.connection_check_interval_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Processes
// ─────────────────────────────────────────────────────────────────────────────

/// An external process supervised alongside the resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub id: String,
    /// Executable to run.
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Run to completion during reconfiguration instead of staying resident.
    #[serde(default)]
    pub one_shot: bool,
    /// Forward the process output to the log.
    #[serde(default)]
    pub log: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Snapshot
// ─────────────────────────────────────────────────────────────────────────────

/// A complete robot configuration snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RobotConfig {
    #[serde(default)]
    pub processes: Vec<ProcessConfig>,
    #[serde(default)]
    pub remotes: Vec<RemoteConfig>,
    #[serde(default)]
    pub components: Vec<ResourceConfig>,
    #[serde(default)]
    pub services: Vec<ResourceConfig>,
}

impl RobotConfig {
    /// Components followed by services, in declaration order.
    pub fn resources(&self) -> impl Iterator<Item = &ResourceConfig> {
        self.components.iter().chain(self.services.iter())
    }

    pub fn find_resource(&self, name: &ResourceName) -> Option<&ResourceConfig> {
        self.resources()
            .find(|c| c.api == name.api && c.name == name.name && name.is_local())
    }

    pub fn find_remote(&self, name: &str) -> Option<&RemoteConfig> {
        self.remotes.iter().find(|r| r.name == name)
    }

    /// Reject snapshots no graph could be built from.
    ///
    /// # Errors
    ///
    /// Returns [`RobotError::Config`] for empty names, reserved characters,
    /// duplicate declarations, or a resource that depends on itself.
    pub fn validate(&self) -> Result<(), RobotError> {
        let mut seen = HashSet::new();
        for conf in self.resources() {
            check_simple_name("resource", &conf.name)?;
            if !seen.insert(conf.resource_name()) {
                return Err(RobotError::Config(format!(
                    "duplicate resource {}",
                    conf.resource_name()
                )));
            }
            let own = conf.resource_name().to_string();
            if conf.depends_on.iter().any(|d| *d == conf.name || *d == own) {
                return Err(RobotError::Config(format!("{own} depends on itself")));
            }
        }

        let mut remotes = HashSet::new();
        for remote in &self.remotes {
            check_simple_name("remote", &remote.name)?;
            if remote.address.trim().is_empty() {
                return Err(RobotError::Config(format!(
                    "remote {} has no address",
                    remote.name
                )));
            }
            if !remotes.insert(remote.name.as_str()) {
                return Err(RobotError::Config(format!("duplicate remote {}", remote.name)));
            }
        }

        let mut processes = HashSet::new();
        for process in &self.processes {
            if process.id.trim().is_empty() {
                return Err(RobotError::Config("process with empty id".to_string()));
            }
            if process.name.trim().is_empty() {
                return Err(RobotError::Config(format!(
                    "process {} has no executable",
                    process.id
                )));
            }
            if !processes.insert(process.id.as_str()) {
                return Err(RobotError::Config(format!("duplicate process {}", process.id)));
            }
        }
        Ok(())
    }
}

fn check_simple_name(kind: &str, name: &str) -> Result<(), RobotError> {
    if name.trim().is_empty() {
        return Err(RobotError::Config(format!("{kind} with empty name")));
    }
    if let Some(c) = reserved_character(name) {
        return Err(RobotError::Config(format!(
            "{kind} name {name:?} contains reserved character {c:?}"
        )));
    }
    Ok(())
}
