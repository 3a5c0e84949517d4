//! [`Registry`] – constructor and capability lookup by `(api, model)`.
//!
//! The registry is populated once at startup and then shared read-only
//! (`Arc<Registry>`) with the reconfiguration engine. Nothing mutates it
//! after it has been handed out.
//!
//! # Weak dependencies
//!
//! A [`Registration`] may declare [`Matcher`]s. Every built resource matched
//! by one of them is reported to the registered resource through
//! [`WeakObserver`][crate::resource::WeakObserver] after each apply, without
//! ever gating its construction or causing it to be removed.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use ferrobot_types::{Api, Model, ResourceConfig, ResourceName, RobotError};
use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::resource::{Dependencies, Resource};

/// Everything a constructor gets to build one resource.
pub struct BuildContext {
    pub name: ResourceName,
    pub config: ResourceConfig,
    pub deps: Dependencies,
    /// Cancelled when the build times out or the robot shuts down.
    pub cancel: CancellationToken,
}

pub type Constructor =
    Arc<dyn Fn(BuildContext) -> BoxFuture<'static, Result<Arc<dyn Resource>, RobotError>> + Send + Sync>;

/// Checks a declaration before construction and returns any implicit
/// dependencies (short names) the model needs besides `depends_on`.
pub type Validator = Arc<dyn Fn(&ResourceConfig) -> Result<Vec<String>, String> + Send + Sync>;

/// What the runtime may do with instances of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Attribute changes may be applied in place.
    pub reconfigurable: bool,
    pub closeable: bool,
    pub stoppable: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            reconfigurable: true,
            closeable: true,
            stoppable: false,
        }
    }
}

/// Selects graph members for a weak dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// Every resource of a type, e.g. `"component"`.
    Type(String),
    /// Every resource of one API.
    Api(Api),
    /// One resource.
    Name(ResourceName),
}

impl Matcher {
    pub fn matches(&self, name: &ResourceName) -> bool {
        match self {
            Matcher::Type(ty) => name.api.resource_type == *ty,
            Matcher::Api(api) => name.api == *api,
            Matcher::Name(n) => n == name,
        }
    }
}

/// One `(api, model)` entry.
#[derive(Clone)]
pub struct Registration {
    constructor: Constructor,
    validator: Option<Validator>,
    pub capabilities: Capabilities,
    pub weak_dependencies: Vec<Matcher>,
}

impl Registration {
    pub fn new<F, Fut>(constructor: F) -> Self
    where
        F: Fn(BuildContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn Resource>, RobotError>> + Send + 'static,
    {
        let constructor: Constructor =
            Arc::new(move |ctx: BuildContext| -> BoxFuture<'static, _> { Box::pin(constructor(ctx)) });
        Self {
            constructor,
            validator: None,
            capabilities: Capabilities::default(),
            weak_dependencies: Vec::new(),
        }
    }

    pub fn with_validator<V>(mut self, validator: V) -> Self
    where
        V: Fn(&ResourceConfig) -> Result<Vec<String>, String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_weak_dependency(mut self, matcher: Matcher) -> Self {
        self.weak_dependencies.push(matcher);
        self
    }

    /// Run the validator, if any.
    ///
    /// # Errors
    ///
    /// Returns [`RobotError::Validation`] carrying the validator's message.
    pub fn validate(&self, conf: &ResourceConfig) -> Result<Vec<String>, RobotError> {
        match &self.validator {
            Some(validate) => {
                validate(conf).map_err(|reason| RobotError::validation(&conf.resource_name(), reason))
            }
            None => Ok(Vec::new()),
        }
    }

    pub fn construct(&self, ctx: BuildContext) -> BoxFuture<'static, Result<Arc<dyn Resource>, RobotError>> {
        (self.constructor)(ctx)
    }

    /// True when `name` is one of this registration's weak dependencies.
    pub fn weakly_depends_on(&self, name: &ResourceName) -> bool {
        self.weak_dependencies.iter().any(|m| m.matches(name))
    }
}

/// Write-once table of registrations and per-API instance limits.
///
/// Construct with [`Registry::new`], register models, then share it as
/// `Arc<Registry>`.
#[derive(Default, Clone)]
pub struct Registry {
    models: HashMap<(Api, Model), Registration>,
    max_instances: HashMap<Api, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `model` for `api`. Any previous registration for the pair is
    /// replaced.
    pub fn register(&mut self, api: Api, model: Model, registration: Registration) {
        self.models.insert((api, model), registration);
    }

    /// Cap the number of local instances of `api`.
    pub fn set_max_instances(&mut self, api: Api, limit: usize) {
        self.max_instances.insert(api, limit);
    }

    pub fn lookup(&self, api: &Api, model: &Model) -> Option<&Registration> {
        self.models.get(&(api.clone(), model.clone()))
    }

    /// Like [`Registry::lookup`], failing with [`RobotError::UnknownModel`].
    pub fn require(&self, api: &Api, model: &Model) -> Result<&Registration, RobotError> {
        self.lookup(api, model).ok_or_else(|| RobotError::UnknownModel {
            api: api.to_string(),
            model: model.to_string(),
        })
    }

    pub fn max_instances(&self, api: &Api) -> Option<usize> {
        self.max_instances.get(api).copied()
    }

    /// Registered capabilities for a declaration, if its model is known.
    pub fn capabilities(&self, conf: &ResourceConfig) -> Option<Capabilities> {
        self.lookup(&conf.api, &conf.model).map(|r| r.capabilities)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
