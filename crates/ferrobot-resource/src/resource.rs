//! The [`Resource`] contract every component, service and remote proxy
//! implements.
//!
//! Drivers implement this trait and register a constructor with the
//! [`Registry`][crate::registry::Registry]. The rest of the runtime only ever
//! talks to the trait, so drivers can be swapped without touching the graph.
//!
//! Optional behaviour is discovered through capability queries
//! ([`Resource::as_stoppable`], [`Resource::as_weak_observer`]) rather than
//! through a class hierarchy.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ferrobot_types::{Extra, ResourceConfig, ResourceName, RobotError};

/// Payload of [`Resource::do_command`], both ways.
pub type Command = serde_json::Map<String, serde_json::Value>;

/// A managed resource (arm, sensor, service, remote proxy, …).
#[async_trait]
pub trait Resource: Send + Sync {
    fn name(&self) -> &ResourceName;

    /// Apply a new configuration in place.
    ///
    /// # Errors
    ///
    /// The default implementation returns [`RobotError::MustRebuild`], which
    /// tells the caller to close this instance and construct a new one.
    async fn reconfigure(&self, deps: &Dependencies, conf: &ResourceConfig) -> Result<(), RobotError> {
        let _ = (deps, conf);
        Err(RobotError::must_rebuild(self.name()))
    }

    /// Model-specific escape hatch.
    async fn do_command(&self, cmd: Command) -> Result<Command, RobotError> {
        let _ = cmd;
        Err(RobotError::Unimplemented(format!("do_command on {}", self.name())))
    }

    /// Release everything the resource holds. Called at most once per
    /// instance by the runtime.
    async fn close(&self) -> Result<(), RobotError> {
        Ok(())
    }

    fn as_stoppable(&self) -> Option<&dyn Stoppable> {
        None
    }

    fn as_weak_observer(&self) -> Option<&dyn WeakObserver> {
        None
    }
}

/// Capability: the resource can move and be halted.
#[async_trait]
pub trait Stoppable: Send + Sync {
    /// Halt motion. `extra` is `None` when the caller supplied nothing for
    /// this resource.
    async fn stop(&self, extra: Option<&Extra>) -> Result<(), RobotError>;

    async fn is_moving(&self) -> Result<bool, RobotError> {
        Ok(false)
    }
}

/// Capability: the resource observes graph membership through weak
/// dependencies declared at registration.
#[async_trait]
pub trait WeakObserver: Send + Sync {
    async fn weak_dependencies_updated(&self, update: &WeakUpdate) -> Result<(), RobotError>;
}

/// Membership delta handed to a [`WeakObserver`] after an apply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeakUpdate {
    /// Every current member matched by the observer's weak dependencies.
    pub members: Vec<ResourceName>,
    pub added: Vec<ResourceName>,
    pub removed: Vec<ResourceName>,
}

impl WeakUpdate {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dependencies
// ─────────────────────────────────────────────────────────────────────────────

/// Resolved hard dependencies handed to constructors and `reconfigure`.
///
/// Values are stable handles, so a dependency that is rebuilt later stays
/// reachable through the same reference.
#[derive(Clone, Default)]
pub struct Dependencies {
    by_name: HashMap<ResourceName, Arc<dyn Resource>>,
}

impl Dependencies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: ResourceName, resource: Arc<dyn Resource>) {
        self.by_name.insert(name, resource);
    }

    pub fn get(&self, name: &ResourceName) -> Option<&Arc<dyn Resource>> {
        self.by_name.get(name)
    }

    /// Find a dependency by its short name (`arm1`, `foo:arm1`).
    pub fn by_short_name(&self, short: &str) -> Option<&Arc<dyn Resource>> {
        self.by_name
            .iter()
            .find(|(name, _)| name.short_name() == short)
            .map(|(_, r)| r)
    }

    pub fn names(&self) -> impl Iterator<Item = &ResourceName> {
        self.by_name.keys()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

impl std::fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.by_name.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Inert {
        name: ResourceName,
    }

    #[async_trait]
    impl Resource for Inert {
        fn name(&self) -> &ResourceName {
            &self.name
        }
    }

    #[tokio::test]
    async fn default_reconfigure_asks_for_rebuild() {
        let inert = Inert {
            name: ResourceName::component("arm", "arm1"),
        };
        let conf = ResourceConfig::new(
            "arm1",
            ferrobot_types::Api::component("arm"),
            ferrobot_types::Model::builtin("fake"),
        );
        let err = inert.reconfigure(&Dependencies::new(), &conf).await.unwrap_err();
        assert!(err.is_must_rebuild());
    }

    #[test]
    fn capabilities_default_to_absent() {
        let inert = Inert {
            name: ResourceName::component("arm", "arm1"),
        };
        assert!(inert.as_stoppable().is_none());
        assert!(inert.as_weak_observer().is_none());
    }

    #[test]
    fn dependencies_resolve_short_names() {
        let arm = ResourceName::component("arm", "arm1").prepend_remote("foo");
        let mut deps = Dependencies::new();
        deps.insert(arm.clone(), Arc::new(Inert { name: arm.clone() }));
        assert!(deps.by_short_name("foo:arm1").is_some());
        assert!(deps.by_short_name("arm1").is_none());
        assert_eq!(deps.len(), 1);
    }
}
