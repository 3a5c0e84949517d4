//! [`StableHandle`] – the identity-preserving reference callers hold.
//!
//! A handle wraps a single mutable *target* behind its own
//! [`tokio::sync::RwLock`]. Calls through the handle hold the read side for
//! their whole duration; swapping the target takes the write side. A caller
//! therefore never observes a half-replaced target, and the handle object
//! itself is never replaced by reconfiguration.
//!
//! While no target is installed the handle is *vacant* and every call fails
//! with the reason recorded at vacate time (build failure, disconnect, …).

use std::sync::Arc;

use async_trait::async_trait;
use ferrobot_types::{Extra, ResourceConfig, ResourceName, RobotError};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::warn;

use crate::operation::{OperationGuard, OperationManager};
use crate::resource::{Command, Dependencies, Resource, Stoppable};

enum Slot {
    Live(Arc<dyn Resource>),
    Vacant(RobotError),
}

struct HandleInner {
    name: ResourceName,
    slot: RwLock<Slot>,
    operations: Arc<OperationManager>,
}

/// Long-lived, swappable reference to a resource. Cheap to clone; clones
/// share identity.
#[derive(Clone)]
pub struct StableHandle {
    inner: Arc<HandleInner>,
}

impl StableHandle {
    /// Create a vacant handle for `name`.
    pub fn new(name: ResourceName, operations: Arc<OperationManager>) -> Self {
        let reason = RobotError::Pending {
            name: name.to_string(),
            missing: Vec::new(),
        };
        Self {
            inner: Arc::new(HandleInner {
                name,
                slot: RwLock::new(Slot::Vacant(reason)),
                operations,
            }),
        }
    }

    /// Create a handle with `target` already installed.
    pub fn with_target(
        name: ResourceName,
        target: Arc<dyn Resource>,
        operations: Arc<OperationManager>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                name,
                slot: RwLock::new(Slot::Live(target)),
                operations,
            }),
        }
    }

    pub fn resource_name(&self) -> &ResourceName {
        &self.inner.name
    }

    /// True when both handles are the same object.
    pub fn same_handle(&self, other: &StableHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The current target, or the reason there is none.
    pub async fn current(&self) -> Result<Arc<dyn Resource>, RobotError> {
        match &*self.inner.slot.read().await {
            Slot::Live(target) => Ok(Arc::clone(target)),
            Slot::Vacant(reason) => Err(reason.clone()),
        }
    }

    pub async fn is_live(&self) -> bool {
        matches!(&*self.inner.slot.read().await, Slot::Live(_))
    }

    /// Install `target`, returning the previous one (not closed).
    pub async fn install(&self, target: Arc<dyn Resource>) -> Option<Arc<dyn Resource>> {
        self.lock().await.install(target)
    }

    /// Remove the target, recording why calls now fail. Returns the previous
    /// target (not closed).
    pub async fn vacate(&self, reason: RobotError) -> Option<Arc<dyn Resource>> {
        self.lock().await.vacate(reason)
    }

    /// Take exclusive access for a multi-step swap.
    ///
    /// New calls through the handle wait until the guard is dropped.
    pub async fn lock(&self) -> HandleGuard<'_> {
        HandleGuard {
            slot: self.inner.slot.write().await,
        }
    }

    /// Stop the target if it is stoppable. Returns whether a stop was issued.
    ///
    /// # Errors
    ///
    /// Returns the vacancy reason, [`RobotError::Cancelled`], or the
    /// target's own stop error.
    pub async fn stop_if_stoppable(&self, extra: Option<&Extra>) -> Result<bool, RobotError> {
        let (slot, op) = self.enter("stop").await?;
        let Slot::Live(target) = &*slot else {
            return Ok(false);
        };
        match target.as_stoppable() {
            Some(stoppable) => op.run(stoppable.stop(extra)).await.map(|()| true),
            None => Ok(false),
        }
    }

    /// Close the current target and leave the handle vacant with
    /// [`RobotError::Closed`].
    pub async fn close_target(&self) -> Result<(), RobotError> {
        let old = self.vacate(RobotError::closed(&self.inner.name)).await;
        match old {
            Some(target) => target.close().await,
            None => Ok(()),
        }
    }

    async fn enter(
        &self,
        method: &'static str,
    ) -> Result<(RwLockReadGuard<'_, Slot>, OperationGuard), RobotError> {
        let slot = self.inner.slot.read().await;
        if let Slot::Vacant(reason) = &*slot {
            return Err(reason.clone());
        }
        let op = self.inner.operations.start(&self.inner.name, method);
        Ok((slot, op))
    }
}

impl std::fmt::Debug for StableHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StableHandle")
            .field("name", &self.inner.name)
            .finish()
    }
}

/// Exclusive access to a handle's target, obtained from
/// [`StableHandle::lock`].
pub struct HandleGuard<'a> {
    slot: RwLockWriteGuard<'a, Slot>,
}

impl HandleGuard<'_> {
    pub fn current(&self) -> Option<&Arc<dyn Resource>> {
        match &*self.slot {
            Slot::Live(target) => Some(target),
            Slot::Vacant(_) => None,
        }
    }

    pub fn install(&mut self, target: Arc<dyn Resource>) -> Option<Arc<dyn Resource>> {
        match std::mem::replace(&mut *self.slot, Slot::Live(target)) {
            Slot::Live(old) => Some(old),
            Slot::Vacant(_) => None,
        }
    }

    pub fn vacate(&mut self, reason: RobotError) -> Option<Arc<dyn Resource>> {
        match std::mem::replace(&mut *self.slot, Slot::Vacant(reason)) {
            Slot::Live(old) => Some(old),
            Slot::Vacant(_) => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Forwarding
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
impl Resource for StableHandle {
    fn name(&self) -> &ResourceName {
        &self.inner.name
    }

    async fn reconfigure(&self, deps: &Dependencies, conf: &ResourceConfig) -> Result<(), RobotError> {
        let guard = self.lock().await;
        match guard.current() {
            Some(target) => target.reconfigure(deps, conf).await,
            None => Err(RobotError::closed(&self.inner.name)),
        }
    }

    async fn do_command(&self, cmd: Command) -> Result<Command, RobotError> {
        let (slot, op) = self.enter("do_command").await?;
        match &*slot {
            Slot::Live(target) => op.run(target.do_command(cmd)).await,
            Slot::Vacant(reason) => Err(reason.clone()),
        }
    }

    async fn close(&self) -> Result<(), RobotError> {
        self.close_target().await
    }

    fn as_stoppable(&self) -> Option<&dyn Stoppable> {
        Some(self)
    }
}

#[async_trait]
impl Stoppable for StableHandle {
    async fn stop(&self, extra: Option<&Extra>) -> Result<(), RobotError> {
        if self.stop_if_stoppable(extra).await? {
            Ok(())
        } else {
            Err(RobotError::Unimplemented(format!("stop on {}", self.inner.name)))
        }
    }

    async fn is_moving(&self) -> Result<bool, RobotError> {
        let (slot, op) = self.enter("is_moving").await?;
        match &*slot {
            Slot::Live(target) => match target.as_stoppable() {
                Some(stoppable) => op.run(stoppable.is_moving()).await,
                None => Ok(false),
            },
            Slot::Vacant(reason) => Err(reason.clone()),
        }
    }
}

/// Close a target that was swapped out of a handle, logging instead of
/// failing.
pub async fn close_detached(name: &ResourceName, target: Arc<dyn Resource>) {
    if let Err(e) = target.close().await {
        warn!(resource = %name, error = %e, "failed to close replaced resource");
    }
}
