//! [`OperationManager`] – registry of in-flight resource calls.
//!
//! Every call routed through a [`StableHandle`][crate::handle::StableHandle]
//! registers an operation for as long as it runs. Any other task can cancel
//! it through [`OperationManager::cancel_for`] or
//! [`OperationManager::cancel_all`]; the interrupted caller then receives
//! [`RobotError::Cancelled`] instead of waiting the call out.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ferrobot_types::{ResourceName, RobotError};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Snapshot of one in-flight call, as returned by [`OperationManager::list`].
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub id: Uuid,
    pub resource: ResourceName,
    pub method: &'static str,
    pub started_at: DateTime<Utc>,
}

// ────────────────────────────────────────────────────────────────────────────
// Internal entry
// ────────────────────────────────────────────────────────────────────────────

struct OperationEntry {
    resource: ResourceName,
    method: &'static str,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

// ────────────────────────────────────────────────────────────────────────────
// OperationManager
// ────────────────────────────────────────────────────────────────────────────

/// Tracks in-flight calls so that they can be cancelled from another task.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use ferrobot_resource::operation::OperationManager;
/// use ferrobot_types::ResourceName;
///
/// let ops = Arc::new(OperationManager::new());
/// let arm = ResourceName::component("arm", "arm1");
/// let guard = ops.start(&arm, "move_to_position");
///
/// assert_eq!(ops.cancel_for(&arm), 1);
/// assert!(guard.is_cancelled());
/// ```
#[derive(Default)]
pub struct OperationManager {
    operations: Mutex<HashMap<Uuid, OperationEntry>>,
}

impl OperationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call of `method` on `resource`.
    ///
    /// The operation stays registered until the returned guard is dropped.
    pub fn start(self: &Arc<Self>, resource: &ResourceName, method: &'static str) -> OperationGuard {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        self.operations.lock().insert(
            id,
            OperationEntry {
                resource: resource.clone(),
                method,
                started_at: Utc::now(),
                cancel: cancel.clone(),
            },
        );
        OperationGuard {
            id,
            resource: resource.clone(),
            method,
            cancel,
            manager: Arc::clone(self),
        }
    }

    /// Cancel every in-flight call on `resource`. Returns how many were
    /// cancelled.
    pub fn cancel_for(&self, resource: &ResourceName) -> usize {
        let ops = self.operations.lock();
        let mut cancelled = 0;
        for entry in ops.values().filter(|e| &e.resource == resource) {
            entry.cancel.cancel();
            cancelled += 1;
        }
        cancelled
    }

    /// Cancel every in-flight call. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let ops = self.operations.lock();
        for entry in ops.values() {
            entry.cancel.cancel();
        }
        if !ops.is_empty() {
            debug!(count = ops.len(), "cancelled all in-flight operations");
        }
        ops.len()
    }

    /// In-flight calls, oldest first.
    pub fn list(&self) -> Vec<Operation> {
        let mut out: Vec<Operation> = self
            .operations
            .lock()
            .iter()
            .map(|(id, e)| Operation {
                id: *id,
                resource: e.resource.clone(),
                method: e.method,
                started_at: e.started_at,
            })
            .collect();
        out.sort_by_key(|op| op.started_at);
        out
    }

    pub fn len(&self) -> usize {
        self.operations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.lock().is_empty()
    }

    fn finish(&self, id: &Uuid) {
        self.operations.lock().remove(id);
    }
}

/// Registration of one in-flight call; deregisters on drop.
pub struct OperationGuard {
    id: Uuid,
    resource: ResourceName,
    method: &'static str,
    cancel: CancellationToken,
    manager: Arc<OperationManager>,
}

impl OperationGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drive `call` to completion unless the operation is cancelled first.
    ///
    /// # Errors
    ///
    /// Returns [`RobotError::Cancelled`] when cancelled, otherwise whatever
    /// `call` returns.
    pub async fn run<T, F>(&self, call: F) -> Result<T, RobotError>
    where
        F: Future<Output = Result<T, RobotError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RobotError::Cancelled(format!(
                "{} on {}",
                self.method, self.resource
            ))),
            result = call => result,
        }
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.manager.finish(&self.id);
    }
}
