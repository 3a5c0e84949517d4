//! The reconcile rule shared by local reconfiguration and remote mirror
//! refreshes: reconfigure in place when possible, otherwise close the old
//! target and install a freshly built one into the *same* handle.

use std::future::Future;
use std::sync::Arc;

use ferrobot_types::{ResourceConfig, RobotError};
use tracing::{debug, warn};

use crate::handle::StableHandle;
use crate::resource::{Dependencies, Resource};

/// How a handle was brought up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// The existing target accepted the new configuration.
    Reconfigured,
    /// A new target replaced the old one.
    Rebuilt,
}

/// Bring `handle` in line with `conf`.
///
/// When `in_place` is set and the handle has a live target, the target's
/// `reconfigure` is tried first; [`RobotError::MustRebuild`] falls through to
/// a rebuild. The handle stays locked for the whole call, so concurrent
/// callers see either the old target or the new one.
///
/// # Errors
///
/// Returns the in-place reconfigure error (the old target stays installed),
/// or the `rebuild` error (the handle is left vacant with that error).
pub async fn reconcile<F, Fut>(
    handle: &StableHandle,
    deps: &Dependencies,
    conf: &ResourceConfig,
    in_place: bool,
    rebuild: F,
) -> Result<Reconciled, RobotError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Arc<dyn Resource>, RobotError>>,
{
    let name = handle.resource_name().clone();
    let mut guard = handle.lock().await;

    if in_place && let Some(current) = guard.current() {
        match current.reconfigure(deps, conf).await {
            Ok(()) => {
                debug!(resource = %name, "reconfigured in place");
                return Ok(Reconciled::Reconfigured);
            }
            Err(e) if e.is_must_rebuild() => {
                debug!(resource = %name, "in-place reconfigure declined, rebuilding");
            }
            Err(e) => return Err(e),
        }
    }

    if let Some(old) = guard.vacate(RobotError::closed(&name))
        && let Err(e) = old.close().await
    {
        warn!(resource = %name, error = %e, "failed to close resource before rebuild");
    }

    match rebuild().await {
        Ok(fresh) => {
            guard.install(fresh);
            debug!(resource = %name, "rebuilt");
            Ok(Reconciled::Rebuilt)
        }
        Err(e) => {
            guard.vacate(e.clone());
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationManager;
    use crate::resource::Command;
    use async_trait::async_trait;
    use ferrobot_types::{Api, Model, ResourceName};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    // ------------------------------------------------------------------
    // Test doubles
    // ------------------------------------------------------------------

    struct Target {
        name: ResourceName,
        generation: usize,
        accepts_in_place: bool,
        reconfigures: AtomicUsize,
        closed: AtomicBool,
    }

    impl Target {
        fn new(generation: usize, accepts_in_place: bool) -> Arc<Self> {
            Arc::new(Self {
                name: ResourceName::component("arm", "arm1"),
                generation,
                accepts_in_place,
                reconfigures: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Resource for Target {
        fn name(&self) -> &ResourceName {
            &self.name
        }

        async fn reconfigure(&self, _deps: &Dependencies, _conf: &ResourceConfig) -> Result<(), RobotError> {
            if self.accepts_in_place {
                self.reconfigures.fetch_add(1, Ordering::SeqCst);
                Ok(())
            } else {
                Err(RobotError::must_rebuild(&self.name))
            }
        }

        async fn do_command(&self, _cmd: Command) -> Result<Command, RobotError> {
            let mut out = Command::new();
            out.insert("generation".into(), self.generation.into());
            Ok(out)
        }

        async fn close(&self) -> Result<(), RobotError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn conf() -> ResourceConfig {
        ResourceConfig::new("arm1", Api::component("arm"), Model::builtin("fake"))
    }

    async fn handle_with(target: Arc<Target>) -> StableHandle {
        StableHandle::with_target(
            ResourceName::component("arm", "arm1"),
            target,
            Arc::new(OperationManager::new()),
        )
    }

    #[tokio::test]
    async fn in_place_when_target_accepts() {
        let original = Target::new(1, true);
        let handle = handle_with(original.clone()).await;
        let outcome = reconcile(&handle, &Dependencies::new(), &conf(), true, || async {
            Ok(Target::new(2, true) as Arc<dyn Resource>)
        })
        .await
        .unwrap();
        assert_eq!(outcome, Reconciled::Reconfigured);
        assert_eq!(original.reconfigures.load(Ordering::SeqCst), 1);
        assert!(!original.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn must_rebuild_closes_old_and_installs_new() {
        let original = Target::new(1, false);
        let handle = handle_with(original.clone()).await;
        let held = handle.clone();
        let outcome = reconcile(&handle, &Dependencies::new(), &conf(), true, || async {
            Ok(Target::new(2, false) as Arc<dyn Resource>)
        })
        .await
        .unwrap();
        assert_eq!(outcome, Reconciled::Rebuilt);
        assert!(original.closed.load(Ordering::SeqCst));
        let out = held.do_command(Command::new()).await.unwrap();
        assert_eq!(out["generation"], 2);
    }

    #[tokio::test]
    async fn failed_rebuild_leaves_handle_vacant_with_error() {
        let handle = handle_with(Target::new(1, true)).await;
        let err = reconcile(&handle, &Dependencies::new(), &conf(), false, || async {
            Err::<Arc<dyn Resource>, _>(RobotError::build(
                &ResourceName::component("arm", "arm1"),
                "serial port busy",
            ))
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("serial port busy"));
        let parked = handle.current().await.err().unwrap();
        assert!(parked.to_string().contains("serial port busy"));
    }
}
