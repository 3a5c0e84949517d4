//! [`LocalRobot`] – a [`ResourceManager`] served as a [`Robot`].
//!
//! Besides forwarding the [`Robot`] calls it does two things the manager
//! does not: it re-applies the current configuration whenever one of its
//! remotes reports a change (so resources waiting on remote dependencies are
//! retried and weak observers see remote members), and it publishes its own
//! [`PeerEvent::ResourcesChanged`] so that robots federating *this* one
//! resynchronise in turn.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ferrobot_kernel::{ApplyReport, DEFAULT_BUILD_TIMEOUT, Reconfigurer};
use ferrobot_remote::{ChangeNotifier, Dialer, PeerEvent, Robot, recv_coalesced};
use ferrobot_resource::{OperationManager, Registry, Resource};
use ferrobot_types::{ExtrasByName, NodeStatus, ResourceName, RobotConfig, RobotError};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::manager::ResourceManager;

#[derive(Debug, Clone)]
pub struct RobotOptions {
    /// Upper bound on one resource constructor.
    pub build_timeout: Duration,
}

impl Default for RobotOptions {
    fn default() -> Self {
        Self {
            build_timeout: DEFAULT_BUILD_TIMEOUT,
        }
    }
}

struct Follower {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct LocalRobot {
    manager: Arc<ResourceManager>,
    events: ChangeNotifier,
    follower: Mutex<Option<Follower>>,
}

impl LocalRobot {
    /// Create an empty robot. Must be called inside a Tokio runtime.
    pub fn new(registry: Arc<Registry>, dialer: Arc<dyn Dialer>, options: RobotOptions) -> Arc<Self> {
        let remote_events = ChangeNotifier::default();
        let engine = Reconfigurer::new(registry, dialer, Arc::new(OperationManager::new()))
            .with_build_timeout(options.build_timeout)
            .with_remote_events(remote_events.clone());
        let manager = Arc::new(ResourceManager::new(engine));
        let events = ChangeNotifier::default();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(follow_remotes(
            Arc::clone(&manager),
            remote_events.subscribe(),
            events.clone(),
            cancel.clone(),
        ));
        Arc::new(Self {
            manager,
            events,
            follower: Mutex::new(Some(Follower { cancel, task })),
        })
    }

    pub fn manager(&self) -> &Arc<ResourceManager> {
        &self.manager
    }

    /// Apply `config` and tell subscribers when the visible names changed.
    ///
    /// # Errors
    ///
    /// See [`ResourceManager::reconfigure`].
    pub async fn reconfigure(&self, config: RobotConfig) -> Result<ApplyReport, RobotError> {
        let before = self.manager.resource_names();
        let result = self.manager.reconfigure(config).await;
        if self.manager.resource_names() != before {
            self.events.publish(PeerEvent::ResourcesChanged);
        }
        result
    }

    /// Stop following remotes, then close everything the manager owns.
    ///
    /// # Errors
    ///
    /// See [`ResourceManager::close`].
    pub async fn close(&self) -> Result<(), RobotError> {
        let follower = self.follower.lock().await.take();
        if let Some(follower) = follower {
            follower.cancel.cancel();
            if let Err(e) = follower.task.await {
                warn!(error = %e, "remote follower ended abnormally");
            }
        }
        let result = self.manager.close().await;
        self.events.publish(PeerEvent::ResourcesChanged);
        result
    }
}

async fn follow_remotes(
    manager: Arc<ResourceManager>,
    mut remote_events: broadcast::Receiver<PeerEvent>,
    events: ChangeNotifier,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = recv_coalesced(&mut remote_events, "remotes") => {
                let Some(event) = event else { break };
                debug!(?event, "remote changed, re-applying configuration");
                match manager.refresh().await {
                    Ok(report) if !report.is_noop() => {
                        info!(built = report.built.len(), "resources brought up after remote change");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "re-apply after remote change failed"),
                }
                events.publish(PeerEvent::ResourcesChanged);
            }
        }
    }
}

#[async_trait]
impl Robot for LocalRobot {
    fn resource_names(&self) -> Vec<ResourceName> {
        self.manager.resource_names()
    }

    async fn resource_by_name(&self, name: &ResourceName) -> Result<Arc<dyn Resource>, RobotError> {
        self.manager.resource_by_name(name)
    }

    async fn status(&self, names: &[ResourceName]) -> Result<Vec<NodeStatus>, RobotError> {
        self.manager.status(names).await
    }

    async fn stop_all(&self, extras: &ExtrasByName) -> Result<(), RobotError> {
        self.manager.stop_all(extras).await
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }
}
