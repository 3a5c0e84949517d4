//! In-process transport: [`LoopbackDialer`] exposes any [`Robot`] living in
//! the same process as a [`Peer`].
//!
//! Each registered address gets a [`LinkControl`] that can take the link
//! down and bring it back, which is how connectivity loss is simulated.
//! While the link is down, dialing fails, every call on an existing peer
//! fails with [`RobotError::Disconnected`], and subscribers receive
//! [`PeerEvent::Disconnected`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use ferrobot_resource::Resource;
use ferrobot_types::{ExtrasByName, NodeStatus, RemoteConfig, ResourceName, RobotError};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::notifier::{ChangeNotifier, PeerEvent, recv_coalesced};
use crate::robot::{Dialer, Peer, Robot};

// ─────────────────────────────────────────────────────────────────────────────
// Link
// ─────────────────────────────────────────────────────────────────────────────

struct Link {
    up: AtomicBool,
    events: ChangeNotifier,
}

/// Switch for one loopback address.
#[derive(Clone)]
pub struct LinkControl {
    address: String,
    link: Arc<Link>,
}

impl LinkControl {
    /// Drop the link. Existing peers report disconnected until
    /// [`LinkControl::restore`].
    pub fn sever(&self) {
        if self.link.up.swap(false, Ordering::SeqCst) {
            debug!(address = %self.address, "loopback link severed");
            self.link.events.publish(PeerEvent::Disconnected);
        }
    }

    pub fn restore(&self) {
        if !self.link.up.swap(true, Ordering::SeqCst) {
            debug!(address = %self.address, "loopback link restored");
            self.link.events.publish(PeerEvent::Connected);
        }
    }

    pub fn is_up(&self) -> bool {
        self.link.up.load(Ordering::SeqCst)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dialer
// ─────────────────────────────────────────────────────────────────────────────

/// Dials robots registered in this process by address.
#[derive(Default)]
pub struct LoopbackDialer {
    robots: Mutex<HashMap<String, (Arc<dyn Robot>, Arc<Link>)>>,
}

impl LoopbackDialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `robot` reachable at `address`. Replaces any previous robot at
    /// that address.
    pub fn register(&self, address: impl Into<String>, robot: Arc<dyn Robot>) -> LinkControl {
        let address = address.into();
        let link = Arc::new(Link {
            up: AtomicBool::new(true),
            events: ChangeNotifier::default(),
        });
        self.robots
            .lock()
            .insert(address.clone(), (robot, Arc::clone(&link)));
        LinkControl { address, link }
    }

    pub fn unregister(&self, address: &str) {
        self.robots.lock().remove(address);
    }
}

#[async_trait]
impl Dialer for LoopbackDialer {
    async fn dial(&self, config: &RemoteConfig) -> Result<Arc<dyn Peer>, RobotError> {
        let entry = self.robots.lock().get(&config.address).cloned();
        let Some((robot, link)) = entry else {
            return Err(RobotError::Remote {
                remote: config.name.clone(),
                reason: format!("no robot listening at {}", config.address),
            });
        };
        if !link.up.load(Ordering::SeqCst) {
            return Err(RobotError::Remote {
                remote: config.name.clone(),
                reason: format!("connection to {} refused", config.address),
            });
        }
        Ok(Arc::new(LoopbackPeer::open(config.name.clone(), robot, link)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Peer
// ─────────────────────────────────────────────────────────────────────────────

/// Connection to an in-process robot.
pub struct LoopbackPeer {
    remote: String,
    robot: Arc<dyn Robot>,
    link: Arc<Link>,
    closed: AtomicBool,
    events: ChangeNotifier,
    forwarder: JoinHandle<()>,
}

impl LoopbackPeer {
    fn open(remote: String, robot: Arc<dyn Robot>, link: Arc<Link>) -> Self {
        let events = ChangeNotifier::default();
        let forwarder = tokio::spawn(forward_events(
            remote.clone(),
            robot.subscribe(),
            link.events.subscribe(),
            Arc::clone(&link),
            events.clone(),
        ));
        Self {
            remote,
            robot,
            link,
            closed: AtomicBool::new(false),
            events,
            forwarder,
        }
    }

    fn ensure_connected(&self) -> Result<(), RobotError> {
        if self.connected() {
            Ok(())
        } else {
            Err(RobotError::disconnected(self.remote.clone()))
        }
    }
}

/// Relay the robot's change events (only while the link is up) and the
/// link's own transitions to the peer's subscribers.
async fn forward_events(
    remote: String,
    mut robot_events: broadcast::Receiver<PeerEvent>,
    mut link_events: broadcast::Receiver<PeerEvent>,
    link: Arc<Link>,
    out: ChangeNotifier,
) {
    let mut robot_open = true;
    loop {
        tokio::select! {
            event = recv_coalesced(&mut robot_events, &remote), if robot_open => match event {
                Some(event) if link.up.load(Ordering::SeqCst) => {
                    out.publish(event);
                }
                Some(_) => {}
                None => robot_open = false,
            },
            event = recv_coalesced(&mut link_events, &remote) => match event {
                Some(event) => {
                    out.publish(event);
                }
                None => break,
            },
        }
    }
}

#[async_trait]
impl Robot for LoopbackPeer {
    fn resource_names(&self) -> Vec<ResourceName> {
        if !self.connected() {
            return Vec::new();
        }
        self.robot.resource_names()
    }

    async fn resource_by_name(&self, name: &ResourceName) -> Result<Arc<dyn Resource>, RobotError> {
        self.ensure_connected()?;
        self.robot.resource_by_name(name).await
    }

    async fn status(&self, names: &[ResourceName]) -> Result<Vec<NodeStatus>, RobotError> {
        self.ensure_connected()?;
        self.robot.status(names).await
    }

    async fn stop_all(&self, extras: &ExtrasByName) -> Result<(), RobotError> {
        self.ensure_connected()?;
        self.robot.stop_all(extras).await
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl Peer for LoopbackPeer {
    fn connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.link.up.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> Result<(), RobotError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RobotError::Remote {
                remote: self.remote.clone(),
                reason: "connection closed".to_string(),
            });
        }
        self.ensure_connected()
    }

    async fn close(&self) -> Result<(), RobotError> {
        self.closed.store(true, Ordering::SeqCst);
        self.forwarder.abort();
        Ok(())
    }
}

impl Drop for LoopbackPeer {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}
