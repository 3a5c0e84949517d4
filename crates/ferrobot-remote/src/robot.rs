//! The contracts between a robot, a connection to it, and the transport
//! that opens such connections.
//!
//! - [`Robot`] – what every robot serves, local or remote.
//! - [`Peer`] – a live connection to a robot, which can drop and come back.
//! - [`Dialer`] – opens [`Peer`]s; the wire format and authentication live
//!   behind it.

use std::sync::Arc;

use async_trait::async_trait;
use ferrobot_resource::Resource;
use ferrobot_types::{ExtrasByName, NodeStatus, RemoteConfig, ResourceName, RobotError};
use tokio::sync::broadcast;

use crate::notifier::PeerEvent;

/// Every robot, local or federated, must implement this trait.
///
/// # Contract
///
/// * `resource_names` – never blocks on a resource constructor; returns the
///   robot's flattened view, including chained names of its own remotes.
/// * `subscribe` – yields [`PeerEvent::ResourcesChanged`] whenever the set
///   of names changes.
#[async_trait]
pub trait Robot: Send + Sync {
    fn resource_names(&self) -> Vec<ResourceName>;

    async fn resource_by_name(&self, name: &ResourceName) -> Result<Arc<dyn Resource>, RobotError>;

    /// One batched status call. An empty `names` asks for everything.
    async fn status(&self, names: &[ResourceName]) -> Result<Vec<NodeStatus>, RobotError>;

    async fn stop_all(&self, extras: &ExtrasByName) -> Result<(), RobotError>;

    fn subscribe(&self) -> broadcast::Receiver<PeerEvent>;
}

/// A connection to a robot.
#[async_trait]
pub trait Peer: Robot {
    fn connected(&self) -> bool;

    /// Try to re-establish a dropped connection.
    ///
    /// # Errors
    ///
    /// The default implementation only succeeds when already connected.
    async fn reconnect(&self) -> Result<(), RobotError> {
        if self.connected() {
            Ok(())
        } else {
            Err(RobotError::Remote {
                remote: "peer".to_string(),
                reason: "reconnect is not supported by this transport".to_string(),
            })
        }
    }

    /// Close the connection. The robot behind it keeps running.
    async fn close(&self) -> Result<(), RobotError>;
}

/// Opens connections to remotes.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, config: &RemoteConfig) -> Result<Arc<dyn Peer>, RobotError>;
}
