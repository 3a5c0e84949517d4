//! [`RemoteResource`] – local stand-in for a resource owned by a peer.
//!
//! Every call checks the connection first, so a proxy never talks to a peer
//! that has gone away. Closing a proxy releases only the proxy; the peer's
//! resource keeps running.

use std::sync::Arc;

use async_trait::async_trait;
use ferrobot_resource::{Command, Resource, Stoppable};
use ferrobot_types::{Extra, ResourceName, RobotError};

use crate::robot::Peer;

pub struct RemoteResource {
    local_name: ResourceName,
    remote: String,
    target: Arc<dyn Resource>,
    peer: Arc<dyn Peer>,
}

impl RemoteResource {
    pub fn new(
        local_name: ResourceName,
        remote: impl Into<String>,
        target: Arc<dyn Resource>,
        peer: Arc<dyn Peer>,
    ) -> Self {
        Self {
            local_name,
            remote: remote.into(),
            target,
            peer,
        }
    }

    /// The peer-side object this proxy forwards to.
    pub fn target(&self) -> &Arc<dyn Resource> {
        &self.target
    }

    fn ensure_connected(&self) -> Result<(), RobotError> {
        if self.peer.connected() {
            Ok(())
        } else {
            Err(RobotError::disconnected(self.remote.clone()))
        }
    }
}

#[async_trait]
impl Resource for RemoteResource {
    fn name(&self) -> &ResourceName {
        &self.local_name
    }

    async fn do_command(&self, cmd: Command) -> Result<Command, RobotError> {
        self.ensure_connected()?;
        self.target.do_command(cmd).await
    }

    async fn close(&self) -> Result<(), RobotError> {
        Ok(())
    }

    fn as_stoppable(&self) -> Option<&dyn Stoppable> {
        self.target.as_stoppable().map(|_| self as &dyn Stoppable)
    }
}

#[async_trait]
impl Stoppable for RemoteResource {
    async fn stop(&self, extra: Option<&Extra>) -> Result<(), RobotError> {
        self.ensure_connected()?;
        match self.target.as_stoppable() {
            Some(stoppable) => stoppable.stop(extra).await,
            None => Err(RobotError::Unimplemented(format!("stop on {}", self.local_name))),
        }
    }

    async fn is_moving(&self) -> Result<bool, RobotError> {
        self.ensure_connected()?;
        match self.target.as_stoppable() {
            Some(stoppable) => stoppable.is_moving().await,
            None => Ok(false),
        }
    }
}
