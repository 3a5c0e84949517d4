//! `ferrobot-types` – shared vocabulary of the ferrobot control plane.
//!
//! # Modules
//!
//! - [`name`] – [`ResourceName`], [`Api`] and [`Model`], including the
//!   federation chain carried by remote names.
//! - [`config`] – [`RobotConfig`] and the declarations it is made of.
//! - [`error`] – [`RobotError`], the error type every crate returns.

pub mod config;
pub mod error;
pub mod name;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use config::{
    Attributes, Extra, ProcessConfig, RemoteAuth, RemoteConfig, ResourceConfig, RobotConfig,
};
pub use error::{MultiError, RobotError};
pub use name::{Api, Model, ResourceName, reserved_character};

/// Stop extras keyed by the resource they are meant for.
pub type ExtrasByName = HashMap<ResourceName, Extra>;

/// Coarse lifecycle state reported by [`NodeStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceState {
    /// Built and usable.
    Ready,
    /// Being constructed or reconfigured.
    Configuring,
    /// Declared but blocked on a missing dependency.
    Pending,
    /// Construction or validation failed; see [`NodeStatus::error`].
    Unhealthy,
    /// Owned by a remote that is currently unreachable.
    Disconnected,
}

/// Status snapshot of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub name: ResourceName,
    pub state: ResourceState,
    /// Logical clock bumped on every state change of the node.
    pub revision: u64,
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
