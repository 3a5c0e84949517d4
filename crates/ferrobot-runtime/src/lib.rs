//! `ferrobot-runtime` – what a running robot is made of.
//!
//! # Modules
//!
//! - [`manager`] – [`ResourceManager`]: resource names, lookup with
//!   ambiguity detection, batched status, stop-all, reconfigure and close
//!   over the local graph and every remote.
//! - [`robot`] – [`LocalRobot`]: serves a manager as a
//!   [`Robot`][ferrobot_remote::Robot] and re-applies its configuration when
//!   a remote changes.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: console
//!   logging plus optional OTLP span export.

pub mod manager;
pub mod robot;
pub mod telemetry;

pub use manager::ResourceManager;
pub use robot::{LocalRobot, RobotOptions};
