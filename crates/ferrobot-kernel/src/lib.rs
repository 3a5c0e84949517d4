//! `ferrobot-kernel` – the reconfiguration core.
//!
//! It owns no long-lived state of its own beyond what the engine remembers
//! between applies; the runtime holds the published graph and serializes
//! calls into it.
//!
//! # Modules
//!
//! - [`graph`] – [`ResourceGraph`]: nodes, hard and weak edges, orphan
//!   detection and deterministic topological order.
//! - [`diff`] – [`diff`][diff::diff]: partitions two config snapshots into
//!   added, modified, removed and unchanged declarations.
//! - [`engine`] – [`Reconfigurer`]: applies a diff to a graph, building,
//!   reconfiguring and tearing down resources in dependency order.
//! - [`process`] – [`ProcessManager`]: external processes declared next to
//!   the resources.
//! - [`config`] – loading and validating TOML snapshots.

pub mod config;
pub mod diff;
pub mod engine;
pub mod graph;
pub mod process;

pub use diff::{ConfigDiff, Partition, diff};
pub use engine::{ApplyReport, DEFAULT_BUILD_TIMEOUT, Reconfigurer};
pub use graph::{GraphNode, NodeKind, NodeState, ResourceGraph};
pub use process::ProcessManager;
