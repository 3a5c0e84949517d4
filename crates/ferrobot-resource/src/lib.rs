//! `ferrobot-resource` – the resource contract and its plumbing.
//!
//! # Modules
//!
//! - [`resource`] – the [`Resource`] trait and its optional capabilities
//!   ([`Stoppable`], [`WeakObserver`]).
//! - [`handle`] – [`StableHandle`]: the identity-preserving, swappable
//!   reference callers hold across reconfiguration.
//! - [`registry`] – [`Registry`]: constructors, validators, capabilities and
//!   instance limits keyed by `(api, model)`.
//! - [`operation`] – [`OperationManager`]: in-flight call tracking with
//!   cross-task cancellation.
//! - [`reconcile`] – the reconfigure-in-place-or-rebuild rule.
//! - [`sim_registry`] – [`SimRegistry`][sim_registry::SimRegistry]: simulated
//!   models for tests and dry runs.

pub mod handle;
pub mod operation;
pub mod reconcile;
pub mod registry;
pub mod resource;
pub mod sim_registry;

pub use handle::StableHandle;
pub use operation::{Operation, OperationGuard, OperationManager};
pub use reconcile::{Reconciled, reconcile};
pub use registry::{BuildContext, Capabilities, Matcher, Registration, Registry};
pub use resource::{Command, Dependencies, Resource, Stoppable, WeakObserver, WeakUpdate};
