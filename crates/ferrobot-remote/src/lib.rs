//! `ferrobot-remote` – federation of peer robots.
//!
//! A remote robot is mounted into the local one as a sub-graph: its
//! resources appear under chained names (`foo:pieceArm`) and are reached
//! through proxies that fail fast while the peer is unreachable.
//!
//! # Modules
//!
//! - [`robot`] – the [`Robot`], [`Peer`] and [`Dialer`] contracts.
//! - [`federation`] – [`RemoteNode`]: connection, mirror and watcher for one
//!   peer.
//! - [`mirror`] – the mirrored name set and the peer/local [`Naming`] rule.
//! - [`proxy`] – [`RemoteResource`], the local stand-in for a peer resource.
//! - [`notifier`] – [`ChangeNotifier`]: broadcast of resource-set changes.
//! - [`loopback`] – [`LoopbackDialer`]: in-process transport with
//!   switchable links.

pub mod federation;
pub mod loopback;
pub mod mirror;
pub mod notifier;
pub mod proxy;
pub mod robot;

pub use federation::{RemoteNode, dial_with_retries};
pub use loopback::{LinkControl, LoopbackDialer, LoopbackPeer};
pub use mirror::{Mirror, MirrorEntry, Naming};
pub use notifier::{ChangeNotifier, PeerEvent, recv_coalesced};
pub use proxy::RemoteResource;
pub use robot::{Dialer, Peer, Robot};
