//! Change notification channel between a robot and whoever mirrors it.
//!
//! Uses [`tokio::sync::broadcast`] so every subscriber receives every event
//! without any single subscriber blocking the others. A subscriber that
//! falls behind is told to resynchronise rather than silently missing a
//! change.

use tokio::sync::broadcast;
use tracing::warn;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 64;

/// Something a subscriber to a robot should react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerEvent {
    /// The robot's set of resources changed.
    ResourcesChanged,
    /// The connection to the robot came (back) up.
    Connected,
    /// The connection to the robot was lost.
    Disconnected,
}

/// Shared publisher of [`PeerEvent`]s. Clone it cheaply – all clones share
/// the same underlying broadcast channel.
#[derive(Clone, Debug)]
pub struct ChangeNotifier {
    sender: broadcast::Sender<PeerEvent>,
}

impl ChangeNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish `event` to every current subscriber.
    ///
    /// Returns the number of subscribers that were handed the event; `0`
    /// when nobody is listening, which is a normal condition.
    pub fn publish(&self, event: PeerEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Receive the next event, mapping lag to [`PeerEvent::ResourcesChanged`]
/// so the caller resynchronises instead of missing a change.
///
/// Returns `None` when the channel is closed.
pub async fn recv_coalesced(
    receiver: &mut broadcast::Receiver<PeerEvent>,
    source: &str,
) -> Option<PeerEvent> {
    match receiver.recv().await {
        Ok(event) => Some(event),
        Err(broadcast::error::RecvError::Lagged(n)) => {
            warn!(source = %source, lagged_by = n, "change subscriber lagged, forcing resync");
            Some(PeerEvent::ResourcesChanged)
        }
        Err(broadcast::error::RecvError::Closed) => None,
    }
}
