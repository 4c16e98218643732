//! Advisory event stream emitted while a query runs.

use tokio::sync::broadcast;

use crate::peer::PeerId;

/// Capacity of the per-query event channel. Observers that lag past this
/// lose events rather than backpressure the engine.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Progress events published on a query-scoped broadcast channel.
///
/// Events are advisory and lossy: the engine drops them when nobody is
/// listening or an observer lags, and correctness never depends on
/// delivery.
#[derive(Debug, Clone)]
pub enum QueryEvent {
    /// A newly discovered peer entered the query.
    AddingPeer { peer: PeerId },
    /// A connect attempt is starting for `peer`.
    DialingPeer { peer: PeerId },
    /// A dial against `peer` failed.
    QueryError { peer: PeerId, message: String },
    /// Referral count from a responsive peer. Published by per-peer
    /// functions that want to surface it; the engine never emits this.
    PeerResponse { peer: PeerId, closer: usize },
    /// A per-peer function hit an early-termination value.
    FoundValue { peer: PeerId },
}

pub(crate) fn channel() -> broadcast::Sender<QueryEvent> {
    broadcast::channel(EVENT_CHANNEL_CAPACITY).0
}
