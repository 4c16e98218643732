//! # Converge: iterative closest-peer lookup engine
//!
//! Converge is the query engine of a Kademlia-style DHT: given a target
//! key and a seed set of peers, it explores the network by interrogating
//! peers in parallel, follows closer-peer referrals, converges on the K
//! peers closest to the target under the XOR metric, and optionally
//! performs a final action (store, fetch, announce) against those peers.
//!
//! The engine owns the traversal itself. Connection management, routing
//! tables, and record semantics stay behind trait seams supplied by the
//! caller (see [`QueryFn`], [`HostNetwork`], [`Peerstore`]).
//!
//! ## Two Phases
//!
//! | Phase | What it does |
//! |-------|--------------|
//! | Recurse | Expands the *seen* set by querying peers and following referrals until the outstanding work runs out |
//! | Finish | Runs a terminal action against the K closest survivors, over-dispatching by a slop factor to absorb unreachable peers |
//!
//! Phases compose through [`Query::run`], or separately through
//! [`Query::recurse`] and [`RecurseResult::finish`] for callers that
//! short-circuit on a value or finish with a dedicated action.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `peer` | Keys, peer ids, XOR-metric distance |
//! | `traits` | Seams to the host: per-peer function, network, peerstore |
//! | `events` | Advisory per-query event stream |
//! | `peerset` | Monotone peer sets and the bounded best-peers tracker |
//! | `counter` | Outstanding-work counter driving termination |
//! | `queue` | XOR-priority input queue |
//! | `dial` | Adaptive dial worker pool |
//! | `query` | The runner: recurse, finish, public API |
//!
//! ## Example
//!
//! ```ignore
//! let query = Query::new(local_id, key, host, find_node, QueryConfig::default());
//! let cancel = CancellationToken::new();
//! let closest = query.run(&cancel, &seeds).await?;
//! ```

mod counter;
mod dial;
mod error;
mod events;
mod peer;
mod peerset;
mod query;
mod queue;
mod traits;

pub use error::QueryError;
pub use events::QueryEvent;
pub use peer::{Key, KeyHasher, PeerId, PeerInfo, blake3_hasher, sort_closest};
pub use query::{DEFAULT_ALPHA, DEFAULT_K, DEFAULT_SLOP, Query, QueryConfig, RecurseResult};
pub use traits::{
    Connectedness, FinishAction, HostNetwork, PeerReply, Peerstore, QueryFn, TEMP_ADDR_TTL,
};
