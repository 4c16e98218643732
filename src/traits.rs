//! Interface seams between the lookup engine and its host.
//!
//! The engine drives everything through these traits so the surrounding
//! stack stays pluggable:
//!
//! | Collaborator | Trait | Purpose |
//! |--------------|-------|---------|
//! | Per-peer function | [`QueryFn`] | Interrogate one peer, yield referrals or a value |
//! | Finish action | [`FinishAction`] | Terminal call against each of the K closest |
//! | Host network | [`HostNetwork`] | Connection state and dialing |
//! | Peerstore | [`Peerstore`] | Short-lived address hints for referrals |
//!
//! Async methods receive the ambient [`CancellationToken`] and must
//! return promptly once it fires; the engine does not wrap them in
//! timeouts of its own.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::peer::{PeerId, PeerInfo};

/// TTL handed to [`Peerstore::add_addresses`] for referral address hints.
/// Long enough to dial the referred peer, short enough to keep third-hand
/// addresses out of the long-lived book.
pub const TEMP_ADDR_TTL: Duration = Duration::from_secs(2 * 60);

/// Connection state of a peer as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectedness {
    /// No live connection and no known way to reach the peer.
    NotConnected,
    /// At least one live connection.
    Connected,
    /// No live connection, but usable addresses are known.
    CanConnect,
    /// A recent dial attempt failed.
    CannotConnect,
}

/// Result of one per-peer query.
#[derive(Debug, Clone)]
pub enum PeerReply {
    /// Peers the remote side believes are closer to the target.
    Closer(Vec<PeerInfo>),
    /// Early-termination signal carrying a value. The engine treats this
    /// as success with no referrals and never interprets the payload; the
    /// layer that supplied the [`QueryFn`] consumes it.
    Value(Vec<u8>),
}

/// The per-peer query function: the payload of the recurse phase.
#[async_trait]
pub trait QueryFn: Send + Sync + 'static {
    async fn query(&self, cancel: CancellationToken, peer: PeerId) -> Result<PeerReply>;
}

/// Optional action run by the finish phase against the K closest peers,
/// e.g. a store or announce RPC.
#[async_trait]
pub trait FinishAction: Send + Sync + 'static {
    async fn apply(&self, cancel: CancellationToken, peer: PeerId) -> Result<()>;
}

/// Connection management, as much of it as the engine needs.
#[async_trait]
pub trait HostNetwork: Send + Sync + 'static {
    /// Current connection state for `peer`.
    fn connectedness(&self, peer: &PeerId) -> Connectedness;

    /// Establish a connection to the peer in `info`, using the
    /// peerstore's addresses plus any hints carried in `info`.
    async fn connect(&self, cancel: CancellationToken, info: PeerInfo) -> Result<()>;
}

/// Address-book writes for referral hints.
pub trait Peerstore: Send + Sync + 'static {
    /// Record dial addresses for `peer` with the given TTL.
    fn add_addresses(&self, peer: &PeerId, addrs: &[String], ttl: Duration);
}
