//! Shared peer bookkeeping: the monotone seen/queried/failed sets and the
//! bounded best-peers tracker.
//!
//! Both structures carry their own synchronization. Callers never compose
//! them under an outer lock, and no lock here is held across an await
//! point.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Mutex;

use crate::peer::{KeyHasher, PeerId, distance_cmp, xor_distance};

/// A monotone set of peer ids with atomic test-and-insert. Never shrinks
/// during a query.
#[derive(Default)]
pub struct PeerSet {
    inner: Mutex<HashSet<PeerId>>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `peer`, returning true iff it was not already present.
    pub fn try_add(&self, peer: &PeerId) -> bool {
        self.inner
            .lock()
            .map(|mut set| set.insert(peer.clone()))
            .unwrap_or(false)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.inner
            .lock()
            .map(|set| set.contains(peer))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|set| set.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the current membership, in no particular order.
    pub fn snapshot(&self) -> Vec<PeerId> {
        self.inner
            .lock()
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}

struct Ranked {
    distance: [u8; 32],
    digest: [u8; 32],
    peer: PeerId,
}

/// The closest successfully queried peers, capped at the concurrency
/// factor and ordered by XOR distance to the target digest.
///
/// `check` doubles as the admission gate used to prune peers before they
/// are dialed or queried: a peer that could not enter the tracker cannot
/// improve the result set, so the engine drops it early.
pub struct NearestPeers {
    target: [u8; 32],
    hasher: KeyHasher,
    capacity: usize,
    // Ascending by (distance, digest); length never exceeds capacity.
    inner: Mutex<Vec<Ranked>>,
}

impl NearestPeers {
    pub fn new(capacity: usize, target: [u8; 32], hasher: KeyHasher) -> Self {
        Self {
            target,
            hasher,
            capacity,
            inner: Mutex::new(Vec::new()),
        }
    }

    fn rank(&self, peer: &PeerId) -> Ranked {
        let digest = (self.hasher)(peer.as_bytes());
        Ranked {
            distance: xor_distance(&digest, &self.target),
            digest,
            peer: peer.clone(),
        }
    }

    /// True iff `peer` is already a member, the tracker has room, or the
    /// peer is closer than the current farthest member.
    pub fn check(&self, peer: &PeerId) -> bool {
        let candidate = self.rank(peer);
        self.inner
            .lock()
            .map(|members| {
                if members.iter().any(|m| m.peer == candidate.peer) {
                    return true;
                }
                if members.len() < self.capacity {
                    return true;
                }
                match members.last() {
                    Some(farthest) => {
                        distance_cmp(&candidate.distance, &farthest.distance) == Ordering::Less
                    }
                    None => true,
                }
            })
            .unwrap_or(false)
    }

    /// Insert `peer`, evicting the farthest member on overflow.
    pub fn add(&self, peer: &PeerId) {
        let candidate = self.rank(peer);
        if let Ok(mut members) = self.inner.lock() {
            if members.iter().any(|m| m.peer == candidate.peer) {
                return;
            }
            let at = members.partition_point(|m| {
                distance_cmp(&m.distance, &candidate.distance)
                    .then_with(|| m.digest.cmp(&candidate.digest))
                    == Ordering::Less
            });
            members.insert(at, candidate);
            members.truncate(self.capacity);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|members| members.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_hasher(bytes: &[u8]) -> [u8; 32] {
        let mut out = [0u8; 32];
        let n = bytes.len().min(32);
        out[..n].copy_from_slice(&bytes[..n]);
        out
    }

    fn pid(byte: u8) -> PeerId {
        PeerId::new(vec![byte])
    }

    #[test]
    fn try_add_reports_novelty_once() {
        let set = PeerSet::new();
        assert!(set.try_add(&pid(1)));
        assert!(!set.try_add(&pid(1)));
        assert!(set.contains(&pid(1)));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn snapshot_reflects_membership() {
        let set = PeerSet::new();
        set.try_add(&pid(1));
        set.try_add(&pid(2));
        let mut peers = set.snapshot();
        peers.sort();
        assert_eq!(peers, vec![pid(1), pid(2)]);
    }

    #[test]
    fn tracker_admits_until_full() {
        let target = flat_hasher(&[0x00]);
        let tracker = NearestPeers::new(2, target, flat_hasher);
        assert!(tracker.check(&pid(0x80)));
        tracker.add(&pid(0x80));
        assert!(tracker.check(&pid(0x40)));
        tracker.add(&pid(0x40));
        assert_eq!(tracker.len(), 2);

        // Farther than both members: rejected.
        assert!(!tracker.check(&pid(0xF0)));
        // Closer than the farthest: admitted.
        assert!(tracker.check(&pid(0x01)));
    }

    #[test]
    fn add_evicts_the_farthest() {
        let target = flat_hasher(&[0x00]);
        let tracker = NearestPeers::new(2, target, flat_hasher);
        tracker.add(&pid(0x80));
        tracker.add(&pid(0x40));
        tracker.add(&pid(0x01));
        assert_eq!(tracker.len(), 2);
        // 0x80 was evicted, so it no longer counts as a member and is too
        // far to re-enter.
        assert!(!tracker.check(&pid(0x80)));
        assert!(tracker.check(&pid(0x01)));
        assert!(tracker.check(&pid(0x40)));
    }

    #[test]
    fn members_pass_check() {
        let target = flat_hasher(&[0x00]);
        let tracker = NearestPeers::new(1, target, flat_hasher);
        tracker.add(&pid(0x10));
        assert!(tracker.check(&pid(0x10)));
        assert!(!tracker.check(&pid(0x20)));
    }
}
