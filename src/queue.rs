//! XOR-priority input queue feeding the dial queue.
//!
//! Producers enqueue discovered peers without blocking. An owning task
//! keeps them heap-ordered by distance to the query target and hands them
//! out one at a time, so dequeues track ascending XOR order closely even
//! as closer referrals arrive late.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::peer::{KeyHasher, PeerId, distance_cmp, xor_distance};

/// Capacity of the dequeue side. Kept at one so a closer peer arriving
/// late can still overtake everything not yet handed out.
const DEQUEUE_CAPACITY: usize = 1;

struct HeapEntry {
    distance: [u8; 32],
    digest: [u8; 32],
    peer: PeerId,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the closest peer surfaces
        // first, with a lexicographic digest tie-break.
        distance_cmp(&other.distance, &self.distance).then_with(|| other.digest.cmp(&self.digest))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

/// Enqueue handle for the priority queue task.
pub(crate) struct DistanceQueue {
    enqueue_tx: mpsc::UnboundedSender<PeerId>,
}

impl DistanceQueue {
    /// Spawn the queue task. Returns the enqueue handle and the dequeue
    /// side consumed by the dial queue.
    pub fn spawn(
        scope: CancellationToken,
        target: [u8; 32],
        hasher: KeyHasher,
    ) -> (Self, mpsc::Receiver<PeerId>) {
        let (enqueue_tx, mut enqueue_rx) = mpsc::unbounded_channel::<PeerId>();
        let (dequeue_tx, dequeue_rx) = mpsc::channel(DEQUEUE_CAPACITY);

        tokio::spawn(async move {
            let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::new();
            loop {
                if heap.is_empty() {
                    tokio::select! {
                        _ = scope.cancelled() => break,
                        item = enqueue_rx.recv() => match item {
                            Some(peer) => push(&mut heap, peer, &target, hasher),
                            None => break,
                        },
                    }
                } else {
                    tokio::select! {
                        _ = scope.cancelled() => break,
                        item = enqueue_rx.recv() => match item {
                            Some(peer) => push(&mut heap, peer, &target, hasher),
                            None => break,
                        },
                        permit = dequeue_tx.reserve() => match permit {
                            Ok(permit) => {
                                if let Some(entry) = heap.pop() {
                                    permit.send(entry.peer);
                                }
                            }
                            // Dial queue gone.
                            Err(_) => break,
                        },
                    }
                }
            }
            trace!(pending = heap.len(), "distance queue stopped");
        });

        (Self { enqueue_tx }, dequeue_rx)
    }

    /// Hand a peer to the queue. Silently dropped once the queue has shut
    /// down; by then the termination path no longer reads the counter.
    pub fn enqueue(&self, peer: PeerId) {
        let _ = self.enqueue_tx.send(peer);
    }
}

fn push(heap: &mut BinaryHeap<HeapEntry>, peer: PeerId, target: &[u8; 32], hasher: KeyHasher) {
    let digest = hasher(peer.as_bytes());
    heap.push(HeapEntry {
        distance: xor_distance(&digest, target),
        digest,
        peer,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn flat_hasher(bytes: &[u8]) -> [u8; 32] {
        let mut out = [0u8; 32];
        let n = bytes.len().min(32);
        out[..n].copy_from_slice(&bytes[..n]);
        out
    }

    fn pid(byte: u8) -> PeerId {
        PeerId::new(vec![byte])
    }

    #[tokio::test]
    async fn heaped_peers_dequeue_in_ascending_distance_order() {
        let scope = CancellationToken::new();
        let (queue, mut rx) = DistanceQueue::spawn(scope.clone(), flat_hasher(&[0x00]), flat_hasher);

        // The first enqueue lands in the single-slot dequeue buffer; the
        // rest heap up behind it and must come out closest-first.
        queue.enqueue(pid(0x08));
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue(pid(0x04));
        queue.enqueue(pid(0x01));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut out = Vec::new();
        for _ in 0..3 {
            let peer = timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("dequeue")
                .expect("open");
            out.push(peer);
        }
        assert_eq!(out, vec![pid(0x08), pid(0x01), pid(0x04)]);
        scope.cancel();
    }

    #[tokio::test]
    async fn late_closer_peer_overtakes_heaped_ones() {
        let scope = CancellationToken::new();
        let (queue, mut rx) = DistanceQueue::spawn(scope.clone(), flat_hasher(&[0x00]), flat_hasher);

        queue.enqueue(pid(0x40));
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue(pid(0x80));
        tokio::time::sleep(Duration::from_millis(10)).await;
        // 0x40 already occupies the buffer; the late arrival beats 0x80,
        // which is still heaped.
        queue.enqueue(pid(0x02));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let first = rx.recv().await.expect("open");
        let second = rx.recv().await.expect("open");
        let third = rx.recv().await.expect("open");

        assert_eq!(first, pid(0x40));
        assert_eq!(second, pid(0x02));
        assert_eq!(third, pid(0x80));
        scope.cancel();
    }

    #[tokio::test]
    async fn cancellation_closes_the_dequeue_side() {
        let scope = CancellationToken::new();
        let (queue, mut rx) = DistanceQueue::spawn(scope.clone(), flat_hasher(&[0x00]), flat_hasher);

        scope.cancel();
        let closed = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("recv returns");
        assert!(closed.is_none());

        // Enqueue after shutdown is silently dropped.
        queue.enqueue(pid(0x01));
    }
}
