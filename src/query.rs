//! The query engine: recurse-then-finish iterative lookups.
//!
//! A [`Query`] explores the network from a seed set, interrogating peers
//! in parallel and following closer-peer referrals until the outstanding
//! work runs out, then optionally performs a terminal action against the
//! K closest survivors.
//!
//! ## Pipeline
//!
//! Discovered peers flow through a XOR-priority queue into the dial
//! queue, which keeps connections warm ahead of the query workers. At
//! most `alpha` per-peer queries run at once, enforced by a semaphore;
//! the dial pool overlaps additional connects underneath. Termination is
//! driven by the outstanding-work counter, or by the ambient
//! cancellation token.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::counter::PendingCounter;
use crate::dial::{DialQueue, Dialer};
use crate::error::QueryError;
use crate::events::{self, QueryEvent};
use crate::peer::{Key, KeyHasher, PeerId, PeerInfo, blake3_hasher, sort_closest};
use crate::peerset::{NearestPeers, PeerSet};
use crate::queue::DistanceQueue;
use crate::traits::{
    Connectedness, FinishAction, HostNetwork, PeerReply, Peerstore, QueryFn, TEMP_ADDR_TTL,
};

/// Default concurrency factor (Kademlia α): simultaneous in-flight
/// per-peer queries, and the capacity of the best-peers tracker.
pub const DEFAULT_ALPHA: usize = 3;

/// Default result-set size (Kademlia K).
pub const DEFAULT_K: usize = 20;

/// Default extra finish-phase fan-out. Dispatching to `k + slop` peers
/// while waiting for only `k` successes tolerates that many unreachable
/// peers without a second round.
pub const DEFAULT_SLOP: usize = 4;

/// Tuning knobs for a query.
#[derive(Debug, Clone, Copy)]
pub struct QueryConfig {
    /// Concurrency factor: in-flight per-peer queries and tracker capacity.
    pub alpha: usize,
    /// Target result-set size.
    pub k: usize,
    /// Finish-phase over-dispatch beyond `k`.
    pub slop: usize,
    /// Digest used for XOR-metric comparisons.
    pub key_hasher: KeyHasher,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            k: DEFAULT_K,
            slop: DEFAULT_SLOP,
            key_hasher: blake3_hasher,
        }
    }
}

/// One iterative lookup against a target key.
///
/// The query is not reusable across runs: each call to [`Query::recurse`]
/// builds a fresh runner and discards it when the phase ends.
pub struct Query<H: HostNetwork + Peerstore> {
    local: PeerId,
    key: Key,
    key_digest: [u8; 32],
    host: Arc<H>,
    query_fn: Arc<dyn QueryFn>,
    events: broadcast::Sender<QueryEvent>,
    config: QueryConfig,
}

impl<H: HostNetwork + Peerstore> Query<H> {
    pub fn new(
        local: PeerId,
        key: Key,
        host: Arc<H>,
        query_fn: Arc<dyn QueryFn>,
        mut config: QueryConfig,
    ) -> Self {
        config.alpha = config.alpha.max(1);
        let key_digest = (config.key_hasher)(key.as_bytes());
        Self {
            local,
            key,
            key_digest,
            host,
            query_fn,
            events: events::channel(),
            config,
        }
    }

    /// Observe the query's advisory event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<QueryEvent> {
        self.events.subscribe()
    }

    /// Sender half of the event stream, for per-peer functions that want
    /// to publish their own events alongside the engine's.
    pub fn events(&self) -> broadcast::Sender<QueryEvent> {
        self.events.clone()
    }

    /// Run both phases: recurse to convergence, then finish against the K
    /// closest survivors.
    pub async fn run(&self, cancel: &CancellationToken, seeds: &[PeerId]) -> Result<Vec<PeerId>> {
        match self.recurse(cancel, seeds).await? {
            Some(result) => result.finish(cancel).await,
            None => Ok(Vec::new()),
        }
    }

    /// Expand the seen set from `seeds` by querying peers and following
    /// referrals until the outstanding work runs out.
    ///
    /// Returns `Ok(None)` for an empty seed set. Per-peer failures are
    /// never fatal; the first accumulated error surfaces only if every
    /// seen peer failed. External cancellation yields
    /// [`QueryError::Cancelled`].
    pub async fn recurse(
        &self,
        cancel: &CancellationToken,
        seeds: &[PeerId],
    ) -> Result<Option<RecurseResult>> {
        if cancel.is_cancelled() {
            return Err(QueryError::Cancelled.into());
        }
        if seeds.is_empty() {
            warn!(key = ?self.key, "recursing with no seed peers");
            return Ok(None);
        }

        let scope = cancel.child_token();
        let (to_query, dial_input) =
            DistanceQueue::spawn(scope.clone(), self.key_digest, self.config.key_hasher);

        let runner = Arc::new(QueryRunner {
            local: self.local.clone(),
            host: self.host.clone(),
            query_fn: self.query_fn.clone(),
            events: self.events.clone(),
            seen: PeerSet::new(),
            queried: PeerSet::new(),
            failed: PeerSet::new(),
            nearest: NearestPeers::new(self.config.alpha, self.key_digest, self.config.key_hasher),
            remaining: PendingCounter::new(),
            to_query,
            errors: Mutex::new(Vec::new()),
            scope: scope.clone(),
        });

        let dial_queue = DialQueue::spawn(
            scope.clone(),
            dial_input,
            runner.clone() as Arc<dyn Dialer>,
        );
        let permits = Arc::new(Semaphore::new(self.config.alpha));

        for seed in seeds {
            runner.add_peer_to_query(seed.clone());
        }

        let mut workers = JoinSet::new();
        runner
            .clone()
            .dispatch(&dial_queue, &permits, &mut workers)
            .await;

        // Tear the pipeline down before collecting results. On the
        // success path no workers remain (the counter hit zero); on the
        // cancellation path in-flight workers drain through their counter
        // guards before the join completes.
        scope.cancel();
        while workers.join_next().await.is_some() {}

        if cancel.is_cancelled() {
            return Err(QueryError::Cancelled.into());
        }

        let result = RecurseResult {
            seen: runner.seen.snapshot(),
            queried: runner.queried.snapshot(),
            failed: runner.failed.snapshot(),
            key_digest: self.key_digest,
            query_fn: self.query_fn.clone(),
            config: self.config,
        };

        // If every peer the query ever saw produced an error, surface the
        // first one. Peers pruned by the tracker count toward seen here,
        // the same set the snapshot exposes.
        let first_error = runner.errors.lock().ok().and_then(|mut errors| {
            if !errors.is_empty() && errors.len() == result.seen.len() {
                Some(errors.remove(0))
            } else {
                None
            }
        });
        if let Some(error) = first_error {
            debug!(%error, seen = result.seen.len(), "every seen peer failed");
            return Err(error);
        }

        debug!(
            seen = result.seen.len(),
            queried = result.queried.len(),
            failed = result.failed.len(),
            "recurse complete"
        );
        Ok(Some(result))
    }
}

struct QueryRunner<H: HostNetwork + Peerstore> {
    local: PeerId,
    host: Arc<H>,
    query_fn: Arc<dyn QueryFn>,
    events: broadcast::Sender<QueryEvent>,
    seen: PeerSet,
    queried: PeerSet,
    failed: PeerSet,
    nearest: NearestPeers,
    remaining: PendingCounter,
    to_query: DistanceQueue,
    errors: Mutex<Vec<anyhow::Error>>,
    scope: CancellationToken,
}

impl<H: HostNetwork + Peerstore> QueryRunner<H> {
    /// Feed ready peers to query workers until the work runs out or the
    /// scope closes. At most `alpha` workers run at once.
    async fn dispatch(
        self: Arc<Self>,
        dial_queue: &DialQueue,
        permits: &Arc<Semaphore>,
        workers: &mut JoinSet<()>,
    ) {
        loop {
            tokio::select! {
                _ = self.remaining.done() => return,
                _ = self.scope.cancelled() => return,
                permit = Arc::clone(permits).acquire_owned() => {
                    // The semaphore is never closed while the runner lives.
                    let Ok(permit) = permit else { return };
                    let ready = dial_queue.consume();
                    tokio::select! {
                        _ = self.scope.cancelled() => return,
                        _ = self.remaining.done() => return,
                        peer = ready => match peer {
                            Ok(peer) => {
                                let worker = self.clone();
                                let task_cancel = self.scope.child_token();
                                workers.spawn(async move {
                                    worker.query_peer(task_cancel, peer, permit).await;
                                });
                            }
                            // Closed consume channel: the scope shut down.
                            Err(_) => return,
                        },
                    }
                }
            }
        }
    }

    async fn query_peer(
        self: Arc<Self>,
        cancel: CancellationToken,
        peer: PeerId,
        _permit: OwnedSemaphorePermit,
    ) {
        // Decrements exactly once on every exit path below; the permit
        // frees a worker slot at the same moment.
        let _pending = self.remaining.guard();

        // Conditions may have shifted since this peer was enqueued.
        if !self.nearest.check(&peer) {
            trace!(peer = %peer, "pruned before query");
            return;
        }

        self.queried.try_add(&peer);

        match self.query_fn.query(cancel, peer.clone()).await {
            Ok(reply) => {
                self.nearest.add(&peer);
                let closer = match reply {
                    PeerReply::Closer(peers) => peers,
                    PeerReply::Value(_) => Vec::new(),
                };
                if closer.is_empty() {
                    trace!(peer = %peer, "no closer peers");
                }
                for info in closer {
                    if info.id == self.local {
                        trace!(peer = %peer, "referred us to ourselves, skipping");
                        continue;
                    }
                    self.host.add_addresses(&info.id, &info.addrs, TEMP_ADDR_TTL);
                    self.add_peer_to_query(info.id);
                }
            }
            Err(error) => {
                debug!(peer = %peer, %error, "query failed");
                self.failed.try_add(&peer);
                self.record_error(error);
            }
        }
    }

    /// Admission gate for every peer entering the query, seeds and
    /// referrals alike. A peer that passes the tracker check is counted
    /// as outstanding work and must later decrement exactly once, either
    /// through `query_peer` or through the dial-failure path.
    fn add_peer_to_query(&self, peer: PeerId) {
        if peer == self.local {
            trace!("skipping ourselves");
            return;
        }
        if !self.seen.try_add(&peer) {
            return;
        }
        let _ = self.events.send(QueryEvent::AddingPeer { peer: peer.clone() });
        if !self.nearest.check(&peer) {
            // Cannot improve the result set; never enters the pipeline.
            return;
        }
        self.remaining.increment(1);
        self.to_query.enqueue(peer);
    }

    fn record_error(&self, error: anyhow::Error) {
        if let Ok(mut errors) = self.errors.lock() {
            errors.push(error);
        }
    }
}

#[async_trait]
impl<H: HostNetwork + Peerstore> Dialer for QueryRunner<H> {
    async fn dial(&self, cancel: CancellationToken, peer: PeerId) -> Result<()> {
        if !self.nearest.check(&peer) {
            // Not worth a connection; the query phase will skip it too.
            return Ok(());
        }
        if self.host.connectedness(&peer) == Connectedness::Connected {
            return Ok(());
        }

        debug!(peer = %peer, "not connected, dialing");
        let _ = self.events.send(QueryEvent::DialingPeer { peer: peer.clone() });

        match self
            .host
            .connect(cancel, PeerInfo::new(peer.clone()))
            .await
        {
            Ok(()) => {
                trace!(peer = %peer, "dial succeeded");
                Ok(())
            }
            Err(error) => {
                debug!(peer = %peer, %error, "dial failed");
                let message = error.to_string();
                let _ = self.events.send(QueryEvent::QueryError {
                    peer: peer.clone(),
                    message: message.clone(),
                });
                self.record_error(error);
                self.failed.try_add(&peer);
                // The peer drops out of the race here and never reaches a
                // query worker, so this path owns its counter decrement.
                self.remaining.decrement(1);
                Err(anyhow!(message))
            }
        }
    }
}

/// Frozen snapshot of a completed recurse phase.
///
/// The sets are immutable copies taken after every worker exited; the
/// finish phase reads them without further synchronization.
pub struct RecurseResult {
    pub seen: Vec<PeerId>,
    pub queried: Vec<PeerId>,
    pub failed: Vec<PeerId>,
    key_digest: [u8; 32],
    query_fn: Arc<dyn QueryFn>,
    config: QueryConfig,
}

impl std::fmt::Debug for RecurseResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecurseResult")
            .field("seen", &self.seen)
            .field("queried", &self.queried)
            .field("failed", &self.failed)
            .field("key_digest", &self.key_digest)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RecurseResult {
    /// Finish by re-running the per-peer function against the K closest
    /// survivors, skipping the round trip for peers the recurse phase
    /// already queried successfully.
    pub async fn finish(&self, cancel: &CancellationToken) -> Result<Vec<PeerId>> {
        self.finish_inner(cancel, None).await
    }

    /// Finish with a dedicated action (store, announce) against the K
    /// closest survivors.
    pub async fn finish_with(
        &self,
        cancel: &CancellationToken,
        action: Arc<dyn FinishAction>,
    ) -> Result<Vec<PeerId>> {
        self.finish_inner(cancel, Some(action)).await
    }

    async fn finish_inner(
        &self,
        cancel: &CancellationToken,
        action: Option<Arc<dyn FinishAction>>,
    ) -> Result<Vec<PeerId>> {
        let failed: HashSet<&PeerId> = self.failed.iter().collect();
        let succeeded: HashSet<&PeerId> = self
            .queried
            .iter()
            .filter(|peer| !failed.contains(*peer))
            .collect();

        let survivors: Vec<PeerId> = self
            .seen
            .iter()
            .filter(|peer| !failed.contains(*peer))
            .cloned()
            .collect();
        let mut closest: VecDeque<PeerId> =
            sort_closest(survivors, &self.key_digest, self.config.key_hasher).into();

        let k = self.config.k;
        let sloppy_k = k + self.config.slop;

        // With no dedicated action we re-send the query itself, which
        // lets already-queried peers skip the extra round trip below.
        let dedicated_action = action.is_some();
        let action: Arc<dyn FinishAction> = match action {
            Some(action) => action,
            None => Arc::new(RequeryAction {
                query_fn: self.query_fn.clone(),
            }),
        };

        let scope = cancel.child_token();
        let (work_tx, work_rx) = mpsc::channel::<PeerId>(1);
        let (result_tx, mut result_rx) = mpsc::channel::<PeerId>(sloppy_k);
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));

        let mut workers = JoinSet::new();
        for _ in 0..sloppy_k {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            let action = action.clone();
            let task_cancel = scope.clone();
            workers.spawn(async move {
                // Each worker retires after its first success.
                loop {
                    let peer = { work_rx.lock().await.recv().await };
                    let Some(peer) = peer else { return };
                    if action.apply(task_cancel.clone(), peer.clone()).await.is_ok() {
                        let _ = result_tx.send(peer).await;
                        return;
                    }
                }
            });
        }
        // Workers now hold the only result senders, so `recv` yields
        // `None` exactly when all of them have exited.
        drop(result_tx);

        let mut bucket = Vec::with_capacity(k);
        let mut workers_done = false;
        while bucket.len() < k && !closest.is_empty() {
            let already_succeeded = !dedicated_action
                && closest
                    .front()
                    .map(|front| succeeded.contains(front))
                    .unwrap_or(false);
            if already_succeeded {
                if let Some(front) = closest.pop_front() {
                    bucket.push(front);
                }
                continue;
            }

            tokio::select! {
                permit = work_tx.reserve() => match permit {
                    Ok(permit) => {
                        if let Some(front) = closest.pop_front() {
                            permit.send(front);
                        }
                    }
                    Err(_) => break,
                },
                received = result_rx.recv() => match received {
                    Some(peer) => bucket.push(peer),
                    None => {
                        workers_done = true;
                        break;
                    }
                },
            }
        }

        // No more dispatches; remaining workers drain out.
        drop(work_tx);

        if !workers_done {
            while bucket.len() < k {
                match result_rx.recv().await {
                    Some(peer) => bucket.push(peer),
                    None => break,
                }
            }
        }

        scope.cancel();
        while workers.join_next().await.is_some() {}

        if cancel.is_cancelled() {
            return Err(QueryError::Cancelled.into());
        }
        Ok(bucket)
    }
}

/// Fallback finish action: re-send the query and discard its result.
struct RequeryAction {
    query_fn: Arc<dyn QueryFn>,
}

#[async_trait]
impl FinishAction for RequeryAction {
    async fn apply(&self, cancel: CancellationToken, peer: PeerId) -> Result<()> {
        self.query_fn.query(cancel, peer).await.map(|_| ())
    }
}
