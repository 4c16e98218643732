//! Dial queue: keeps the network pipe warm ahead of the query workers.
//!
//! Drains the XOR-priority input queue, establishes connections through a
//! pluggable [`Dialer`], and hands ready peers to `consume()` calls. The
//! worker pool adapts within fixed bounds: it grows when a consumer
//! arrives and finds nothing ready, and shrinks when dialed peers sit
//! unconsumed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::peer::PeerId;

/// Lower bound of the dial worker pool.
pub(crate) const DIAL_MIN_PARALLELISM: usize = 6;
/// Upper bound of the dial worker pool.
pub(crate) const DIAL_MAX_PARALLELISM: usize = 20;
/// How long a dialed peer may sit unconsumed before the pool shrinks.
const DIAL_MAX_IDLE: Duration = Duration::from_secs(5);
/// Minimum spacing between pool adjustments.
const DIAL_SCALING_MUTE_PERIOD: Duration = Duration::from_secs(1);

/// Establishes a connection to one peer. Implemented by the query runner,
/// which layers pruning and failure bookkeeping on top of the host's
/// connect primitive.
#[async_trait]
pub(crate) trait Dialer: Send + Sync + 'static {
    /// Ok for peers ready to be queried (including already-connected and
    /// pruned peers); Err for failed dials, which the dial queue drops
    /// from the pipeline.
    async fn dial(&self, cancel: CancellationToken, peer: PeerId) -> Result<()>;
}

struct PoolState {
    target: AtomicUsize,
    active: AtomicUsize,
}

impl PoolState {
    /// A worker retires when the pool has shrunk below its head count.
    fn try_retire(&self) -> bool {
        loop {
            let active = self.active.load(Ordering::Acquire);
            let target = self.target.load(Ordering::Acquire);
            if active <= target {
                return false;
            }
            if self
                .active
                .compare_exchange(active, active - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }
}

/// Handle to a running dial queue.
pub(crate) struct DialQueue {
    consume_tx: mpsc::UnboundedSender<oneshot::Sender<PeerId>>,
}

impl DialQueue {
    /// Spawn the control task and the initial worker pool.
    pub fn spawn(
        scope: CancellationToken,
        input: mpsc::Receiver<PeerId>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        let (consume_tx, consume_rx) = mpsc::unbounded_channel();
        let control = DialControl {
            scope: scope.clone(),
            input: Arc::new(Mutex::new(input)),
            dialer,
            pool: Arc::new(PoolState {
                target: AtomicUsize::new(DIAL_MIN_PARALLELISM),
                active: AtomicUsize::new(0),
            }),
            workers: JoinSet::new(),
            ready: VecDeque::new(),
            waiting: VecDeque::new(),
            last_scaled: Instant::now(),
        };
        tokio::spawn(control.run(consume_rx));
        Self { consume_tx }
    }

    /// One-shot receiver for the next ready peer. The receiver closes
    /// without a value once the ambient scope shuts down.
    pub fn consume(&self) -> oneshot::Receiver<PeerId> {
        let (tx, rx) = oneshot::channel();
        // A send failure means the control task is gone; the dropped
        // sender closes `rx`, which is the shutdown signal.
        let _ = self.consume_tx.send(tx);
        rx
    }
}

struct DialControl {
    scope: CancellationToken,
    input: Arc<Mutex<mpsc::Receiver<PeerId>>>,
    dialer: Arc<dyn Dialer>,
    pool: Arc<PoolState>,
    workers: JoinSet<()>,
    // Dialed but not yet consumed, oldest first, with its ready instant.
    ready: VecDeque<(PeerId, Instant)>,
    waiting: VecDeque<oneshot::Sender<PeerId>>,
    last_scaled: Instant,
}

impl DialControl {
    async fn run(mut self, mut consume_rx: mpsc::UnboundedReceiver<oneshot::Sender<PeerId>>) {
        let scope = self.scope.clone();
        let (dialed_tx, mut dialed_rx) = mpsc::channel::<(PeerId, Duration)>(DIAL_MAX_PARALLELISM);

        for _ in 0..DIAL_MIN_PARALLELISM {
            self.spawn_worker(&dialed_tx);
        }

        loop {
            let idle_deadline = self.ready.front().map(|(_, since)| *since + DIAL_MAX_IDLE);
            tokio::select! {
                _ = scope.cancelled() => break,

                request = consume_rx.recv() => {
                    let Some(request) = request else { break };
                    self.handle_consume(request, &dialed_tx);
                }

                dialed = dialed_rx.recv() => {
                    let Some((peer, latency)) = dialed else { break };
                    trace!(peer = %peer, latency_ms = latency.as_millis() as u64, "dial finished");
                    self.handle_dialed(peer);
                }

                _ = idle_sleep(idle_deadline) => {
                    // Dialed peers are piling up unconsumed: over-dialing.
                    self.shrink();
                    if let Some(front) = self.ready.front_mut() {
                        front.1 = Instant::now();
                    }
                }
            }
        }

        // Dropping the pending consume senders closes their receivers,
        // which tells the dispatch loop the queue has shut down.
        self.waiting.clear();
        drop(consume_rx);
        self.pool.target.store(0, Ordering::Release);
        while self.workers.join_next().await.is_some() {}
        debug!("dial queue stopped");
    }

    fn handle_consume(
        &mut self,
        request: oneshot::Sender<PeerId>,
        dialed_tx: &mpsc::Sender<(PeerId, Duration)>,
    ) {
        match self.ready.pop_front() {
            Some((peer, _)) => {
                let _ = request.send(peer);
            }
            None => {
                self.waiting.push_back(request);
                // Consumers are starved: dial harder.
                self.grow(dialed_tx);
            }
        }
    }

    fn handle_dialed(&mut self, peer: PeerId) {
        let mut undelivered = Some(peer);
        while let Some(peer) = undelivered.take() {
            let Some(consumer) = self.waiting.pop_front() else {
                undelivered = Some(peer);
                break;
            };
            // A failed send means the consumer went away; try the next.
            if let Err(back) = consumer.send(peer) {
                undelivered = Some(back);
            }
        }
        if let Some(peer) = undelivered {
            self.ready.push_back((peer, Instant::now()));
        }
    }

    fn grow(&mut self, dialed_tx: &mpsc::Sender<(PeerId, Duration)>) {
        if self.last_scaled.elapsed() < DIAL_SCALING_MUTE_PERIOD {
            return;
        }
        let current = self.pool.target.load(Ordering::Acquire);
        let next = (current * 3 / 2).clamp(DIAL_MIN_PARALLELISM, DIAL_MAX_PARALLELISM);
        if next <= current {
            return;
        }
        self.pool.target.store(next, Ordering::Release);
        self.last_scaled = Instant::now();
        debug!(from = current, to = next, "growing dial pool");
        for _ in current..next {
            self.spawn_worker(dialed_tx);
        }
    }

    fn shrink(&mut self) {
        if self.last_scaled.elapsed() < DIAL_SCALING_MUTE_PERIOD {
            return;
        }
        let current = self.pool.target.load(Ordering::Acquire);
        let next = (current * 2 / 3).max(DIAL_MIN_PARALLELISM);
        if next >= current {
            return;
        }
        // Workers observe the lowered target and retire themselves.
        self.pool.target.store(next, Ordering::Release);
        self.last_scaled = Instant::now();
        debug!(from = current, to = next, "shrinking dial pool");
    }

    fn spawn_worker(&mut self, dialed_tx: &mpsc::Sender<(PeerId, Duration)>) {
        self.pool.active.fetch_add(1, Ordering::AcqRel);
        let pool = self.pool.clone();
        let scope = self.scope.clone();
        let input = self.input.clone();
        let dialer = self.dialer.clone();
        let dialed_tx = dialed_tx.clone();
        self.workers.spawn(async move {
            loop {
                if scope.is_cancelled() || pool.try_retire() {
                    break;
                }
                // Holding the input lock while waiting hands peers out
                // one at a time; the dials themselves overlap across
                // workers.
                let peer = tokio::select! {
                    _ = scope.cancelled() => break,
                    peer = async { input.lock().await.recv().await } => match peer {
                        Some(peer) => peer,
                        None => break,
                    },
                };
                let started = Instant::now();
                match dialer.dial(scope.clone(), peer.clone()).await {
                    Ok(()) => {
                        let _ = dialed_tx.send((peer, started.elapsed())).await;
                    }
                    Err(error) => trace!(peer = %peer, %error, "dial dropped peer"),
                }
            }
        });
    }
}

async fn idle_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;
    use tokio::time::timeout;

    fn pid(byte: u8) -> PeerId {
        PeerId::new(vec![byte])
    }

    #[derive(Default)]
    struct TestDialer {
        refuse: StdMutex<HashSet<PeerId>>,
        dialed: StdMutex<Vec<PeerId>>,
    }

    impl TestDialer {
        fn refuse(&self, peer: PeerId) {
            self.refuse.lock().unwrap().insert(peer);
        }

        fn dialed(&self) -> Vec<PeerId> {
            self.dialed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Dialer for TestDialer {
        async fn dial(&self, _cancel: CancellationToken, peer: PeerId) -> Result<()> {
            self.dialed.lock().unwrap().push(peer.clone());
            if self.refuse.lock().unwrap().contains(&peer) {
                return Err(anyhow!("refused"));
            }
            Ok(())
        }
    }

    fn pipeline(
        scope: &CancellationToken,
        dialer: &Arc<TestDialer>,
    ) -> (mpsc::Sender<PeerId>, DialQueue) {
        let (input_tx, input_rx) = mpsc::channel(16);
        let queue = DialQueue::spawn(scope.clone(), input_rx, dialer.clone() as Arc<dyn Dialer>);
        (input_tx, queue)
    }

    #[tokio::test]
    async fn consume_yields_dialed_peers() {
        let scope = CancellationToken::new();
        let dialer = Arc::new(TestDialer::default());
        let (input_tx, queue) = pipeline(&scope, &dialer);

        input_tx.send(pid(1)).await.unwrap();
        let peer = timeout(Duration::from_secs(1), queue.consume())
            .await
            .expect("ready in time")
            .expect("open");
        assert_eq!(peer, pid(1));
        assert_eq!(dialer.dialed(), vec![pid(1)]);
        scope.cancel();
    }

    #[tokio::test]
    async fn failed_dials_are_not_emitted() {
        let scope = CancellationToken::new();
        let dialer = Arc::new(TestDialer::default());
        dialer.refuse(pid(1));
        let (input_tx, queue) = pipeline(&scope, &dialer);

        input_tx.send(pid(1)).await.unwrap();
        input_tx.send(pid(2)).await.unwrap();

        // The refused peer is swallowed; the next good dial comes out.
        let peer = timeout(Duration::from_secs(1), queue.consume())
            .await
            .expect("ready in time")
            .expect("open");
        assert_eq!(peer, pid(2));
        scope.cancel();
    }

    #[tokio::test]
    async fn dials_ahead_of_consumers() {
        let scope = CancellationToken::new();
        let dialer = Arc::new(TestDialer::default());
        let (input_tx, queue) = pipeline(&scope, &dialer);

        input_tx.send(pid(1)).await.unwrap();
        input_tx.send(pid(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Both were dialed speculatively before anyone consumed.
        assert_eq!(dialer.dialed().len(), 2);
        let first = queue.consume().await.expect("open");
        let second = queue.consume().await.expect("open");
        assert_eq!(
            {
                let mut got = vec![first, second];
                got.sort();
                got
            },
            vec![pid(1), pid(2)]
        );
        scope.cancel();
    }

    #[tokio::test]
    async fn cancellation_closes_consume_receivers() {
        let scope = CancellationToken::new();
        let dialer = Arc::new(TestDialer::default());
        let (_input_tx, queue) = pipeline(&scope, &dialer);

        let pending = queue.consume();
        scope.cancel();
        assert!(
            timeout(Duration::from_secs(1), pending)
                .await
                .expect("closes in time")
                .is_err()
        );
        // Requests after shutdown are closed immediately too, once the
        // control task has wound down.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(queue.consume().await.is_err());
    }
}
