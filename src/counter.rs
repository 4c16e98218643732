//! Outstanding-work counter that drives recurse termination.

use tokio::sync::watch;

/// Counts peers that sit in the input queue or are currently being dialed
/// or queried. The recurse phase ends when this returns to zero.
///
/// `done()` is level-triggered: it resolves whenever the value is zero,
/// including a counter that was never incremented (a query whose every
/// seed was filtered out terminates immediately instead of hanging).
///
/// Every increment must be paired with exactly one decrement; a missed
/// decrement stalls the query forever and a double decrement ends it
/// early. [`PendingCounter::guard`] makes the pairing explicit on the
/// query-worker path.
pub(crate) struct PendingCounter {
    value: watch::Sender<u64>,
}

impl PendingCounter {
    pub fn new() -> Self {
        Self {
            value: watch::channel(0u64).0,
        }
    }

    pub fn increment(&self, n: u64) {
        self.value.send_modify(|v| *v += n);
    }

    pub fn decrement(&self, n: u64) {
        self.value.send_modify(|v| {
            debug_assert!(*v >= n, "outstanding-work counter underflow");
            *v = v.saturating_sub(n);
        });
    }

    #[cfg(test)]
    pub fn get(&self) -> u64 {
        *self.value.borrow()
    }

    /// Resolves once the counter sits at zero.
    pub async fn done(&self) {
        let mut rx = self.value.subscribe();
        loop {
            if *rx.borrow_and_update() == 0 {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// RAII decrement: releases exactly one unit when dropped, on every
    /// exit path.
    pub fn guard(&self) -> PendingGuard<'_> {
        PendingGuard { counter: self }
    }
}

pub(crate) struct PendingGuard<'a> {
    counter: &'a PendingCounter,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.counter.decrement(1);
    }
}
