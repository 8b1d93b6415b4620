//! Leader Arbiter: a process-wide flag gating which replica drains the
//! Event Queue and runs the watch-side ingester. Non-leaders still serve
//! admission (stateless) and record correlation entries locally.
//!
//! Real leader-election wiring (lease objects, renewal loops) is left to
//! an external elector; this is the seam it flips. Absent one, the
//! default is "leader" — a single-replica deployment behaves exactly as
//! if it won an election.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

pub struct LeaderArbiter {
    flag: AtomicBool,
    tx: watch::Sender<bool>,
}

impl LeaderArbiter {
    pub fn new(initial_leader: bool) -> Self {
        let (tx, _rx) = watch::channel(initial_leader);
        Self {
            flag: AtomicBool::new(initial_leader),
            tx,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Flips the flag. Going from leader to non-leader is a handover
    /// signal, not an instruction to abort in-flight work — callers
    /// watching via `subscribe()` (the dispatcher, the watch-side
    /// ingester) are expected to drain and stop cleanly.
    pub fn set_leader(&self, leader: bool) {
        self.flag.store(leader, Ordering::Release);
        // Only fails if every receiver has been dropped, which is not an
        // error for the setter.
        let _ = self.tx.send(leader);
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for LeaderArbiter {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_leader_absent_an_elector() {
        let arbiter = LeaderArbiter::default();
        assert!(arbiter.is_leader());
    }

    #[tokio::test]
    async fn subscribers_observe_handover() {
        let arbiter = LeaderArbiter::new(true);
        let mut rx = arbiter.subscribe();
        arbiter.set_leader(false);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow());
        assert!(!arbiter.is_leader());
    }
}
