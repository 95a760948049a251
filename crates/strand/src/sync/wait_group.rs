//! Go-style wait group for fanning out fibers and waiting for the set.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::sync::WaitQueue;
use crate::Error;

/// Counts outstanding work; `wait` parks until the counter reaches zero.
pub struct WaitGroup {
    counter: AtomicI64,
    waiters: WaitQueue,
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitGroup {
    pub fn new() -> Self {
        Self {
            counter: AtomicI64::new(0),
            waiters: WaitQueue::new(),
        }
    }

    /// Adjusts the counter by `delta` (may be negative). Driving the counter
    /// negative rolls the change back and reports `InvalidState`. A
    /// transition to zero wakes every waiter.
    pub fn add(&self, delta: i64) -> Result<(), Error> {
        let old = self.counter.fetch_add(delta, Ordering::AcqRel);
        let new = old + delta;
        if new < 0 {
            self.counter.fetch_sub(delta, Ordering::Release);
            return Err(Error::InvalidState("wait-group counter went negative"));
        }
        if new == 0 {
            self.waiters.notify_all();
        }
        Ok(())
    }

    /// Marks one unit of work finished.
    pub fn done(&self) {
        if let Err(e) = self.add(-1) {
            tracing::error!("WaitGroup::done underflow: {e}");
        }
    }

    /// Parks the calling fiber until the counter reaches zero. Returns
    /// immediately if it already is.
    pub fn wait(&self) {
        while self.count() != 0 {
            self.waiters.wait_or(|| self.count() == 0);
        }
    }

    pub fn count(&self) -> i64 {
        self.counter.load(Ordering::Acquire)
    }
}
