//! Ordered parking lot of fibers blocked on one condition.
//!
//! A thin typed wrapper over the lock-free FIFO. Notify never runs the woken
//! fiber inline; it re-inserts it into its worker's ready queue through the
//! scheduler, which avoids unbounded stack growth and cross-thread context
//! switches.
//!
//! Entries are tokens, not bare fiber handles. A token's one-shot state CAS
//! arbitrates between the notifier, a timer wake, and a waiter that found its
//! condition satisfied before parking, so exactly one path ever observes
//! "I woke this fiber" and a fiber is only ever re-enqueued once per park.
//! The fiber's state is flipped to `Blocked` before its token is published:
//! a notifier that pops a token therefore never sees a still-running fiber,
//! and the schedule it issues lands on the fiber's own worker, which cannot
//! pop it until the fiber has switched out.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::fiber::{self, FiberHandle, FiberState};
use crate::runtime::{current_worker, scheduler};
use crate::sync::queue::Queue;

const WAITING: u8 = 0;
const NOTIFIED: u8 = 1;
const CANCELLED: u8 = 2;

/// One parked-fiber entry. Holds a strong reference to the fiber; nothing on
/// the fiber side holds a strong reference back to the queue.
pub(crate) struct WaitToken {
    fiber: FiberHandle,
    state: AtomicU8,
}

impl WaitToken {
    fn new(fiber: FiberHandle) -> Arc<Self> {
        Arc::new(Self {
            fiber,
            state: AtomicU8::new(WAITING),
        })
    }

    /// Claims the wake. The winner must re-enqueue the fiber.
    pub(crate) fn try_notify(&self) -> bool {
        self.state
            .compare_exchange(WAITING, NOTIFIED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Withdraws the entry before parking. Fails if a notifier got there
    /// first, in which case the waiter must park to absorb the wake.
    pub(crate) fn try_cancel(&self) -> bool {
        self.state
            .compare_exchange(WAITING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Still parked: neither notified nor cancelled.
    pub(crate) fn is_waiting(&self) -> bool {
        self.state.load(Ordering::Acquire) == WAITING
    }

    pub(crate) fn fiber(&self) -> &FiberHandle {
        &self.fiber
    }
}

/// FIFO of fibers parked on a single condition.
pub struct WaitQueue {
    waiters: Queue<Arc<WaitToken>>,
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            waiters: Queue::new(),
        }
    }

    /// Parks the current fiber until a notify wakes it.
    ///
    /// Must be called from within a fiber.
    pub fn wait(&self) {
        self.wait_or(|| false);
    }

    /// Parks the current fiber unless `cancel` reports that the awaited
    /// condition became true after enqueueing. Re-checking after the entry is
    /// visible closes the window where a notify lands between the caller's
    /// last condition check and the park.
    pub fn wait_or(&self, cancel: impl FnOnce() -> bool) {
        let token = self.prepare();
        if cancel() && token.try_cancel() {
            // Nobody saw the entry; undo the early park state.
            token.fiber().set_state(FiberState::Running);
            return;
        }
        fiber::block_yield();
    }

    /// Enqueues the current fiber and hands back the token without parking.
    /// The caller must follow up with `fiber::block_yield()`; used where work
    /// has to happen between enqueue and park (condition variables release
    /// their mutex in between).
    ///
    /// The fiber is marked `Blocked` before the token is published, and the
    /// token is recorded with the owning worker so a stopping runtime can
    /// force-wake it.
    pub(crate) fn prepare(&self) -> Arc<WaitToken> {
        let current = fiber::current().expect("WaitQueue::wait called outside of a fiber");
        current.set_state(FiberState::Blocked);
        let token = WaitToken::new(current);
        self.waiters.push_back(token.clone());
        if let Some(worker) = current_worker() {
            worker.register_parked(token.clone());
        }
        token
    }

    /// Wakes one parked fiber by re-enqueueing it on its worker. Returns
    /// whether anyone was woken.
    pub fn notify_one(&self) -> bool {
        while let Some(token) = self.waiters.pop_front() {
            if token.try_notify() {
                scheduler().schedule(token.fiber().clone());
                return true;
            }
            // Stale entry (cancelled or already woken elsewhere); skip it.
        }
        false
    }

    /// Wakes every parked fiber. Returns the number woken.
    pub fn notify_all(&self) -> usize {
        let mut count = 0;
        while let Some(token) = self.waiters.pop_front() {
            if token.try_notify() {
                scheduler().schedule(token.fiber().clone());
                count += 1;
            }
        }
        count
    }

    /// Advisory emptiness check.
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}
