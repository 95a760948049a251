//! Per-fd state: the armed-event mask and the read/write wait lists.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::driver::ready::{Direction, Ready};
use crate::sync::spin::{SpinGuard, SpinLock};
use crate::sync::WaitQueue;

/// Bundle tracked for every fd with at least one armed event. Created on
/// first registration, dropped when the last armed event is cleared.
pub(crate) struct FdContext {
    /// Serializes mask read-modify-write together with the poller
    /// registration call that publishes it.
    fd_mu: SpinLock,
    events: AtomicU8,
    read_waiters: WaitQueue,
    write_waiters: WaitQueue,
}

impl FdContext {
    pub(crate) fn new() -> Self {
        Self {
            fd_mu: SpinLock::new(),
            events: AtomicU8::new(0),
            read_waiters: WaitQueue::new(),
            write_waiters: WaitQueue::new(),
        }
    }

    pub(crate) fn lock(&self) -> SpinGuard<'_> {
        self.fd_mu.lock()
    }

    pub(crate) fn events(&self) -> Ready {
        match self.events.load(Ordering::Acquire) {
            0b01 => Ready::READABLE,
            0b10 => Ready::WRITABLE,
            0b11 => Ready::ALL,
            _ => Ready::EMPTY,
        }
    }

    pub(crate) fn set_events(&self, ready: Ready) {
        let raw = match (ready.is_readable(), ready.is_writable()) {
            (true, true) => 0b11,
            (true, false) => 0b01,
            (false, true) => 0b10,
            (false, false) => 0,
        };
        self.events.store(raw, Ordering::Release);
    }

    pub(crate) fn waiters(&self, direction: Direction) -> &WaitQueue {
        match direction {
            Direction::Read => &self.read_waiters,
            Direction::Write => &self.write_waiters,
        }
    }

    /// Wakes every fiber parked on the matching directions. Returns how many
    /// were re-enqueued.
    pub(crate) fn wake(&self, ready: Ready) -> usize {
        let mut woken = 0;
        if ready.is_readable() {
            woken += self.read_waiters.notify_all();
        }
        if ready.is_writable() {
            woken += self.write_waiters.notify_all();
        }
        woken
    }

    /// Both wait lists drained and nothing armed.
    pub(crate) fn is_idle(&self) -> bool {
        self.events().is_empty() && self.read_waiters.is_empty() && self.write_waiters.is_empty()
    }
}
