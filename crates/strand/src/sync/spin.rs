//! Raw OS-thread spin lock for tiny critical sections.
//!
//! Used where a fiber-level mutex would be circular (the fd-context event
//! mask is updated on the path that parks fibers). Escalates from busy
//! spinning to `yield_now` so a descheduled holder cannot livelock waiters.

use std::sync::atomic::{AtomicBool, Ordering};

const MAX_SPINS: u32 = 50;
const MAX_YIELDS: u32 = 10;

/// Cache-line aligned test-and-set lock.
#[repr(align(64))]
pub struct SpinLock {
    locked: AtomicBool,
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> SpinGuard<'_> {
        for _ in 0..MAX_SPINS {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            std::hint::spin_loop();
        }
        for _ in 0..MAX_YIELDS {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            std::thread::yield_now();
        }
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            std::hint::spin_loop();
        }
    }

    pub fn try_lock(&self) -> Option<SpinGuard<'_>> {
        if !self.locked.swap(true, Ordering::Acquire) {
            Some(SpinGuard { lock: self })
        } else {
            None
        }
    }
}

pub struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}
