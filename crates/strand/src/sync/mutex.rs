//! Fiber-level mutex.
//!
//! Protects fiber-level critical sections without ever blocking an OS
//! thread: a loser of the acquire CAS parks on the wait queue and another
//! fiber runs in its place. Fairness is not guaranteed; notified waiters
//! race with the next arriving locker.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::fiber;
use crate::sync::WaitQueue;
use crate::Error;

/// A mutual-exclusion lock usable only from fibers.
pub struct Mutex {
    locked: AtomicBool,
    /// Fiber id of the holder; 0 when free. Checked on unlock in debug
    /// builds; the locked-state check is unconditional.
    owner: AtomicU64,
    waiters: WaitQueue,
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    pub fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner: AtomicU64::new(0),
            waiters: WaitQueue::new(),
        }
    }

    /// Acquires the lock, parking the calling fiber while it is contended.
    pub fn lock(&self) {
        loop {
            if self.try_lock() {
                return;
            }
            // Re-check after the queue entry is visible so an unlock racing
            // with the park cannot strand us.
            self.waiters.wait_or(|| !self.locked.load(Ordering::Acquire));
        }
    }

    /// Single CAS attempt; never parks.
    pub fn try_lock(&self) -> bool {
        let Some(current) = fiber::current() else {
            tracing::error!("Mutex::try_lock called outside of a fiber");
            return false;
        };
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner.store(current.id(), Ordering::Release);
            return true;
        }
        false
    }

    /// Releases the lock and wakes one waiter.
    ///
    /// Unlocking a mutex that is not locked is always detected; unlocking
    /// one held by a different fiber asserts in debug builds.
    pub fn unlock(&self) -> Result<(), Error> {
        if !self.locked.load(Ordering::Acquire) {
            tracing::error!("unlock of an unlocked mutex");
            return Err(Error::InvalidState("unlock of an unlocked mutex"));
        }
        #[cfg(debug_assertions)]
        {
            let current = fiber::current().map(|f| f.id()).unwrap_or(0);
            debug_assert_eq!(
                self.owner.load(Ordering::Acquire),
                current,
                "unlock of a mutex held by another fiber"
            );
        }
        self.owner.store(0, Ordering::Release);
        if !self.locked.swap(false, Ordering::Release) {
            tracing::error!("unlock raced with another unlock");
            return Err(Error::InvalidState("unlock of an unlocked mutex"));
        }
        self.waiters.notify_one();
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Whether the calling fiber holds the lock.
    pub fn is_locked_by_current(&self) -> bool {
        if !self.is_locked() {
            return false;
        }
        fiber::current()
            .map(|f| f.id() == self.owner.load(Ordering::Acquire))
            .unwrap_or(false)
    }
}
