//! Fiber-level condition variable, paired with [`Mutex`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::fiber::{self, FiberState};
use crate::runtime::{current_worker, scheduler};
use crate::sync::{Mutex, WaitQueue};
use crate::Error;

/// Condition variable: park under a held mutex, resume holding it again.
pub struct Condition {
    waiters: WaitQueue,
}

impl Default for Condition {
    fn default() -> Self {
        Self::new()
    }
}

impl Condition {
    pub fn new() -> Self {
        Self {
            waiters: WaitQueue::new(),
        }
    }

    /// Releases `mutex`, parks until notified, reacquires `mutex`.
    ///
    /// The wait-queue entry is published before the unlock, so a notify
    /// issued the instant the mutex is released cannot be missed.
    pub fn wait(&self, mutex: &Mutex) -> Result<(), Error> {
        if !mutex.is_locked_by_current() {
            return Err(Error::InvalidState("Condition::wait without holding the mutex"));
        }
        let token = self.waiters.prepare();
        if let Err(e) = mutex.unlock() {
            // Withdraw the entry; if a notifier beat the withdrawal, park to
            // absorb the wake it already issued.
            if token.try_cancel() {
                token.fiber().set_state(FiberState::Running);
            } else {
                fiber::block_yield();
            }
            return Err(e);
        }
        fiber::block_yield();
        mutex.lock();
        Ok(())
    }

    /// Like [`Condition::wait`] but bounded by `timeout_ms`.
    ///
    /// Returns `Ok(true)` when woken by a notify, `Ok(false)` on timeout.
    /// The timer callback and `notify_*` race on the entry's one-shot state;
    /// whichever loses becomes a no-op (the timer side a cheap cancellation).
    pub fn wait_for(&self, mutex: &Mutex, timeout_ms: u64) -> Result<bool, Error> {
        if !mutex.is_locked_by_current() {
            return Err(Error::InvalidState("Condition::wait_for without holding the mutex"));
        }
        let worker =
            current_worker().ok_or(Error::InvalidState("Condition::wait_for outside the runtime"))?;

        let token = self.waiters.prepare();
        let timed_out = Arc::new(AtomicBool::new(false));
        let timer = {
            let token = token.clone();
            let timed_out = timed_out.clone();
            worker.timer().add_timer(
                timeout_ms,
                move || {
                    if token.try_notify() {
                        timed_out.store(true, Ordering::Release);
                        scheduler().schedule(token.fiber().clone());
                    }
                },
                false,
            )
        };

        if let Err(e) = mutex.unlock() {
            if let Some(timer) = &timer {
                timer.cancel();
            }
            if token.try_cancel() {
                token.fiber().set_state(FiberState::Running);
            } else {
                fiber::block_yield();
            }
            return Err(e);
        }
        fiber::block_yield();

        let notified = !timed_out.load(Ordering::Acquire);
        if notified {
            if let Some(timer) = timer {
                timer.cancel();
            }
        }
        mutex.lock();
        Ok(notified)
    }

    /// Wakes one waiter.
    pub fn notify_one(&self) -> bool {
        self.waiters.notify_one()
    }

    /// Wakes every waiter.
    pub fn notify_all(&self) -> usize {
        self.waiters.notify_all()
    }
}
