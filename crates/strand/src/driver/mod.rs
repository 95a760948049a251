//! I/O readiness manager.
//!
//! One instance per worker, wrapping an edge-triggered poller. Suspending a
//! fiber on an fd means arming the event, appending the fiber to the fd's
//! wait list, and yielding; the owning worker's poll loop turns readiness
//! back into scheduler wakeups.
//!
//! Readiness is delivered only on level transitions, so a resumed fiber must
//! drain its syscall until `EAGAIN` before parking again; the I/O facade
//! enforces that contract.
//!
//! Registration and polling stay on the owning worker. The fd table itself
//! is a concurrent map so that `close`/`wake_up` issued from a fiber pinned
//! elsewhere can still find the wait lists; the wakeups they trigger travel
//! through the scheduler, which is already cross-worker safe.

pub(crate) mod ready;
pub(crate) mod scheduled_io;

pub use ready::{Direction, Ready};

use std::cell::UnsafeCell;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use mio::unix::SourceFd;
use mio::{Events, Poll, Registry, Token, Waker};

use scheduled_io::FdContext;

const WAKE_TOKEN: Token = Token(usize::MAX);

/// Per-worker readiness manager.
pub struct IoManager {
    /// Poller and its event buffer; only the owning worker touches these.
    poll: UnsafeCell<Poll>,
    events: UnsafeCell<Events>,
    registry: Registry,
    waker: Arc<Waker>,
    contexts: DashMap<RawFd, Arc<FdContext>>,
    running: AtomicBool,
}

// SAFETY: poll/events are only dereferenced by the owning worker thread
// (single poller invariant); registry, waker and the context map are
// thread-safe by construction.
unsafe impl Send for IoManager {}
unsafe impl Sync for IoManager {}

impl IoManager {
    pub(crate) fn new(event_batch: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        Ok(Self {
            poll: UnsafeCell::new(poll),
            events: UnsafeCell::new(Events::with_capacity(event_batch.max(1))),
            registry,
            waker,
            contexts: DashMap::new(),
            running: AtomicBool::new(true),
        })
    }

    /// Stops accepting new event registrations. Wakeups, deregistration, and
    /// polling keep working so parked fibers can be cleaned out.
    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Arms `direction` for `fd` and appends the current fiber to the
    /// matching wait list. Must be called from a fiber; the caller parks with
    /// `block_yield` right after. Returns false when registration fails.
    pub(crate) fn add_event(&self, fd: RawFd, direction: Direction) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        let ctx = self
            .contexts
            .entry(fd)
            .or_insert_with(|| Arc::new(FdContext::new()))
            .clone();

        {
            let _guard = ctx.lock();
            let old = ctx.events();
            let new = old | direction.mask();
            if old.is_empty() {
                let interest = new.to_interest().expect("new mask cannot be empty");
                if let Err(e) = self.registry.register(&mut SourceFd(&fd), Token(fd as usize), interest) {
                    tracing::error!(fd, ?direction, "event registration failed: {e}");
                    self.contexts.remove_if(&fd, |_, c| c.is_idle());
                    return false;
                }
            } else if new != old {
                let interest = new.to_interest().expect("new mask cannot be empty");
                if let Err(e) = self.registry.reregister(&mut SourceFd(&fd), Token(fd as usize), interest) {
                    tracing::error!(fd, ?direction, "event re-registration failed: {e}");
                    return false;
                }
            }
            ctx.set_events(new);
        }

        ctx.waiters(direction).prepare();
        true
    }

    /// Clears `direction` for `fd`; drops the context once nothing is armed.
    pub(crate) fn del_event(&self, fd: RawFd, direction: Direction) -> bool {
        let Some(ctx) = self.contexts.get(&fd).map(|e| e.value().clone()) else {
            return false;
        };
        let _guard = ctx.lock();
        let old = ctx.events();
        let new = old.remove(direction.mask());
        if new == old {
            return true;
        }
        if new.is_empty() {
            if let Err(e) = self.registry.deregister(&mut SourceFd(&fd)) {
                tracing::debug!(fd, "deregister failed (fd likely closed): {e}");
            }
            ctx.set_events(new);
            self.contexts.remove(&fd);
        } else {
            let interest = new.to_interest().expect("non-empty mask");
            if let Err(e) = self.registry.reregister(&mut SourceFd(&fd), Token(fd as usize), interest) {
                tracing::error!(fd, ?direction, "event re-registration failed: {e}");
                return false;
            }
            ctx.set_events(new);
        }
        true
    }

    /// Forces a wakeup of fibers parked on `fd`, then clears the armed
    /// events. Notify first, deregister second, so a waiter cannot miss its
    /// wake. Used on close/shutdown and on timer expiry.
    pub fn wake_up(&self, fd: RawFd, ready: Ready) -> usize {
        let Some(ctx) = self.contexts.get(&fd).map(|e| e.value().clone()) else {
            return 0;
        };
        let woken = ctx.wake(ready);
        if ready.is_readable() {
            self.del_event(fd, Direction::Read);
        }
        if ready.is_writable() {
            self.del_event(fd, Direction::Write);
        }
        woken
    }

    /// Clears every armed event for `fd` without waking anyone.
    pub fn del_all(&self, fd: RawFd) {
        self.del_event(fd, Direction::Read);
        self.del_event(fd, Direction::Write);
    }

    /// Whether any state is tracked for `fd`.
    pub fn has_context(&self, fd: RawFd) -> bool {
        self.contexts.contains_key(&fd)
    }

    /// Blocks up to `timeout` for readiness and republishes waiting fibers
    /// into their ready queues. Only the owning worker may call this.
    /// Returns the number of fibers woken.
    pub(crate) fn process_events(&self, timeout: Option<Duration>) -> io::Result<usize> {
        // SAFETY: single poller invariant.
        let poll = unsafe { &mut *self.poll.get() };
        let events = unsafe { &mut *self.events.get() };
        match poll.poll(events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e),
        }

        let mut woken = 0;
        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            let fd = event.token().0 as RawFd;
            let Some(ctx) = self.contexts.get(&fd).map(|e| e.value().clone()) else {
                tracing::warn!(fd, "readiness for unknown fd, event may have been lost");
                continue;
            };
            let hangup = event.is_error() || event.is_read_closed() || event.is_write_closed();
            if event.is_readable() || hangup {
                woken += ctx.waiters(Direction::Read).notify_all();
            }
            if event.is_writable() || hangup {
                woken += ctx.waiters(Direction::Write).notify_all();
            }
        }
        Ok(woken)
    }

    /// Forces a blocked `process_events` to return promptly. Safe from any
    /// thread.
    pub(crate) fn wake_poller(&self) {
        if let Err(e) = self.waker.wake() {
            tracing::warn!("poller wake failed: {e}");
        }
    }
}
