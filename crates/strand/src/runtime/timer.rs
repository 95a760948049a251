//! Hashed timing wheel.
//!
//! Single wheel of `slots` buckets, each `tick` wide (defaults 256 x 100 ms).
//! Foreign threads add timers through a lock-free pending queue; the owning
//! worker drains it and walks the current bucket once per tick. Cancellation
//! is a one-way atomic flag, so it is safe from any thread at any time.
//!
//! Callbacks run on the worker thread, synchronously within `tick`. They must
//! be short and non-blocking; the typical callback marks a flag and notifies
//! a wait queue.
//!
//! NOT thread-safe on the tick path - exactly one thread may call `tick`.

use std::cell::UnsafeCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::sync::queue::Queue;

/// Default wheel geometry.
pub const DEFAULT_SLOTS: usize = 256;
pub const DEFAULT_TICK_MS: u64 = 100;

/// How many pending timers one tick will absorb before processing buckets.
const PENDING_BATCH: usize = 256;

/// Drift tolerance when deciding whether a tick is due.
const TICK_TOLERANCE: Duration = Duration::from_millis(1);

/// Shared handle to an armed timer.
pub type TimerHandle = Arc<TimerNode>;

type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// A single timer: period, remaining rotations, callback, repeat and
/// cancelled flags. Lives until it fires (once) or is cancelled.
pub struct TimerNode {
    timeout_ms: u64,
    rotations: AtomicU64,
    callback: TimerCallback,
    repeat: bool,
    cancelled: AtomicBool,
}

impl TimerNode {
    /// Flips the cancelled flag. One-way; safe from any thread.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    fn fire(&self) {
        let cb = &self.callback;
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| cb())) {
            if let Some(msg) = payload.downcast_ref::<&str>() {
                tracing::error!("timer callback panicked: {msg}");
            } else {
                tracing::error!("timer callback panicked");
            }
        }
    }
}

/// Per-worker hashed timing wheel.
pub struct TimerWheel {
    slots: usize,
    tick: Duration,
    /// Bucket vectors, touched only by the ticking worker.
    wheel: UnsafeCell<Vec<Vec<TimerHandle>>>,
    current_slot: UnsafeCell<usize>,
    last_tick: UnsafeCell<Instant>,
    /// Foreign threads park new timers here.
    pending: Queue<TimerHandle>,
    running: AtomicBool,
}

// SAFETY: the UnsafeCell fields are only dereferenced from `tick`, and the
// wheel's owner guarantees a single ticking thread. Everything reachable from
// other threads (pending queue, cancelled/rotations flags) is atomic.
unsafe impl Send for TimerWheel {}
unsafe impl Sync for TimerWheel {}

impl TimerWheel {
    pub fn new(slots: usize, tick_ms: u64) -> Self {
        let slots = slots.max(1);
        let mut wheel = Vec::with_capacity(slots);
        wheel.resize_with(slots, || Vec::with_capacity(16));
        Self {
            slots,
            tick: Duration::from_millis(tick_ms.max(1)),
            wheel: UnsafeCell::new(wheel),
            current_slot: UnsafeCell::new(0),
            last_tick: UnsafeCell::new(Instant::now()),
            pending: Queue::new(),
            running: AtomicBool::new(true),
        }
    }

    pub fn tick_ms(&self) -> u64 {
        self.tick.as_millis() as u64
    }

    /// Arms a timer `ms` from now (rounded up to at least one tick). Safe
    /// from any thread. Returns `None` once the wheel has stopped.
    pub fn add_timer<F>(&self, ms: u64, callback: F, repeat: bool) -> Option<TimerHandle>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer_node(ms, Arc::new(callback), repeat)
    }

    fn add_timer_node(&self, ms: u64, callback: TimerCallback, repeat: bool) -> Option<TimerHandle> {
        if !self.running.load(Ordering::Acquire) {
            return None;
        }
        let timer = Arc::new(TimerNode {
            timeout_ms: ms,
            rotations: AtomicU64::new(0),
            callback,
            repeat,
            cancelled: AtomicBool::new(false),
        });
        self.pending.push_back(timer.clone());
        Some(timer)
    }

    /// Flips the timer's cancelled flag.
    pub fn cancel(&self, timer: &TimerHandle) {
        timer.cancel();
    }

    /// Cancels `timer` and re-arms a fresh one with the same period,
    /// callback, and repeat flag. Returns `None` if the timer was already
    /// cancelled or the wheel has stopped.
    pub fn refresh(&self, timer: &TimerHandle) -> Option<TimerHandle> {
        if timer.is_cancelled() {
            return None;
        }
        timer.cancel();
        self.add_timer_node(timer.timeout_ms, timer.callback.clone(), timer.repeat)
    }

    /// Cancels `timer` and runs its callback inline.
    pub fn trigger_now(&self, timer: &TimerHandle) {
        timer.cancel();
        timer.fire();
    }

    /// Milliseconds until the next tick is due; feeds the worker's poll
    /// timeout.
    pub(crate) fn next_timeout_ms(&self) -> u64 {
        // SAFETY: read-only peek by the owning worker.
        let last = unsafe { *self.last_tick.get() };
        let elapsed = Instant::now().duration_since(last);
        self.tick
            .saturating_sub(elapsed)
            .as_millis() as u64
    }

    /// Advances the wheel if a full tick has elapsed. Only the owning worker
    /// may call this. Returns whether a tick was processed.
    pub(crate) fn tick(&self) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        // SAFETY: single ticking thread (wheel owner).
        let last = unsafe { &mut *self.last_tick.get() };
        if now.duration_since(*last) + TICK_TOLERANCE < self.tick {
            return false;
        }

        self.drain_pending();

        let idx = unsafe { *self.current_slot.get() };
        let mut bucket = {
            let wheel = unsafe { &mut *self.wheel.get() };
            std::mem::take(&mut wheel[idx])
        };
        let mut keep = Vec::with_capacity(bucket.len());
        for timer in bucket.drain(..) {
            if timer.is_cancelled() {
                continue;
            }
            if timer.rotations.load(Ordering::Relaxed) > 0 {
                timer.rotations.fetch_sub(1, Ordering::Relaxed);
                keep.push(timer);
                continue;
            }
            timer.fire();
            if timer.repeat && !timer.is_cancelled() {
                self.place(idx, timer);
            }
        }
        {
            let wheel = unsafe { &mut *self.wheel.get() };
            wheel[idx].append(&mut keep);
        }

        // SAFETY: single ticking thread.
        unsafe {
            *self.current_slot.get() = (idx + 1) % self.slots;
        }
        *last = now;
        true
    }

    /// Moves a bounded batch of newly added timers into their target slots.
    fn drain_pending(&self) {
        let current = unsafe { *self.current_slot.get() };
        for _ in 0..PENDING_BATCH {
            let Some(timer) = self.pending.pop_front() else {
                break;
            };
            if timer.is_cancelled() {
                continue;
            }
            self.place(current, timer);
        }
    }

    fn place(&self, current: usize, timer: TimerHandle) {
        let tick_ms = self.tick.as_millis() as u64;
        let ticks = (timer.timeout_ms / tick_ms).max(1);
        let target = (current + ticks as usize) % self.slots;
        timer
            .rotations
            .store(ticks / self.slots as u64, Ordering::Relaxed);
        // SAFETY: only the ticking thread calls place.
        let wheel = unsafe { &mut *self.wheel.get() };
        wheel[target].push(timer);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}
