//! Runtime configuration.
//!
//! The builder installs the process-wide scheduler; touching any runtime
//! entry point first installs one with defaults instead, so configure early.

use crate::fiber::stack;
use crate::runtime;
use crate::Error;

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Worker thread count.
    pub worker_threads: usize,
    /// Default fiber stack size in bytes.
    pub stack_size: usize,
    /// Timer wheel tick length in milliseconds.
    pub timer_tick_ms: u64,
    /// Timer wheel slot count.
    pub timer_slots: usize,
    /// Maximum readiness events absorbed per poll pass.
    pub event_batch: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            stack_size: 256 * 1024,
            timer_tick_ms: runtime::timer::DEFAULT_TICK_MS,
            timer_slots: runtime::timer::DEFAULT_SLOTS,
            event_batch: 1024,
        }
    }
}

/// Builds and installs the scheduler.
///
/// ```no_run
/// strand::Builder::new()
///     .worker_threads(8)
///     .stack_size(512 * 1024)
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Default)]
pub struct Builder {
    config: Config,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Worker count; clamped to at least 1.
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.config.worker_threads = count.max(1);
        self
    }

    /// Default fiber stack size; rounded up to whole pages on allocation.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.config.stack_size = bytes.max(stack::page_size());
        self
    }

    /// Timer tick length in milliseconds.
    pub fn timer_tick(mut self, ms: u64) -> Self {
        self.config.timer_tick_ms = ms.max(1);
        self
    }

    /// Timer wheel slot count.
    pub fn timer_slots(mut self, slots: usize) -> Self {
        self.config.timer_slots = slots.max(1);
        self
    }

    /// Maximum readiness events per poll pass.
    pub fn event_batch(mut self, events: usize) -> Self {
        self.config.event_batch = events.max(1);
        self
    }

    /// Installs the scheduler. Fails with `InvalidState` if one was already
    /// installed (explicitly or by first use).
    pub fn build(self) -> Result<(), Error> {
        runtime::install(self.config)
    }
}
