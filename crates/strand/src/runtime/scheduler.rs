//! The scheduler: a fixed fleet of workers and the routing logic that places
//! fibers on them.
//!
//! Worker 0 runs on the thread that calls [`Scheduler::run`] (the one the
//! process eventually joins); workers `1..N` own spawned OS threads. Newly
//! spawned fibers route deterministically by trace-id hash; once a fiber has
//! run somewhere it is pinned and always returns to that worker.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::builder::Config;
use crate::driver::IoManager;
use crate::fiber::{FiberHandle, FiberState};
use crate::runtime::timer::TimerWheel;
use crate::runtime::worker::{self, current_worker, WorkerShared};
use crate::utils::splitmix64;
use crate::Error;

const STATE_STOPPED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPING: u8 = 2;

static GLOBAL: OnceCell<Arc<Scheduler>> = OnceCell::new();

/// The process-wide scheduler, created on first use with default
/// configuration unless [`crate::Builder`] installed one earlier.
pub fn scheduler() -> &'static Arc<Scheduler> {
    GLOBAL.get_or_init(|| {
        Arc::new(Scheduler::new(Config::default()).expect("failed to initialize default scheduler"))
    })
}

/// Installs a scheduler with explicit configuration. Fails if one exists.
pub(crate) fn install(config: Config) -> Result<(), Error> {
    let mut created = false;
    GLOBAL.get_or_try_init(|| -> Result<_, Error> {
        created = true;
        Ok(Arc::new(Scheduler::new(config)?))
    })?;
    if created {
        Ok(())
    } else {
        Err(Error::InvalidState("scheduler already initialized"))
    }
}

/// Fixed pool of workers plus routing.
pub struct Scheduler {
    workers: Vec<Arc<WorkerShared>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    state: AtomicU8,
    config: Config,
}

impl Scheduler {
    fn new(config: Config) -> Result<Self, Error> {
        let count = config.worker_threads.max(1);
        let mut workers = Vec::with_capacity(count);
        for id in 0..count {
            workers.push(Arc::new(WorkerShared::new(id, &config)?));
        }

        // Workers 1..N get their own threads right away; worker 0 waits for
        // `run` on the caller's thread.
        let mut threads = Vec::with_capacity(count.saturating_sub(1));
        for shared in workers.iter().skip(1) {
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("strand-worker-{}", shared.id()))
                .spawn(move || worker::worker_loop(shared))
                .map_err(Error::Io)?;
            threads.push(handle);
        }

        tracing::debug!(workers = count, "scheduler initialized");
        Ok(Self {
            workers,
            threads: Mutex::new(threads),
            state: AtomicU8::new(STATE_RUNNING),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_RUNNING
    }

    /// Places `fiber` on a worker's ready queue.
    ///
    /// A pinned fiber must go back to its own worker. A fiber that has never
    /// run routes by `hash(trace_id) mod N`: deterministic routing gives
    /// reproducible traces and avoids a global least-loaded search.
    pub fn schedule(&self, fiber: FiberHandle) {
        // During Stopping the workers are draining and still consume their
        // ready queues; wake chains between draining fibers must keep
        // flowing or the drain cannot finish them.
        if self.state.load(Ordering::Acquire) == STATE_STOPPED {
            tracing::warn!(id = fiber.id(), "schedule on a stopped scheduler, fiber dropped");
            return;
        }
        match fiber.state() {
            FiberState::Done => {
                tracing::warn!(id = fiber.id(), "schedule of a finished fiber ignored");
                return;
            }
            FiberState::Suspended | FiberState::Blocked => fiber.set_state(FiberState::Ready),
            _ => {}
        }
        let idx = match fiber.consumer() {
            Some(worker) => worker,
            None => (splitmix64(fiber.trace_id()) % self.workers.len() as u64) as usize,
        };
        self.workers[idx].enqueue(fiber);
    }

    /// Drives worker 0 on the calling thread until [`Scheduler::stop`].
    pub fn run(&self) {
        if self.state.load(Ordering::Acquire) != STATE_RUNNING {
            tracing::warn!("run on a stopped scheduler ignored");
            return;
        }
        worker::worker_loop(self.workers[0].clone());
    }

    /// Stops every worker and joins their threads. Safe to call from a fiber;
    /// the calling worker's own thread is left to wind down by itself.
    pub fn stop(&self) {
        if self
            .state
            .compare_exchange(STATE_RUNNING, STATE_STOPPING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        for shared in &self.workers {
            shared.request_stop();
        }
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        let me = thread::current().id();
        for handle in handles {
            if handle.thread().id() != me {
                let _ = handle.join();
            }
        }
        self.state.store(STATE_STOPPED, Ordering::Release);
        tracing::debug!("scheduler stopped");
    }

    /// The readiness manager owned by the worker executing the caller.
    pub fn this_worker_io_manager(&self) -> Option<Arc<IoManager>> {
        current_worker().map(|w| w.io().clone())
    }

    /// The timer wheel owned by the worker executing the caller.
    pub fn this_worker_timer_wheel(&self) -> Option<Arc<TimerWheel>> {
        current_worker().map(|w| w.timer().clone())
    }

    /// Wakes fibers parked on `fd` across every worker's manager; the close
    /// path uses this because the parked fiber's worker is not knowable from
    /// the fd alone.
    pub(crate) fn wake_fd_everywhere(&self, fd: std::os::fd::RawFd) -> usize {
        let mut woken = 0;
        for shared in &self.workers {
            woken += shared.io().wake_up(fd, crate::driver::Ready::ALL);
        }
        woken
    }

    /// Approximate total of queued runnable fibers; visibility only.
    pub fn ready_fibers(&self) -> usize {
        self.workers.iter().map(|w| w.ready_len()).sum()
    }
}
