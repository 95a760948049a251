//! Worker threads: each owns a ready queue, a readiness manager, and a timer
//! wheel, and runs the pop/resume loop that drives fibers.

use std::cell::RefCell;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::builder::Config;
use crate::driver::IoManager;
use crate::fiber::{self, FiberHandle, FiberState};
use crate::runtime::timer::TimerWheel;
use crate::sync::queue::Queue;
use crate::sync::wait_queue::WaitToken;

/// Upper bound on fibers resumed per loop iteration before the worker gives
/// the poller and the wheel a turn.
const RESUME_BATCH: usize = 64;

/// Longest a worker parks in the poller; bounds wakeup latency for missed
/// cross-thread wake races.
const MAX_PARK_MS: u64 = 10;

/// Consumed park-registry entries dropped per loop iteration.
const PARKED_SWEEP_BATCH: usize = 64;

/// Stop-drain passes before fibers that keep re-parking are abandoned.
const DRAIN_PASSES: usize = 256;

thread_local! {
    static CURRENT_WORKER: RefCell<Option<Arc<WorkerShared>>> = const { RefCell::new(None) };
}

/// The worker currently executing the caller, if the caller runs on a worker
/// thread (equivalently: inside a scheduled fiber).
pub(crate) fn current_worker() -> Option<Arc<WorkerShared>> {
    CURRENT_WORKER.with(|w| w.borrow().clone())
}

/// State shared between a worker's thread and everyone who schedules onto it.
pub(crate) struct WorkerShared {
    id: usize,
    ready: Queue<FiberHandle>,
    running: AtomicBool,
    sleeping: AtomicBool,
    io: Arc<IoManager>,
    timer: Arc<TimerWheel>,
    /// Every token parked by a fiber on this worker, whatever queue it sits
    /// in (sync primitive or fd wait list). Swept as entries are consumed;
    /// the stop drain force-wakes what remains.
    parked: Queue<Arc<WaitToken>>,
}

impl WorkerShared {
    pub(crate) fn new(id: usize, config: &Config) -> io::Result<Self> {
        Ok(Self {
            id,
            ready: Queue::new(),
            running: AtomicBool::new(true),
            sleeping: AtomicBool::new(false),
            io: Arc::new(IoManager::new(config.event_batch)?),
            timer: Arc::new(TimerWheel::new(config.timer_slots, config.timer_tick_ms)),
            parked: Queue::new(),
        })
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn io(&self) -> &Arc<IoManager> {
        &self.io
    }

    pub(crate) fn timer(&self) -> &Arc<TimerWheel> {
        &self.timer
    }

    /// Places a fiber on this worker's ready queue and, if the worker might
    /// be parked in its poller, kicks it awake.
    pub(crate) fn enqueue(&self, fiber: FiberHandle) {
        self.ready.push_back(fiber);
        if self.sleeping.load(Ordering::Acquire) {
            self.io.wake_poller();
        }
    }

    pub(crate) fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Tracks a freshly parked fiber's token. Called from this worker's own
    /// thread only (fibers park while running here).
    pub(crate) fn register_parked(&self, token: Arc<WaitToken>) {
        self.parked.push_back(token);
    }

    /// Drops consumed registry entries so the registry only tracks fibers
    /// that are still parked.
    fn sweep_parked(&self, batch: usize) {
        for _ in 0..batch {
            match self.parked.pop_front() {
                Some(token) => {
                    if token.is_waiting() {
                        self.parked.push_back(token);
                    }
                }
                None => break,
            }
        }
    }

    /// Force-wakes every fiber still parked on this worker, claiming each
    /// token so regular notifiers become no-ops. Returns the number woken.
    fn wake_parked(&self) -> usize {
        let mut woken = 0;
        while let Some(token) = self.parked.pop_front() {
            if token.try_notify() {
                self.ready.push_back(token.fiber().clone());
                woken += 1;
            }
        }
        woken
    }

    pub(crate) fn request_stop(&self) {
        self.running.store(false, Ordering::Release);
        self.timer.stop();
        // Refusing new event registrations makes force-woken I/O waiters
        // surface an error instead of re-parking on an unpolled fd.
        self.io.stop();
        self.io.wake_poller();
    }
}

/// The consumer loop. Runs until stop is requested, then drains: pending
/// ready fibers are resumed to completion, and fibers parked on wait queues
/// or fd contexts are force-woken so half-run fibers holding external
/// resources are not leaked.
pub(crate) fn worker_loop(shared: Arc<WorkerShared>) {
    CURRENT_WORKER.with(|w| *w.borrow_mut() = Some(shared.clone()));
    tracing::debug!(worker = shared.id, "worker started");

    while shared.running.load(Ordering::Acquire) {
        shared.timer.tick();
        shared.sweep_parked(PARKED_SWEEP_BATCH);

        let mut resumed = 0;
        while resumed < RESUME_BATCH {
            match shared.ready.pop_front() {
                Some(fiber) => {
                    run_fiber(&shared, fiber);
                    resumed += 1;
                }
                None => break,
            }
        }

        // Idle workers park in the poller, bounded by the next timer tick;
        // the manager's wake-up fd keeps stop and cross-thread schedules
        // prompt.
        let mut timeout = if resumed > 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(shared.timer.next_timeout_ms().min(MAX_PARK_MS))
        };
        if !timeout.is_zero() {
            shared.sleeping.store(true, Ordering::Release);
            if !shared.ready.is_empty() {
                timeout = Duration::ZERO;
            }
        }
        if let Err(e) = shared.io.process_events(Some(timeout)) {
            tracing::error!(worker = shared.id, "poll failed: {e}");
        }
        shared.sleeping.store(false, Ordering::Release);
    }

    drain(&shared);

    CURRENT_WORKER.with(|w| w.borrow_mut().take());
    tracing::debug!(worker = shared.id, "worker stopped");
}

/// Resumes every pending fiber to completion. Ready fibers run directly;
/// parked fibers are force-woken through the registry (an I/O waiter then
/// fails its re-registration and errors out, a sync waiter re-checks its
/// condition). Fibers whose condition never resolves are abandoned with a
/// warning after a bounded number of passes.
fn drain(shared: &Arc<WorkerShared>) {
    let mut passes = 0;
    loop {
        let mut resumed = false;
        while let Some(fiber) = shared.ready.pop_front() {
            resumed = true;
            fiber::resume(&fiber);
            if fiber.state() == FiberState::Suspended {
                shared.ready.push_back(fiber);
            }
        }

        let woken = shared.wake_parked();
        if woken == 0 && !resumed && shared.ready.is_empty() {
            break;
        }

        passes += 1;
        if passes >= DRAIN_PASSES {
            tracing::warn!(
                worker = shared.id,
                "stop drain abandoned fibers whose wake condition never resolved"
            );
            break;
        }
        if woken > 0 {
            // A waiter here may depend on a fiber another worker is still
            // draining; give that chain a moment to advance.
            thread::sleep(Duration::from_millis(1));
        }
    }
}

fn run_fiber(shared: &Arc<WorkerShared>, fiber: FiberHandle) {
    // First run pins the fiber here; a pinned fiber arriving on the wrong
    // worker is a runtime-logic bug and asserts inside pin_to.
    fiber.pin_to(shared.id);
    fiber::resume(&fiber);
    match fiber.state() {
        // Cooperative yield: back to the tail for FIFO fairness.
        FiberState::Suspended => shared.ready.push_back(fiber),
        // Blocked: a wait queue, fd context, or timer callback owns it now.
        // Done: drop the reference.
        _ => {}
    }
}
