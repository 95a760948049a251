//! The fiber object and its controls.
//!
//! A fiber is a user-space, cooperatively scheduled thread: a private
//! guard-paged stack, a register save area, a state word, and an entry
//! closure. Switching is a user-space jump; a fiber progresses only at an
//! explicit yield point.
//!
//! Each OS thread that ever resumes a fiber owns an implicit root fiber
//! (no stack, no entry) whose context is the thread's own; yields land back
//! in whoever performed the resume, which is what makes nested `resume`
//! from inside a fiber work.

pub(crate) mod context;
pub(crate) mod stack;

use std::cell::RefCell;
use std::cell::UnsafeCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use once_cell::unsync::OnceCell;

use crate::fiber::context::Context;
use crate::fiber::stack::Stack;
use crate::runtime::{self, scheduler};
use crate::Error;

/// Shared handle to a fiber. A fiber is kept alive by whichever slot
/// currently references it: a ready queue, a wait queue, an fd wait list, a
/// timer callback, or a caller-held handle.
pub type FiberHandle = Arc<Fiber>;

/// Lifecycle of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Constructed or re-enqueued, eligible to run.
    Ready,
    /// Currently executing on some worker.
    Running,
    /// Cooperatively yielded; still runnable.
    Suspended,
    /// Parked on a wait queue, an fd, or a timer.
    Blocked,
    /// Entry function returned. Terminal.
    Done,
}

const STATE_READY: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_SUSPENDED: u8 = 2;
const STATE_BLOCKED: u8 = 3;
const STATE_DONE: u8 = 4;

/// Who drives the fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// The application calls `resume` itself.
    Manual,
    /// A worker thread drives it.
    Scheduled,
}

static FIBER_ID: AtomicU64 = AtomicU64::new(0);

fn next_fiber_id() -> u64 {
    FIBER_ID.fetch_add(1, Ordering::Relaxed) + 1
}

thread_local! {
    static CURRENT: RefCell<Option<FiberHandle>> = const { RefCell::new(None) };
    static ROOT: OnceCell<FiberHandle> = const { OnceCell::new() };
}

/// A stackful coroutine.
pub struct Fiber {
    id: u64,
    trace_id: u64,
    mode: RunMode,
    state: AtomicU8,
    /// Worker the fiber is pinned to; -1 until it first runs.
    consumer: AtomicI32,
    /// Context of whoever resumed us; yields switch back to it. Set on every
    /// resume, read only by the owning thread during a switch.
    parent_ctx: AtomicPtr<Context>,
    ctx: UnsafeCell<Context>,
    /// None only for root fibers, which borrow the thread's own stack.
    stack: Option<Stack>,
    entry: UnsafeCell<Option<Box<dyn FnOnce() + Send + 'static>>>,
}

// SAFETY: ctx/entry are only touched by the thread currently running or
// resuming the fiber; the one-runnable-slot invariant means there is never
// more than one such thread. Everything else is atomic.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Produces a handle in `Ready` without scheduling it. The caller drives
    /// it with [`resume`].
    pub fn create<F>(f: F, stack_size: usize) -> Result<FiberHandle, Error>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_mode(f, stack_size, RunMode::Manual)
    }

    pub(crate) fn with_mode<F>(f: F, stack_size: usize, mode: RunMode) -> Result<FiberHandle, Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let stack = Stack::new(stack_size)?;
        let mut ctx = Context::new();
        ctx.init(&stack, fiber_entry);
        let id = next_fiber_id();
        let trace_id = current().map(|f| f.trace_id).unwrap_or(id);
        Ok(Arc::new(Fiber {
            id,
            trace_id,
            mode,
            state: AtomicU8::new(STATE_READY),
            consumer: AtomicI32::new(-1),
            parent_ctx: AtomicPtr::new(std::ptr::null_mut()),
            ctx: UnsafeCell::new(ctx),
            stack: Some(stack),
            entry: UnsafeCell::new(Some(Box::new(f))),
        }))
    }

    /// Root fiber for the calling thread. Its context is filled in by the
    /// first switch away from it.
    fn root() -> FiberHandle {
        Arc::new(Fiber {
            id: next_fiber_id(),
            trace_id: 0,
            mode: RunMode::Manual,
            state: AtomicU8::new(STATE_RUNNING),
            consumer: AtomicI32::new(-1),
            parent_ctx: AtomicPtr::new(std::ptr::null_mut()),
            ctx: UnsafeCell::new(Context::new()),
            stack: None,
            entry: UnsafeCell::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Opaque routing id; inherited from the spawning fiber so related work
    /// lands on the same worker.
    pub fn trace_id(&self) -> u64 {
        self.trace_id
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn state(&self) -> FiberState {
        match self.state.load(Ordering::Acquire) {
            STATE_READY => FiberState::Ready,
            STATE_RUNNING => FiberState::Running,
            STATE_SUSPENDED => FiberState::Suspended,
            STATE_BLOCKED => FiberState::Blocked,
            _ => FiberState::Done,
        }
    }

    pub(crate) fn set_state(&self, state: FiberState) {
        let raw = match state {
            FiberState::Ready => STATE_READY,
            FiberState::Running => STATE_RUNNING,
            FiberState::Suspended => STATE_SUSPENDED,
            FiberState::Blocked => STATE_BLOCKED,
            FiberState::Done => STATE_DONE,
        };
        self.state.store(raw, Ordering::Release);
    }

    /// Worker index the fiber is pinned to, or `None` before its first run.
    pub fn consumer(&self) -> Option<usize> {
        let id = self.consumer.load(Ordering::Acquire);
        (id >= 0).then_some(id as usize)
    }

    /// Pins the fiber to `worker`. Re-pinning to a different worker is a
    /// runtime-logic bug and is fatal.
    pub(crate) fn pin_to(&self, worker: usize) {
        let prev = self
            .consumer
            .compare_exchange(-1, worker as i32, Ordering::AcqRel, Ordering::Acquire);
        if let Err(prev) = prev {
            assert_eq!(
                prev as usize, worker,
                "fiber {} pinned to worker {} but resumed on worker {}",
                self.id, prev, worker
            );
        }
    }

    fn is_root(&self) -> bool {
        self.stack.is_none()
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("mode", &self.mode)
            .field("consumer", &self.consumer())
            .finish()
    }
}

/// The fiber currently executing on this thread, if any.
pub fn current() -> Option<FiberHandle> {
    CURRENT.with(|c| {
        c.borrow()
            .as_ref()
            .filter(|f| !f.is_root())
            .cloned()
    })
}

fn current_or_root() -> FiberHandle {
    CURRENT.with(|c| {
        let mut slot = c.borrow_mut();
        if let Some(f) = slot.as_ref() {
            return f.clone();
        }
        let root = ROOT.with(|r| r.get_or_init(Fiber::root).clone());
        *slot = Some(root.clone());
        root
    })
}

/// Transfers control into `fiber` until its next yield point.
///
/// The caller becomes the fiber's parent for this run: when the fiber yields
/// or finishes, control returns here. Resuming a finished or already-running
/// fiber is a no-op with a warning.
pub fn resume(fiber: &FiberHandle) {
    match fiber.state() {
        FiberState::Done => {
            tracing::warn!(id = fiber.id, "resume of a finished fiber ignored");
            return;
        }
        FiberState::Running => {
            tracing::warn!(id = fiber.id, "resume of a running fiber ignored");
            return;
        }
        _ => {}
    }
    let parent = current_or_root();
    if Arc::ptr_eq(&parent, fiber) {
        return;
    }
    fiber.parent_ctx.store(parent.ctx.get(), Ordering::Relaxed);
    CURRENT.with(|c| *c.borrow_mut() = Some(fiber.clone()));
    fiber.set_state(FiberState::Running);
    // SAFETY: parent is suspended in this frame for the whole switch; both
    // contexts stay alive through the handles above.
    unsafe { context::swap(parent.ctx.get(), fiber.ctx.get()) };
    CURRENT.with(|c| *c.borrow_mut() = Some(parent));
}

/// Cooperatively yields the current fiber; it stays runnable and its worker
/// re-enqueues it at the tail.
pub fn yield_now() {
    switch_to_parent(FiberState::Suspended);
}

/// Parks the current fiber. Some other slot (wait queue, fd wait list, timer
/// callback) must hold a handle and re-schedule it, or it never runs again.
pub fn block_yield() {
    switch_to_parent(FiberState::Blocked);
}

fn switch_to_parent(state: FiberState) {
    let (own_ctx, parent_ctx) = CURRENT.with(|c| {
        let slot = c.borrow();
        let fiber = slot
            .as_ref()
            .expect("yield called outside of a fiber context");
        assert!(!fiber.is_root(), "yield called outside of a fiber context");
        if fiber.state() != FiberState::Done {
            fiber.set_state(state);
        }
        let parent = fiber.parent_ctx.load(Ordering::Relaxed);
        assert!(!parent.is_null(), "fiber has no parent context");
        (fiber.ctx.get(), parent)
    });
    // No handles are held across the switch; the frames above only carry raw
    // pointers, so a finished fiber's abandoned frame leaks nothing.
    // SAFETY: both contexts belong to fibers alive on this thread.
    unsafe { context::swap(own_ctx, parent_ctx) };
}

/// Entry trampoline: runs the fiber's closure, marks it `Done`, and hands
/// control back to the parent. Never returns.
extern "C" fn fiber_entry() {
    {
        let fiber = current().expect("fiber entry without a current fiber");
        // SAFETY: entry is taken exactly once, by the owning thread.
        let func = unsafe { (*fiber.entry.get()).take() };
        if let Some(func) = func {
            // Panics must not unwind across the context switch below.
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(func)) {
                if let Some(msg) = payload.downcast_ref::<&str>() {
                    tracing::error!(id = fiber.id, "fiber panicked: {msg}");
                } else if let Some(msg) = payload.downcast_ref::<String>() {
                    tracing::error!(id = fiber.id, "fiber panicked: {msg}");
                } else {
                    tracing::error!(id = fiber.id, "fiber panicked");
                }
            }
        }
        fiber.set_state(FiberState::Done);
    }
    loop {
        switch_to_parent(FiberState::Done);
    }
}

/// Spawns `f` as a fiber with the default stack size and schedules it.
pub fn go<F>(f: F) -> Result<FiberHandle, Error>
where
    F: FnOnce() + Send + 'static,
{
    go_with_stack(f, scheduler().config().stack_size)
}

/// Spawns `f` with an explicit stack size and schedules it.
pub fn go_with_stack<F>(f: F, stack_size: usize) -> Result<FiberHandle, Error>
where
    F: FnOnce() + Send + 'static,
{
    let fiber = Fiber::with_mode(f, stack_size, RunMode::Scheduled)?;
    scheduler().schedule(fiber.clone());
    Ok(fiber)
}

/// Parks the current fiber for at least `ms` milliseconds (rounded up to the
/// timer tick).
pub fn sleep(ms: u64) {
    let fiber = current().expect("sleep called outside of a fiber");
    let worker = runtime::current_worker().expect("sleep called outside of the runtime");
    let target = fiber.clone();
    let armed = worker.timer().add_timer(
        ms,
        move || {
            scheduler().schedule(target.clone());
        },
        false,
    );
    if armed.is_none() {
        tracing::warn!(id = fiber.id, "sleep on a stopped timer wheel ignored");
        return;
    }
    block_yield();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn manual_resume_and_yield() {
        let steps = Arc::new(AtomicUsize::new(0));
        let steps2 = steps.clone();
        let fiber = Fiber::create(
            move || {
                steps2.fetch_add(1, Ordering::SeqCst);
                yield_now();
                steps2.fetch_add(1, Ordering::SeqCst);
            },
            64 * 1024,
        )
        .unwrap();

        assert_eq!(fiber.state(), FiberState::Ready);
        resume(&fiber);
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), FiberState::Suspended);
        resume(&fiber);
        assert_eq!(steps.load(Ordering::SeqCst), 2);
        assert_eq!(fiber.state(), FiberState::Done);
        // Resuming a finished fiber is a warning, not a crash.
        resume(&fiber);
        assert_eq!(steps.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn nested_resume_returns_to_parent() {
        let trace = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let t1 = trace.clone();
        let t2 = trace.clone();

        let inner = Fiber::create(
            move || {
                t1.lock().push("inner");
            },
            64 * 1024,
        )
        .unwrap();

        let inner2 = inner.clone();
        let outer = Fiber::create(
            move || {
                t2.lock().push("outer-before");
                resume(&inner2);
                t2.lock().push("outer-after");
            },
            64 * 1024,
        )
        .unwrap();

        resume(&outer);
        assert_eq!(outer.state(), FiberState::Done);
        assert_eq!(inner.state(), FiberState::Done);
        assert_eq!(*trace.lock(), vec!["outer-before", "inner", "outer-after"]);
    }

    #[test]
    fn ids_are_monotone() {
        let a = Fiber::create(|| {}, 16 * 1024).unwrap();
        let b = Fiber::create(|| {}, 16 * 1024).unwrap();
        assert!(b.id() > a.id());
    }

    #[test]
    fn fiber_panic_is_contained() {
        let fiber = Fiber::create(
            || {
                panic!("boom");
            },
            64 * 1024,
        )
        .unwrap();
        resume(&fiber);
        assert_eq!(fiber.state(), FiberState::Done);
    }
}
