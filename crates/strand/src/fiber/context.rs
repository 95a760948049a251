//! Register save/restore for fiber switches.
//!
//! Two interchangeable implementations: an x86-64 assembly switch that only
//! touches the callee-saved set (the default, roughly an order of magnitude
//! cheaper), and a portable one over the POSIX user-context facility, enabled
//! with the `ucontext` feature or on other architectures.
//!
//! Either way a fresh context is prepared so that the first switch into it
//! lands in the trampoline passed to [`Context::init`]; the trampoline calls
//! the fiber entry and must never return.

#[cfg(all(target_arch = "x86_64", not(feature = "ucontext")))]
pub(crate) use self::asm::{swap, Context};
#[cfg(any(not(target_arch = "x86_64"), feature = "ucontext"))]
pub(crate) use self::ucontext::{swap, Context};

#[cfg(all(target_arch = "x86_64", not(feature = "ucontext")))]
mod asm {
    use std::arch::naked_asm;

    use crate::fiber::stack::Stack;

    /// Callee-saved register file per the System V x86-64 ABI. The resume
    /// address travels on the stack and is consumed by the `ret` in `swap`.
    #[repr(C)]
    #[derive(Default)]
    pub(crate) struct Context {
        rsp: u64,
        rbp: u64,
        rbx: u64,
        r12: u64,
        r13: u64,
        r14: u64,
        r15: u64,
    }

    impl Context {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        /// Builds an initial frame on `stack` whose topmost saved return
        /// address is `entry`.
        pub(crate) fn init(&mut self, stack: &Stack, entry: extern "C" fn()) {
            // The ABI wants rsp % 16 == 8 at function entry; `ret` pops the
            // entry address from a 16-aligned slot to get there.
            let mut sp = stack.top() as usize;
            sp &= !15;
            sp -= 16;
            // SAFETY: sp and sp+8 are in the usable region of the stack.
            unsafe {
                (sp as *mut u64).write(entry as usize as u64);
                ((sp + 8) as *mut u64).write(0); // fault loudly if entry returns
            }
            *self = Context {
                rsp: sp as u64,
                ..Context::default()
            };
        }
    }

    /// Spills the callee-saved registers into `from`, restores them from
    /// `to`, and resumes at `to`'s saved return address.
    ///
    /// # Safety
    /// Both pointers must reference valid contexts; `to` must have been
    /// initialized by [`Context::init`] or a previous `swap`.
    #[unsafe(naked)]
    pub(crate) unsafe extern "C" fn swap(_from: *mut Context, _to: *const Context) {
        naked_asm!(
            "mov [rdi + 0x00], rsp",
            "mov [rdi + 0x08], rbp",
            "mov [rdi + 0x10], rbx",
            "mov [rdi + 0x18], r12",
            "mov [rdi + 0x20], r13",
            "mov [rdi + 0x28], r14",
            "mov [rdi + 0x30], r15",
            "mov rsp, [rsi + 0x00]",
            "mov rbp, [rsi + 0x08]",
            "mov rbx, [rsi + 0x10]",
            "mov r12, [rsi + 0x18]",
            "mov r13, [rsi + 0x20]",
            "mov r14, [rsi + 0x28]",
            "mov r15, [rsi + 0x30]",
            // Fresh context: jumps into the trampoline. Parked context:
            // returns from its own call to `swap`.
            "ret",
        );
    }
}

#[cfg(any(not(target_arch = "x86_64"), feature = "ucontext"))]
mod ucontext {
    use std::mem;
    use std::ptr;

    use crate::fiber::stack::Stack;

    /// Portable context over `getcontext`/`swapcontext`.
    pub(crate) struct Context {
        inner: libc::ucontext_t,
    }

    impl Context {
        pub(crate) fn new() -> Self {
            Self {
                // SAFETY: ucontext_t is plain old data; every field is
                // overwritten by getcontext before the context is used.
                inner: unsafe { mem::zeroed() },
            }
        }

        pub(crate) fn init(&mut self, stack: &Stack, entry: extern "C" fn()) {
            // SAFETY: self.inner is a valid ucontext_t and the stack outlives
            // the context (both owned by the same fiber).
            unsafe {
                let rc = libc::getcontext(&mut self.inner);
                assert_eq!(rc, 0, "getcontext failed");
                self.inner.uc_stack.ss_sp = stack.limit() as *mut libc::c_void;
                self.inner.uc_stack.ss_size = stack.len();
                self.inner.uc_stack.ss_flags = 0;
                self.inner.uc_link = ptr::null_mut();
                libc::makecontext(&mut self.inner, entry, 0);
            }
        }
    }

    /// # Safety
    /// Both pointers must reference valid contexts; `to` must have been
    /// initialized by [`Context::init`] or a previous `swap`.
    pub(crate) unsafe extern "C" fn swap(from: *mut Context, to: *const Context) {
        let rc = unsafe { libc::swapcontext(&mut (*from).inner, &(*to).inner) };
        debug_assert_eq!(rc, 0, "swapcontext failed");
    }
}
