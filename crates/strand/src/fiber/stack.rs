//! Fiber stacks: one `mmap` region per fiber with an inaccessible guard page
//! below the usable area, so overflow traps instead of corrupting memory.

use std::ptr;

use crate::Error;

/// Owned stack mapping. The lowest page is `PROT_NONE`; the usable region
/// sits above it and grows downward.
pub(crate) struct Stack {
    base: *mut u8,
    total: usize,
    page: usize,
}

unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

pub(crate) fn page_size() -> usize {
    // SAFETY: plain sysconf query.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

impl Stack {
    /// Maps `size` bytes (rounded up to whole pages, at least one) plus a
    /// guard page.
    pub(crate) fn new(size: usize) -> Result<Self, Error> {
        let page = page_size();
        let usable = size.max(page).div_ceil(page) * page;
        let total = usable + page;

        // SAFETY: fresh anonymous mapping, never exposed before return.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::OutOfResource("fiber stack mmap failed"));
        }

        // SAFETY: base is a valid mapping of at least one page.
        if unsafe { libc::mprotect(base, page, libc::PROT_NONE) } != 0 {
            unsafe { libc::munmap(base, total) };
            return Err(Error::OutOfResource("fiber stack guard mprotect failed"));
        }

        Ok(Self {
            base: base as *mut u8,
            total,
            page,
        })
    }

    /// Lowest usable address, just above the guard page.
    pub(crate) fn limit(&self) -> *mut u8 {
        // SAFETY: in-bounds offset of the owned mapping.
        unsafe { self.base.add(self.page) }
    }

    /// One past the highest usable address; initial stack pointers are
    /// derived from here.
    pub(crate) fn top(&self) -> *mut u8 {
        // SAFETY: one-past-the-end of the owned mapping is a valid offset.
        unsafe { self.base.add(self.total) }
    }

    /// Usable bytes between guard and top.
    pub(crate) fn len(&self) -> usize {
        self.total - self.page
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // SAFETY: base/total describe the mapping created in `new`.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total);
        }
    }
}
