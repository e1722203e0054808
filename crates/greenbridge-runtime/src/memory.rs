//! Fiber stack allocation using mmap
//!
//! Each stack is one private anonymous mapping:
//!
//! ```text
//! base                     base + guard                     base + total
//! |  guard (PROT_NONE)     |  usable stack (RW)  <- grows down   | top
//! ```
//!
//! Overflowing the usable region faults on the guard page instead of
//! silently corrupting a neighbour.

use std::io;
use std::ptr;

use greenbridge_core::constants::{GUARD_PAGES, MIN_STACK_SIZE};
use greenbridge_core::error::MemoryError;

/// An owned, guard-protected fiber stack; unmapped on drop
pub struct FiberStack {
    base: *mut u8,
    total: usize,
    guard: usize,
}

impl FiberStack {
    /// Map a stack with at least `size` usable bytes
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size < MIN_STACK_SIZE {
            return Err(MemoryError::InvalidSize(size));
        }

        let page = page_size();
        let usable = size
            .checked_add(page - 1)
            .map(|s| s & !(page - 1))
            .ok_or(MemoryError::InvalidSize(size))?;
        let guard = GUARD_PAGES * page;
        let total = usable + guard;

        // Reserve everything with PROT_NONE, then open up the usable part
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed(last_errno()));
        }

        let ret = unsafe {
            libc::mprotect(
                (base as *mut u8).add(guard) as *mut libc::c_void,
                usable,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if ret != 0 {
            let errno = last_errno();
            unsafe { libc::munmap(base, total) };
            return Err(MemoryError::ProtectionFailed(errno));
        }

        Ok(Self {
            base: base as *mut u8,
            total,
            guard,
        })
    }

    /// Exclusive upper end of the stack (initial stack pointer)
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total) }
    }

    /// Lowest usable address, just above the guard page
    #[inline]
    pub fn bottom(&self) -> *mut u8 {
        unsafe { self.base.add(self.guard) }
    }

    /// Usable bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.total - self.guard
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.base as *mut libc::c_void, self.total) };
        if ret != 0 {
            tracing::error!(errno = last_errno(), "munmap of fiber stack failed");
        }
    }
}

impl std::fmt::Debug for FiberStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberStack")
            .field("bottom", &self.bottom())
            .field("top", &self.top())
            .field("size", &self.size())
            .finish()
    }
}

/// System page size, falling back to 4 KiB if sysconf fails
pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
