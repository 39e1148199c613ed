//! # Stack Regions
//!
//! Fiber stacks are anonymous private mappings with one inaccessible guard
//! page below the usable range, so an overflow faults instead of silently
//! corrupting a neighbouring stack.
//!
//! ```text
//!   base                 base + guard                     base + len
//!    |  guard (PROT_NONE) |      usable (read/write)       |
//!                                          grows down <--- top
//! ```

use crate::{cpu, HalError, HalResult};
use core::fmt;
use core::ptr::{self, NonNull};

/// An exclusively owned, guarded stack mapping
pub struct StackRegion {
    /// Start of the mapping (the guard page)
    base: NonNull<u8>,
    /// Total mapped length, guard included
    len: usize,
    /// Guard length in bytes
    guard: usize,
}

// The region is plain memory owned by exactly one control block.
unsafe impl Send for StackRegion {}

impl StackRegion {
    /// Smallest usable size handed out, whatever the caller asks for
    pub const MIN_SIZE: usize = 16 * 1024;

    /// Map a new stack with at least `size` usable bytes
    pub fn allocate(size: usize) -> HalResult<Self> {
        let guard = cpu::page_size();
        let usable = cpu::round_to_pages(size.max(Self::MIN_SIZE));
        let len = usable.checked_add(guard).ok_or(HalError::InvalidParameter)?;

        // SAFETY: anonymous private mapping with no address hint.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            let errno = cpu::errno();
            log::error!("allocate(): mmap of {} bytes failed (errno={})", len, errno);
            return Err(if errno == libc::ENOMEM {
                HalError::OutOfMemory
            } else {
                HalError::Os(errno)
            });
        }

        // SAFETY: the first page belongs to the mapping created above.
        if unsafe { libc::mprotect(addr, guard, libc::PROT_NONE) } != 0 {
            let error = HalError::last_os_error();
            // SAFETY: unmapping exactly what was mapped.
            unsafe { libc::munmap(addr, len) };
            return Err(error);
        }

        let base = NonNull::new(addr.cast::<u8>()).ok_or(HalError::OutOfMemory)?;
        Ok(Self { base, len, guard })
    }

    /// Lowest usable address (just above the guard page)
    pub fn bottom(&self) -> usize {
        self.base.as_ptr() as usize + self.guard
    }

    /// One past the highest usable address; stacks grow down from here
    pub fn top(&self) -> usize {
        self.base.as_ptr() as usize + self.len
    }

    /// Usable size in bytes
    pub fn size(&self) -> usize {
        self.len - self.guard
    }

    /// Guard size in bytes
    pub fn guard_size(&self) -> usize {
        self.guard
    }

    /// Check whether `addr` lies in the usable range
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.bottom() && addr < self.top()
    }
}

impl Drop for StackRegion {
    fn drop(&mut self) {
        // SAFETY: `base`/`len` describe a mapping this region owns.
        let ret = unsafe { libc::munmap(self.base.as_ptr().cast(), self.len) };
        debug_assert_eq!(ret, 0, "munmap of a fiber stack failed");
    }
}

impl fmt::Debug for StackRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackRegion")
            .field("bottom", &format_args!("{:#x}", self.bottom()))
            .field("top", &format_args!("{:#x}", self.top()))
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_rounds_up_to_minimum() {
        let stack = StackRegion::allocate(1).unwrap();
        assert!(stack.size() >= StackRegion::MIN_SIZE);
        assert_eq!(stack.size() % cpu::page_size(), 0);
        assert_eq!(stack.guard_size(), cpu::page_size());
    }

    #[test]
    fn test_geometry() {
        let stack = StackRegion::allocate(64 * 1024).unwrap();
        assert_eq!(stack.top() - stack.bottom(), stack.size());
        assert_eq!(stack.top() % 16, 0);
        assert!(stack.contains(stack.bottom()));
        assert!(stack.contains(stack.top() - 1));
        assert!(!stack.contains(stack.top()));
        assert!(!stack.contains(stack.bottom() - 1));
    }

    #[test]
    fn test_usable_range_is_writable() {
        let stack = StackRegion::allocate(StackRegion::MIN_SIZE).unwrap();
        // SAFETY: both addresses are inside the read/write part of the mapping.
        unsafe {
            ptr::write_volatile(stack.bottom() as *mut u8, 0xAA);
            ptr::write_volatile((stack.top() - 1) as *mut u8, 0x55);
            assert_eq!(ptr::read_volatile(stack.bottom() as *const u8), 0xAA);
            assert_eq!(ptr::read_volatile((stack.top() - 1) as *const u8), 0x55);
        }
    }

    #[test]
    fn test_distinct_regions_do_not_overlap() {
        let a = StackRegion::allocate(StackRegion::MIN_SIZE).unwrap();
        let b = StackRegion::allocate(StackRegion::MIN_SIZE).unwrap();
        assert!(a.top() <= b.bottom() - b.guard_size() || b.top() <= a.bottom() - a.guard_size());
    }
}
