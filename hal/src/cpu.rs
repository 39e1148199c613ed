//! # CPU and Thread Helpers
//!
//! Small host queries used by the rest of the HAL and by the scheduler.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Fallback page size when the host does not report one
const FALLBACK_PAGE_SIZE: usize = 4096;

/// Cached page size (0 = not yet queried)
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Get the host page size in bytes
pub fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }

    // SAFETY: sysconf has no preconditions.
    let reported = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let size = if reported > 0 {
        reported as usize
    } else {
        FALLBACK_PAGE_SIZE
    };
    PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

/// Round `len` up to a whole number of pages
pub fn round_to_pages(len: usize) -> usize {
    let page = page_size();
    len.div_ceil(page) * page
}

/// Get the kernel identifier of the calling OS thread
///
/// This is the id a per-thread timer targets.
#[cfg(target_os = "linux")]
pub fn os_thread_id() -> i32 {
    // SAFETY: SYS_gettid takes no arguments and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

/// Get an identifier of the calling OS thread
#[cfg(not(target_os = "linux"))]
pub fn os_thread_id() -> i32 {
    // SAFETY: pthread_self has no preconditions.
    unsafe { libc::pthread_self() as usize as i32 }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        fn errno_location() -> *mut libc::c_int {
            // SAFETY: always returns the calling thread's errno slot.
            unsafe { libc::__errno_location() }
        }
    } else if #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))] {
        fn errno_location() -> *mut libc::c_int {
            // SAFETY: always returns the calling thread's errno slot.
            unsafe { libc::__error() }
        }
    } else {
        compile_error!("strand-hal: unsupported host operating system");
    }
}

/// Read the calling thread's `errno`
pub fn errno() -> i32 {
    // SAFETY: the errno slot is valid for the lifetime of the thread.
    unsafe { *errno_location() }
}

/// Overwrite the calling thread's `errno`
pub fn set_errno(value: i32) {
    // SAFETY: the errno slot is valid for the lifetime of the thread.
    unsafe { *errno_location() = value }
}

/// Saves `errno` on creation and puts it back on drop
///
/// Signal handlers must not leak their own `errno` into the code they
/// interrupted.
#[derive(Debug)]
pub struct ErrnoGuard {
    saved: i32,
}

impl ErrnoGuard {
    /// Capture the current `errno`
    pub fn save() -> Self {
        Self { saved: errno() }
    }
}

impl Drop for ErrnoGuard {
    fn drop(&mut self) {
        set_errno(self.saved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_power_of_two() {
        let page = page_size();
        assert!(page >= 4096);
        assert!(page.is_power_of_two());
    }

    #[test]
    fn test_round_to_pages() {
        let page = page_size();
        assert_eq!(round_to_pages(0), 0);
        assert_eq!(round_to_pages(1), page);
        assert_eq!(round_to_pages(page), page);
        assert_eq!(round_to_pages(page + 1), 2 * page);
    }

    #[test]
    fn test_errno_guard_restores() {
        set_errno(libc::EAGAIN);
        {
            let _guard = ErrnoGuard::save();
            set_errno(libc::EINTR);
            assert_eq!(errno(), libc::EINTR);
        }
        assert_eq!(errno(), libc::EAGAIN);
    }
}
