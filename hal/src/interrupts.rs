//! # Timer Interrupts
//!
//! The periodic interrupt that drives preemption is a POSIX signal
//! ([`TIMER_SIGNAL`]). This module owns three pieces of it:
//!
//! - installing the process-wide signal handler ([`install`])
//! - arming a periodic timer aimed at one OS thread ([`PeriodicTimer`])
//! - masking the signal around non-preemptible sections
//!   ([`InterruptGuard`])
//!
//! On Linux the timer is a per-thread POSIX timer (`SIGEV_THREAD_ID`), so
//! several OS threads can each drive their own scheduler. Elsewhere it falls
//! back to the process-wide `ITIMER_REAL`.

use crate::cpu::ErrnoGuard;
use crate::{HalError, HalResult};
use core::fmt;
use core::marker::PhantomData;
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Signal used as the timer interrupt
pub const TIMER_SIGNAL: libc::c_int = libc::SIGALRM;

/// Interrupt handler function type
///
/// Runs in signal context on whatever stack was active when the timer
/// fired. It must not allocate or take locks that interrupted code may
/// hold.
pub type InterruptHandler = fn();

/// Installed handler (0 = none)
static HANDLER: AtomicUsize = AtomicUsize::new(0);

/// Install `handler` as the timer interrupt handler
///
/// Re-installing replaces the previous handler.
pub fn install(handler: InterruptHandler) -> HalResult<()> {
    HANDLER.store(handler as usize, Ordering::SeqCst);

    // SAFETY: a zeroed sigaction is a valid starting point; every field
    // that matters is set below.
    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    action.sa_sigaction = dispatch as extern "C" fn(libc::c_int) as libc::sighandler_t;
    action.sa_flags = libc::SA_RESTART;

    // SAFETY: `action` and its mask are valid for the duration of the calls.
    let ret = unsafe {
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(TIMER_SIGNAL, &action, ptr::null_mut())
    };
    if ret != 0 {
        let error = HalError::last_os_error();
        log::error!("install(): sigaction failed ({})", error);
        return Err(error);
    }

    log::debug!("timer interrupt handler installed on signal {}", TIMER_SIGNAL);
    Ok(())
}

/// Raw signal entry point
extern "C" fn dispatch(_signal: libc::c_int) {
    let _errno = ErrnoGuard::save();

    let raw = HANDLER.load(Ordering::Acquire);
    if raw != 0 {
        // SAFETY: only `install` writes HANDLER, always from a valid `fn()`.
        let handler: InterruptHandler = unsafe { mem::transmute::<usize, fn()>(raw) };
        handler();
    }
}

fn timer_signal_set() -> libc::sigset_t {
    // SAFETY: the set is initialized by sigemptyset before use.
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, TIMER_SIGNAL);
        set
    }
}

fn change_mask(how: libc::c_int) -> libc::sigset_t {
    let set = timer_signal_set();
    // SAFETY: both sets are valid; the call only fails for a bad `how`.
    unsafe {
        let mut previous: libc::sigset_t = mem::zeroed();
        let ret = libc::pthread_sigmask(how, &set, &mut previous);
        debug_assert_eq!(ret, 0, "pthread_sigmask failed");
        previous
    }
}

/// Unmask the timer interrupt on the calling thread
pub fn enable() {
    change_mask(libc::SIG_UNBLOCK);
}

/// Mask the timer interrupt on the calling thread
pub fn disable() {
    change_mask(libc::SIG_BLOCK);
}

/// Check whether the timer interrupt is currently unmasked
pub fn are_enabled() -> bool {
    // SAFETY: querying the mask with a null `set` does not modify it.
    unsafe {
        let mut current: libc::sigset_t = mem::zeroed();
        libc::pthread_sigmask(libc::SIG_BLOCK, ptr::null(), &mut current);
        libc::sigismember(&current, TIMER_SIGNAL) == 0
    }
}

/// Scoped non-preemptible section
///
/// Masks the timer interrupt on creation and restores the previous mask on
/// drop. The previous mask is stored in the guard itself, so a guard held
/// across a context switch restores the mask of the context that created
/// it once that context is resumed.
pub struct InterruptGuard {
    previous: libc::sigset_t,
    /// The mask is per OS thread
    _not_send: PhantomData<*const ()>,
}

impl InterruptGuard {
    /// Mask the timer interrupt until the guard is dropped
    pub fn new() -> Self {
        Self {
            previous: change_mask(libc::SIG_BLOCK),
            _not_send: PhantomData,
        }
    }

    /// Whether the interrupt was unmasked when this guard was taken
    pub fn was_enabled(&self) -> bool {
        // SAFETY: `previous` was filled in by pthread_sigmask.
        unsafe { libc::sigismember(&self.previous, TIMER_SIGNAL) == 0 }
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        // SAFETY: restoring a mask previously returned by pthread_sigmask.
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.previous, ptr::null_mut());
        }
    }
}

impl fmt::Debug for InterruptGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptGuard")
            .field("was_enabled", &self.was_enabled())
            .finish()
    }
}

fn check_period(period: Duration) -> HalResult<()> {
    if period.is_zero() {
        // A zero interval would disarm the timer instead of arming it.
        return Err(HalError::InvalidParameter);
    }
    Ok(())
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        /// Periodic timer delivering [`TIMER_SIGNAL`] to the thread that
        /// created it
        pub struct PeriodicTimer {
            id: libc::timer_t,
            period: Option<Duration>,
        }

        impl PeriodicTimer {
            /// Create a disarmed timer bound to the calling OS thread
            pub fn new() -> HalResult<Self> {
                // SAFETY: sigevent is plain data; the relevant fields are set below.
                let mut event: libc::sigevent = unsafe { mem::zeroed() };
                event.sigev_notify = libc::SIGEV_THREAD_ID;
                event.sigev_signo = TIMER_SIGNAL;
                event.sigev_notify_thread_id = crate::cpu::os_thread_id();

                let mut id: libc::timer_t = ptr::null_mut();
                // SAFETY: `event` and `id` are valid for the call.
                let ret = unsafe { libc::timer_create(libc::CLOCK_MONOTONIC, &mut event, &mut id) };
                if ret != 0 {
                    let error = HalError::last_os_error();
                    log::error!("PeriodicTimer::new(): timer_create failed ({})", error);
                    return Err(error);
                }

                Ok(Self { id, period: None })
            }

            fn settime(&self, period: Duration) -> HalResult<()> {
                let spec = libc::timespec {
                    tv_sec: period.as_secs() as libc::time_t,
                    tv_nsec: period.subsec_nanos() as _,
                };
                let value = libc::itimerspec {
                    it_interval: spec,
                    it_value: spec,
                };
                // SAFETY: `self.id` is a live timer owned by this struct.
                let ret = unsafe { libc::timer_settime(self.id, 0, &value, ptr::null_mut()) };
                if ret != 0 {
                    return Err(HalError::last_os_error());
                }
                Ok(())
            }
        }

        impl Drop for PeriodicTimer {
            fn drop(&mut self) {
                // SAFETY: deleting a timer this struct created; deletion disarms it.
                unsafe { libc::timer_delete(self.id) };
            }
        }
    } else {
        /// Periodic timer delivering [`TIMER_SIGNAL`] to the process
        pub struct PeriodicTimer {
            period: Option<Duration>,
        }

        impl PeriodicTimer {
            /// Create a disarmed timer
            pub fn new() -> HalResult<Self> {
                Ok(Self { period: None })
            }

            fn settime(&self, period: Duration) -> HalResult<()> {
                let interval = libc::timeval {
                    tv_sec: period.as_secs() as libc::time_t,
                    tv_usec: period.subsec_micros() as _,
                };
                let value = libc::itimerval {
                    it_interval: interval,
                    it_value: interval,
                };
                // SAFETY: `value` is valid for the call.
                let ret = unsafe { libc::setitimer(libc::ITIMER_REAL, &value, ptr::null_mut()) };
                if ret != 0 {
                    return Err(HalError::last_os_error());
                }
                Ok(())
            }
        }

        impl Drop for PeriodicTimer {
            fn drop(&mut self) {
                if self.period.is_some() {
                    let _ = self.settime(Duration::ZERO);
                }
            }
        }
    }
}

impl PeriodicTimer {
    /// Arm (or re-arm) the timer
    ///
    /// Both the first expiry and the interval are set to `period`.
    pub fn arm(&mut self, period: Duration) -> HalResult<()> {
        check_period(period)?;
        self.settime(period)?;
        self.period = Some(period);
        Ok(())
    }

    /// Stop the timer; pending expiries are cancelled
    pub fn disarm(&mut self) -> HalResult<()> {
        self.settime(Duration::ZERO)?;
        self.period = None;
        Ok(())
    }

    /// Period the timer is armed with, if any
    pub fn period(&self) -> Option<Duration> {
        self.period
    }

    /// Check if the timer is armed
    pub fn is_armed(&self) -> bool {
        self.period.is_some()
    }
}

impl fmt::Debug for PeriodicTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicTimer")
            .field("period", &self.period)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    static TICKS: AtomicUsize = AtomicUsize::new(0);

    fn count_tick() {
        TICKS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_guard_masks_and_restores() {
        enable();
        assert!(are_enabled());
        {
            let guard = InterruptGuard::new();
            assert!(guard.was_enabled());
            assert!(!are_enabled());
            {
                let nested = InterruptGuard::new();
                assert!(!nested.was_enabled());
            }
            assert!(!are_enabled());
        }
        assert!(are_enabled());
    }

    #[test]
    fn test_zero_period_rejected() {
        let mut timer = PeriodicTimer::new().unwrap();
        assert_eq!(timer.arm(Duration::ZERO), Err(HalError::InvalidParameter));
        assert!(!timer.is_armed());
    }

    // Every signal-delivery check lives in this one test: the handler slot is
    // process-wide.
    #[test]
    fn test_timer_delivers_ticks() {
        install(count_tick).unwrap();
        enable();

        // A masked signal stays pending until the guard drops.
        {
            let _guard = InterruptGuard::new();
            let before = TICKS.load(Ordering::SeqCst);
            // SAFETY: raising a signal at the calling thread.
            unsafe { libc::pthread_kill(libc::pthread_self(), TIMER_SIGNAL) };
            assert_eq!(TICKS.load(Ordering::SeqCst), before);
        }
        assert!(TICKS.load(Ordering::SeqCst) >= 1);

        let mut timer = PeriodicTimer::new().unwrap();
        timer.arm(Duration::from_millis(1)).unwrap();
        assert_eq!(timer.period(), Some(Duration::from_millis(1)));

        let start = TICKS.load(Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(5);
        while TICKS.load(Ordering::SeqCst) < start + 3 && Instant::now() < deadline {
            std::hint::spin_loop();
        }
        timer.disarm().unwrap();
        assert!(TICKS.load(Ordering::SeqCst) >= start + 3);
        assert!(!timer.is_armed());
    }
}
