//! # Context Switching
//!
//! Context switch infrastructure. The scheduler decides on a [`Switch`]
//! while holding its lock; the switch itself is performed after the lock
//! is released, with the timer interrupt masked.

use crate::scheduler::Current;
use core::fmt;
use strand_hal::{context_switch, Context};

/// Context switch reason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchReason {
    /// The host loop dispatches the next fiber
    Dispatch,
    /// Voluntary yield
    Yield,
    /// Timer preemption
    Preemption,
    /// Fiber blocked on a semaphore
    Blocked,
    /// Fiber exited
    Exit,
}

/// A decided, not yet performed, context switch
pub struct Switch {
    /// Where the outgoing context is saved
    save: *mut Context,
    /// Context to resume
    resume: *const Context,
    /// Outgoing side
    pub from: Current,
    /// Incoming side
    pub to: Current,
    /// Why the switch happens
    pub reason: SwitchReason,
}

impl Switch {
    pub(crate) fn new(
        save: *mut Context,
        resume: *const Context,
        from: Current,
        to: Current,
        reason: SwitchReason,
    ) -> Self {
        Self {
            save,
            resume,
            from,
            to,
            reason,
        }
    }

    /// Perform the switch
    ///
    /// Returns when something later switches back into the saved context.
    ///
    /// # Safety
    /// The scheduler lock must be released and the timer interrupt masked.
    /// Both contexts must still live at the addresses recorded when the
    /// switch was decided.
    pub unsafe fn perform(self) {
        // SAFETY: the caller guarantees `resume` is live.
        let resumable = unsafe { (*self.resume).is_initialized() };
        if !resumable {
            fatal(format_args!(
                "{:?} -> {:?}: target context was never captured",
                self.from, self.to
            ));
        }

        // SAFETY: both contexts are valid and the target is resumable.
        unsafe { context_switch(self.save, self.resume) };
    }
}

impl fmt::Debug for Switch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Switch")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("reason", &self.reason)
            .finish()
    }
}

/// Abort on a broken execution context
///
/// Once a context cannot be restored the machine state is undefined, so
/// there is nothing to unwind to.
#[cold]
pub fn fatal(args: fmt::Arguments<'_>) -> ! {
    log::error!("fatal context error: {}", args);
    std::process::abort()
}
