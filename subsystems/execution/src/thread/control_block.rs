//! # Fiber Control Block
//!
//! Core per-fiber data structure.

use super::FiberState;
use crate::{FiberId, SemaphoreId};
use arrayvec::ArrayString;
use core::fmt;
use std::time::Duration;
use strand_hal::stack::StackRegion;
use strand_hal::Context;

/// Fiber flags
pub mod flags {
    use bitflags::bitflags;

    bitflags! {
        /// Fiber flags
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct FiberFlags: u32 {
            /// The entry function has been called
            const STARTED = 1 << 0;
            /// The entry function panicked
            const PANICKED = 1 << 1;
            /// The stack has been unmapped
            const STACK_RELEASED = 1 << 2;
        }
    }
}

pub use flags::FiberFlags;

/// Longest stored fiber name, in bytes
pub const MAX_NAME_LEN: usize = 31;

/// Bounded fiber name
pub type FiberName = ArrayString<MAX_NAME_LEN>;

/// Code a fiber starts executing
pub type FiberEntry = Box<dyn FnOnce() + 'static>;

/// First code run on a fresh fiber stack
pub type Trampoline = extern "C" fn() -> !;

/// Build a fiber name from arbitrary input
///
/// The input is cut at the first NUL, then truncated to [`MAX_NAME_LEN`]
/// bytes without splitting a character.
pub fn truncate_name(name: &str) -> FiberName {
    let name = name.split('\0').next().unwrap_or_default();
    let mut end = name.len().min(MAX_NAME_LEN);
    while !name.is_char_boundary(end) {
        end -= 1;
    }

    let mut out = FiberName::new();
    out.push_str(&name[..end]);
    out
}

/// Fiber control block
pub struct ControlBlock {
    /// Unique identifier
    id: FiberId,
    /// Display name
    name: FiberName,
    /// Current state
    state: FiberState,
    /// Flags
    flags: FiberFlags,
    /// Entry function, taken when the fiber starts
    entry: Option<FiberEntry>,
    /// Owned stack, `None` once released
    stack: Option<StackRegion>,
    /// Saved execution context
    context: Context,
    /// Semaphore this fiber waits on while `Blocked`
    blocked_on: Option<SemaphoreId>,
    /// Times the scheduler picked this fiber
    turns: u64,
    /// Accumulated on-CPU time
    run_time: Duration,
}

impl ControlBlock {
    /// Create a runnable fiber whose first switch enters `trampoline` on
    /// `stack`
    pub fn new(
        id: FiberId,
        name: &str,
        entry: FiberEntry,
        stack: StackRegion,
        trampoline: Trampoline,
    ) -> Self {
        // SAFETY: the top of a freshly mapped region is writable and the
        // region lives in this control block for as long as the context can
        // be resumed.
        let context = unsafe { Context::new(stack.top(), trampoline) };

        Self {
            id,
            name: truncate_name(name),
            state: FiberState::Runnable,
            flags: FiberFlags::empty(),
            entry: Some(entry),
            stack: Some(stack),
            context,
            blocked_on: None,
            turns: 0,
            run_time: Duration::ZERO,
        }
    }

    /// Get fiber ID
    pub fn id(&self) -> FiberId {
        self.id
    }

    /// Get fiber name
    pub fn name(&self) -> &FiberName {
        &self.name
    }

    /// Get current state
    pub fn state(&self) -> FiberState {
        self.state
    }

    /// Set fiber state
    ///
    /// Transitions outside the state machine are bugs in the scheduler.
    pub fn set_state(&mut self, state: FiberState) {
        debug_assert!(
            self.state.can_transition_to(state),
            "{}: illegal transition {} -> {}",
            self.id,
            self.state,
            state
        );
        self.state = state;
    }

    /// Get flags
    pub fn flags(&self) -> FiberFlags {
        self.flags
    }

    /// Set a flag
    pub fn set_flag(&mut self, flag: FiberFlags) {
        self.flags.insert(flag);
    }

    /// Take the entry function, marking the fiber as started
    pub fn take_entry(&mut self) -> Option<FiberEntry> {
        let entry = self.entry.take();
        if entry.is_some() {
            self.flags.insert(FiberFlags::STARTED);
        }
        entry
    }

    /// Saved context
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Saved context, as a save target
    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    /// Semaphore the fiber is blocked on
    pub fn blocked_on(&self) -> Option<SemaphoreId> {
        self.blocked_on
    }

    /// Record the semaphore the fiber is blocked on
    pub fn set_blocked_on(&mut self, sem: Option<SemaphoreId>) {
        self.blocked_on = sem;
    }

    /// Number of scheduled turns
    pub fn turns(&self) -> u64 {
        self.turns
    }

    /// Count one more scheduled turn
    pub fn record_turn(&mut self) {
        self.turns += 1;
    }

    /// Accumulated on-CPU time
    pub fn run_time(&self) -> Duration {
        self.run_time
    }

    /// Add a finished time slice
    pub fn add_run_time(&mut self, slice: Duration) {
        self.run_time += slice;
    }

    /// Check if the stack is still mapped
    pub fn has_stack(&self) -> bool {
        self.stack.is_some()
    }

    /// Usable stack range `(bottom, top)`, if still mapped
    pub fn stack_bounds(&self) -> Option<(usize, usize)> {
        self.stack.as_ref().map(|s| (s.bottom(), s.top()))
    }

    /// Unmap the stack of an exited fiber
    ///
    /// Returns `true` if a stack was released by this call.
    pub fn release_stack(&mut self) -> bool {
        debug_assert!(self.state.is_terminated(), "{}: stack released before exit", self.id);
        match self.stack.take() {
            Some(stack) => {
                drop(stack);
                self.flags.insert(FiberFlags::STACK_RELEASED);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for ControlBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlBlock")
            .field("id", &self.id)
            .field("name", &self.name.as_str())
            .field("state", &self.state)
            .field("flags", &self.flags)
            .field("stack", &self.stack)
            .field("blocked_on", &self.blocked_on)
            .field("turns", &self.turns)
            .finish()
    }
}
