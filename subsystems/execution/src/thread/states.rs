//! # Fiber States
//!
//! Fiber state machine definition.
//!
//! ```text
//! RUNNABLE --(scheduler selects)---------------> RUNNING
//! RUNNING  --(exit / entry returns)-------------> EXIT      (terminal)
//! RUNNING  --(semaphore wait blocks)------------> BLOCKED
//! RUNNING  --(timer interrupt / yield)----------> RUNNABLE
//! BLOCKED  --(matching semaphore signal)--------> RUNNABLE
//! ```

use core::fmt;

/// Fiber state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FiberState {
    /// Waiting in the run queue
    #[default]
    Runnable,
    /// Currently executing
    Running,
    /// Waiting in a semaphore's wait queue
    Blocked,
    /// Terminated; never runs again
    Exit,
}

impl FiberState {
    /// Check if the fiber has terminated
    pub fn is_terminated(&self) -> bool {
        matches!(self, FiberState::Exit)
    }

    /// Valid transitions from this state
    pub fn valid_transitions(&self) -> &'static [FiberState] {
        match self {
            FiberState::Runnable => &[FiberState::Running],
            FiberState::Running => &[
                FiberState::Runnable,
                FiberState::Blocked,
                FiberState::Exit,
            ],
            FiberState::Blocked => &[FiberState::Runnable],
            FiberState::Exit => &[],
        }
    }

    /// Check whether moving to `next` is a legal transition
    pub fn can_transition_to(&self, next: FiberState) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Upper-case name used in state reports
    pub fn as_str(&self) -> &'static str {
        match self {
            FiberState::Runnable => "RUNNABLE",
            FiberState::Running => "RUNNING",
            FiberState::Blocked => "BLOCKED",
            FiberState::Exit => "EXIT",
        }
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [FiberState; 4] = [
        FiberState::Runnable,
        FiberState::Running,
        FiberState::Blocked,
        FiberState::Exit,
    ];

    #[test]
    fn test_exit_is_terminal() {
        for state in ALL {
            assert!(!FiberState::Exit.can_transition_to(state));
        }
    }

    #[test]
    fn test_only_running_leaves_for_blocked_or_exit() {
        for state in ALL {
            let reaches_blocked = state.can_transition_to(FiberState::Blocked);
            let reaches_exit = state.can_transition_to(FiberState::Exit);
            assert_eq!(reaches_blocked, state == FiberState::Running);
            assert_eq!(reaches_exit, state == FiberState::Running);
        }
    }

    #[test]
    fn test_blocked_only_wakes_to_runnable() {
        assert_eq!(FiberState::Blocked.valid_transitions(), &[FiberState::Runnable]);
        assert!(!FiberState::Blocked.can_transition_to(FiberState::Running));
    }

    #[test]
    fn test_display() {
        assert_eq!(FiberState::Runnable.to_string(), "RUNNABLE");
        assert_eq!(FiberState::Exit.to_string(), "EXIT");
        assert_eq!(FiberState::default(), FiberState::Runnable);
    }
}
