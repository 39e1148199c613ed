//! # Strand HAL - Host Abstraction Layer
//!
//! This crate wraps every host facility the fiber runtime depends on.
//! The scheduling core never talks to the operating system directly.
//!
//! ## Provided Facilities
//!
//! - **Execution contexts**: [`Context`] and [`context_switch`], the
//!   architecture-specific register save/restore primitive
//! - **Stack regions**: [`stack::StackRegion`], guarded anonymous mappings
//! - **Periodic interrupts**: [`interrupts::PeriodicTimer`] and the timer
//!   signal handler
//! - **Interrupt masking**: [`interrupts::InterruptGuard`], a scoped
//!   non-preemptible section
//! - **CPU helpers**: page size, OS thread identity, errno preservation

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod arch;
pub mod cpu;
pub mod interrupts;
pub mod stack;

use core::fmt;

pub use arch::current::{context_switch, Context};

/// Result type for HAL operations
pub type HalResult<T> = Result<T, HalError>;

/// Errors that can occur in HAL operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    /// Invalid parameter provided
    InvalidParameter,
    /// Memory allocation failed
    OutOfMemory,
    /// The host rejected the request (carries `errno`)
    Os(i32),
}

impl HalError {
    /// Build an error from the calling thread's current `errno`
    pub fn last_os_error() -> Self {
        Self::Os(cpu::errno())
    }
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HalError::InvalidParameter => write!(f, "invalid parameter"),
            HalError::OutOfMemory => write!(f, "out of memory"),
            HalError::Os(errno) => write!(f, "host error (errno={})", errno),
        }
    }
}

impl std::error::Error for HalError {}
