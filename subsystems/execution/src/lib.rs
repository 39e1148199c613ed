//! # Strand Execution Subsystem
//!
//! The execution subsystem manages:
//! - Fiber creation and exit
//! - The control-block table
//! - The round-robin run queue and scheduler
//! - Timer-driven preemption
//! - Counting semaphores
//!
//! ## Key Principle
//!
//! Every fiber of a runtime is multiplexed onto the OS thread that called
//! [`thread_init`]. Fibers interleave, they never run in parallel. The
//! scheduler is entered at exactly four points: exit, a blocking
//! semaphore wait, a voluntary yield and the timer interrupt.
//!
//! ```no_run
//! use strand_execution as strand;
//!
//! fn worker() {
//!     for _ in 0..3 {
//!         strand::thread_yield();
//!     }
//! }
//!
//! strand::thread_init().unwrap();
//! strand::thread_create("worker", worker, 64 * 1024).unwrap();
//! let summary = strand::run_threads().unwrap();
//! assert_eq!(summary.exited, 1);
//! strand::thread_shutdown().unwrap();
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod config;
pub mod context;
pub mod diagnostics;
pub mod runtime;
pub mod scheduler;
pub mod sync;
pub mod thread;

#[cfg(test)]
mod runtime_tests;

use core::fmt;
use strand_hal::HalError;

pub use config::RuntimeConfig;
pub use diagnostics::{FiberSnapshot, StateTable};
pub use runtime::{
    create_semaphore, current_fiber, destroy_semaphore, metrics, run_threads, semaphore_signal,
    semaphore_value, semaphore_wait, semaphore_waiters, set_quantum_size, stop_threads,
    thread_create, thread_exit, thread_init, thread_init_with, thread_shutdown, thread_spawn,
    thread_state, thread_yield,
};
pub use scheduler::metrics::MetricsSnapshot;
pub use scheduler::RunSummary;
pub use thread::FiberState;

/// Identifier of a fiber
///
/// Handles are indices into the control-block table. They are assigned in
/// creation order and never reused by the runtime that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FiberId(usize);

impl FiberId {
    /// Create an ID from a table index
    pub const fn from_index(index: usize) -> Self {
        Self(index)
    }

    /// Get the table index
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber#{}", self.0)
    }
}

/// Identifier of a semaphore
///
/// Destroyed semaphores keep their slot, so a handle is never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SemaphoreId(usize);

impl SemaphoreId {
    /// Create an ID from a table index
    pub const fn from_index(index: usize) -> Self {
        Self(index)
    }

    /// Get the table index
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SemaphoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sem#{}", self.0)
    }
}

/// Execution result type
pub type ExecResult<T> = Result<T, ExecError>;

/// Execution errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    /// The control-block table is full
    ThreadCapacity,
    /// The semaphore table is full
    SemaphoreCapacity,
    /// The semaphore still has blocked waiters
    SemaphoreBusy,
    /// No runtime is bound to the calling OS thread
    NotInitialized,
    /// A runtime is already bound to the calling OS thread
    AlreadyInitialized,
    /// The scheduler loop is already running
    AlreadyRunning,
    /// The operation may only be called from the host context
    NotHost,
    /// Invalid argument
    InvalidArgument,
    /// Host facility failure
    Hal(HalError),
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::ThreadCapacity => write!(f, "fiber table is full"),
            ExecError::SemaphoreCapacity => write!(f, "semaphore table is full"),
            ExecError::SemaphoreBusy => write!(f, "semaphore has blocked waiters"),
            ExecError::NotInitialized => write!(f, "no runtime on this thread"),
            ExecError::AlreadyInitialized => write!(f, "runtime already initialized on this thread"),
            ExecError::AlreadyRunning => write!(f, "scheduler is already running"),
            ExecError::NotHost => write!(f, "operation is only allowed from the host context"),
            ExecError::InvalidArgument => write!(f, "invalid argument"),
            ExecError::Hal(e) => write!(f, "host facility error: {}", e),
        }
    }
}

impl std::error::Error for ExecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExecError::Hal(e) => Some(e),
            _ => None,
        }
    }
}

impl From<HalError> for ExecError {
    fn from(e: HalError) -> Self {
        ExecError::Hal(e)
    }
}
