//! # Synchronization
//!
//! Counting semaphores whose waiters are fibers.

pub mod semaphore;

pub use semaphore::*;
