//! # Scheduler Traits
//!
//! Defines the interface the scheduler expects from a run queue.

use crate::FiberId;

/// Run queue trait
///
/// Queues hold fiber IDs only; the state of each fiber lives in its
/// control block.
pub trait RunQueue {
    /// Add a fiber at the tail
    fn enqueue(&mut self, id: FiberId);

    /// Remove and return the next fiber
    fn dequeue(&mut self) -> Option<FiberId>;

    /// Check if the queue is empty
    fn is_empty(&self) -> bool;

    /// Get the number of queued fibers
    fn len(&self) -> usize;

    /// Check if a fiber is queued
    fn contains(&self, id: FiberId) -> bool;
}
