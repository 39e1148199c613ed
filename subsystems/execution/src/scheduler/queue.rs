//! # Run Queues
//!
//! FIFO queue used both as the scheduler's run queue and as the wait
//! queue of every semaphore.

use super::traits::RunQueue;
use crate::FiberId;
use std::collections::VecDeque;

/// Simple FIFO run queue
#[derive(Debug, Clone, Default)]
pub struct FifoQueue {
    queue: VecDeque<FiberId>,
}

impl FifoQueue {
    /// Create a new FIFO queue
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    /// Create a queue that holds `capacity` fibers without reallocating
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
        }
    }

    /// Number of fibers the queue holds without reallocating
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Iterate from head to tail
    pub fn iter(&self) -> impl Iterator<Item = FiberId> + '_ {
        self.queue.iter().copied()
    }
}

impl RunQueue for FifoQueue {
    fn enqueue(&mut self, id: FiberId) {
        debug_assert!(!self.contains(id), "{} queued twice", id);
        self.queue.push_back(id);
    }

    fn dequeue(&mut self) -> Option<FiberId> {
        self.queue.pop_front()
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn contains(&self, id: FiberId) -> bool {
        self.queue.contains(&id)
    }
}
