//! # Counting Semaphores
//!
//! Pure bookkeeping: the table decides who blocks and who is released, the
//! scheduler applies the resulting fiber state changes.
//!
//! The count is the source of truth. A negative count is the number of
//! blocked waiters, and the wait queue length is checked against it rather
//! than consulted on its own.

use crate::scheduler::queue::FifoQueue;
use crate::scheduler::traits::RunQueue;
use crate::{ExecError, ExecResult, FiberId, SemaphoreId};

/// A counting semaphore
#[derive(Debug)]
pub struct Semaphore {
    /// Value given at creation
    initial: i32,
    /// Current value; negative means `-count` fibers are waiting
    count: i32,
    /// Blocked fibers, oldest first
    waiters: FifoQueue,
}

impl Semaphore {
    /// Create a semaphore with `initial` units
    pub fn new(initial: i32) -> Self {
        Self {
            initial,
            count: initial,
            waiters: FifoQueue::new(),
        }
    }

    /// Current value
    pub fn count(&self) -> i32 {
        self.count
    }

    /// Number of blocked fibers
    pub fn waiters(&self) -> usize {
        self.waiters.len()
    }

    /// Check whether a fiber waits here
    pub fn is_waiting(&self, id: FiberId) -> bool {
        self.waiters.contains(id)
    }

    /// Check that the wait queue matches the count
    pub fn is_consistent(&self) -> bool {
        let expected = if self.count < 0 { self.count.unsigned_abs() as usize } else { 0 };
        expected == self.waiters.len()
    }
}

/// Result of a wait request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A unit was taken; the caller continues
    Acquired,
    /// The caller was queued and must be switched away
    Blocked,
    /// The host asked for a unit that is not available
    Unavailable,
    /// The handle does not name a live semaphore
    Invalid,
}

/// Result of a signal request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// The oldest waiter was released and must be made runnable
    Released(FiberId),
    /// No one was waiting; the count went up
    Incremented,
    /// The count says a waiter exists but the queue is empty
    MissingWaiter,
    /// The handle does not name a live semaphore
    Invalid,
}

/// Semaphore table
#[derive(Debug)]
pub struct SemaphoreTable {
    /// Slots in creation order; destroyed slots stay `None`
    slots: Vec<Option<Semaphore>>,
    /// Maximum number of semaphores ever created
    capacity: usize,
}

impl SemaphoreTable {
    /// Create an empty table
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            capacity,
        }
    }

    /// Create a semaphore
    ///
    /// A negative initial value would announce waiters that do not exist,
    /// so it is rejected with [`ExecError::InvalidArgument`].
    pub fn create(&mut self, initial: i32) -> ExecResult<SemaphoreId> {
        if initial < 0 {
            return Err(ExecError::InvalidArgument);
        }
        if self.slots.len() >= self.capacity {
            return Err(ExecError::SemaphoreCapacity);
        }
        let id = SemaphoreId::from_index(self.slots.len());
        self.slots.push(Some(Semaphore::new(initial)));
        Ok(id)
    }

    /// Get a live semaphore
    pub fn get(&self, id: SemaphoreId) -> Option<&Semaphore> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    fn get_mut(&mut self, id: SemaphoreId) -> Option<&mut Semaphore> {
        self.slots.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Number of slots ever handed out
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Check if no semaphore was ever created
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Maximum number of semaphores
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterate over live semaphores
    pub fn iter(&self) -> impl Iterator<Item = (SemaphoreId, &Semaphore)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|s| (SemaphoreId::from_index(i), s)))
    }

    /// Take a unit on behalf of `waiter`
    ///
    /// `waiter` is `None` for the host, which cannot block: it only takes a
    /// unit that is available.
    pub fn wait(&mut self, id: SemaphoreId, waiter: Option<FiberId>) -> WaitOutcome {
        let Some(sem) = self.get_mut(id) else {
            return WaitOutcome::Invalid;
        };

        match waiter {
            None if sem.count > 0 => {
                sem.count -= 1;
                WaitOutcome::Acquired
            }
            None => WaitOutcome::Unavailable,
            Some(fiber) => {
                sem.count -= 1;
                if sem.count < 0 {
                    sem.waiters.enqueue(fiber);
                    WaitOutcome::Blocked
                } else {
                    WaitOutcome::Acquired
                }
            }
        }
    }

    /// Return a unit, releasing the oldest waiter if there is one
    pub fn signal(&mut self, id: SemaphoreId) -> SignalOutcome {
        let Some(sem) = self.get_mut(id) else {
            return SignalOutcome::Invalid;
        };

        sem.count = sem.count.saturating_add(1);
        if sem.count > 0 {
            debug_assert!(sem.waiters.is_empty());
            return SignalOutcome::Incremented;
        }

        match sem.waiters.dequeue() {
            Some(fiber) => SignalOutcome::Released(fiber),
            None => SignalOutcome::MissingWaiter,
        }
    }

    /// Destroy a semaphore
    ///
    /// Refused while fibers wait on it. An unknown or already destroyed
    /// handle is accepted as a no-op.
    pub fn destroy(&mut self, id: SemaphoreId) -> ExecResult<()> {
        let Some(slot) = self.slots.get_mut(id.index()) else {
            log::debug!("destroy_semaphore({}): unknown handle", id);
            return Ok(());
        };
        let Some(sem) = slot.as_ref() else {
            log::debug!("destroy_semaphore({}): already destroyed", id);
            return Ok(());
        };

        if !sem.waiters.is_empty() {
            log::error!(
                "cannot destroy {}: {} fiber(s) are waiting on it",
                id,
                sem.waiters.len()
            );
            return Err(ExecError::SemaphoreBusy);
        }
        if sem.count != sem.initial {
            log::warn!(
                "{} destroyed with value {} (created with {}): waits and signals do not match",
                id,
                sem.count,
                sem.initial
            );
        }

        *slot = None;
        Ok(())
    }
}
