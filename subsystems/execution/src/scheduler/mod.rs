//! # Round-Robin Scheduler
//!
//! Scheduling state of one runtime: the control-block table, the run
//! queue, the semaphore table and the identity of whoever executes right
//! now. Every method here is pure bookkeeping; the context switches they
//! decide on are returned as [`Switch`] values and performed by the
//! runtime once the scheduler lock is released.

pub mod metrics;
pub mod queue;
pub mod traits;

use crate::config::RuntimeConfig;
use crate::context::{self, Switch, SwitchReason};
use crate::diagnostics::FiberSnapshot;
use crate::sync::{SemaphoreTable, SignalOutcome, WaitOutcome};
use crate::thread::{ControlBlock, ControlBlockTable, FiberEntry, FiberFlags, FiberState, Trampoline};
use crate::{ExecResult, FiberId, SemaphoreId};
use metrics::MetricsSnapshot;
use queue::FifoQueue;
use std::time::{Duration, Instant};
use strand_hal::stack::StackRegion;
use strand_hal::Context;
use traits::RunQueue;

/// Who owns the CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Current {
    /// The code that called `run_threads`
    Host,
    /// A fiber
    Fiber(FiberId),
}

/// Outcome of one `run_threads` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunSummary {
    /// Wall time spent in the scheduler loop
    pub elapsed: Duration,
    /// Fibers in `Exit` when the loop returned
    pub exited: usize,
    /// Fibers in `Blocked` when the loop returned
    pub blocked: usize,
    /// Fibers in `Runnable` when the loop returned
    pub runnable: usize,
    /// The loop returned because of a stop request
    pub stopped: bool,
    /// Counters accumulated during this call
    pub metrics: MetricsSnapshot,
}

impl RunSummary {
    /// Every remaining fiber waits on a semaphore nobody can signal
    pub fn is_deadlocked(&self) -> bool {
        !self.stopped && self.runnable == 0 && self.blocked > 0
    }
}

/// Scheduler state
#[derive(Debug)]
pub struct Scheduler {
    /// All fibers
    threads: ControlBlockTable,
    /// All semaphores
    semaphores: SemaphoreTable,
    /// Runnable fibers, in scheduling order
    run_queue: FifoQueue,
    /// Who executes right now
    current: Current,
    /// Saved context of the host
    host_context: Context,
    /// Timer period
    quantum: Duration,
    /// Return to the host at the next decision
    stop_requested: bool,
    /// Start of the current fiber's time slice
    slice_start: Option<Instant>,
    /// First code run on a fresh fiber stack
    trampoline: Trampoline,
    /// Lower bound for stack sizes
    min_stack_size: usize,
}

impl Scheduler {
    /// Create an empty scheduler
    pub fn new(config: &RuntimeConfig, trampoline: Trampoline) -> Self {
        Self {
            threads: ControlBlockTable::new(config.max_threads),
            semaphores: SemaphoreTable::new(config.max_semaphores),
            run_queue: FifoQueue::with_capacity(config.max_threads),
            current: Current::Host,
            host_context: Context::empty(),
            quantum: config.quantum,
            stop_requested: false,
            slice_start: None,
            trampoline,
            min_stack_size: config.min_stack_size,
        }
    }

    // =========================================================================
    // Fibers
    // =========================================================================

    /// Create a fiber and append it to the run queue
    pub fn create(&mut self, name: &str, entry: FiberEntry, stack_size: usize) -> ExecResult<FiberId> {
        let executing = self.current_fiber();
        self.threads.reap_exited(executing);

        let size = stack_size.max(self.min_stack_size);
        let trampoline = self.trampoline;
        let id = self.threads.insert(|id| {
            let stack = StackRegion::allocate(size)?;
            Ok(ControlBlock::new(id, name, entry, stack, trampoline))
        })?;

        self.run_queue.enqueue(id);
        log::debug!("{} created ({:?}, {} byte stack)", id, name, size);
        Ok(id)
    }

    /// Mark the executing fiber as exited
    ///
    /// Returns `None` when called from the host.
    pub fn exit_current(&mut self) -> Option<FiberId> {
        let id = self.current_fiber()?;
        let cb = self.threads.get_mut(id)?;
        cb.set_state(FiberState::Exit);
        log::debug!("{} exited after {} turn(s)", id, cb.turns());
        Some(id)
    }

    /// Take the entry function of the executing fiber
    pub fn take_current_entry(&mut self) -> Option<FiberEntry> {
        let id = self.current_fiber()?;
        self.threads.get_mut(id)?.take_entry()
    }

    /// Record that a fiber's entry function panicked
    pub fn mark_panicked(&mut self, id: FiberId) {
        if let Some(cb) = self.threads.get_mut(id) {
            cb.set_flag(FiberFlags::PANICKED);
        }
    }

    /// Release the stacks of exited fibers that are not executing
    pub fn reap_exited(&mut self) -> usize {
        let executing = self.current_fiber();
        self.threads.reap_exited(executing)
    }

    /// Get a fiber's control block
    pub fn fiber(&self, id: FiberId) -> Option<&ControlBlock> {
        self.threads.get(id)
    }

    /// Control-block table
    pub fn threads(&self) -> &ControlBlockTable {
        &self.threads
    }

    /// Semaphore table
    pub fn semaphores(&self) -> &SemaphoreTable {
        &self.semaphores
    }

    /// Run queue
    pub fn run_queue(&self) -> &FifoQueue {
        &self.run_queue
    }

    /// Who executes right now
    pub fn current(&self) -> Current {
        self.current
    }

    /// The executing fiber, `None` on the host
    pub fn current_fiber(&self) -> Option<FiberId> {
        match self.current {
            Current::Fiber(id) => Some(id),
            Current::Host => None,
        }
    }

    // =========================================================================
    // Quantum and stop requests
    // =========================================================================

    /// Timer period
    pub fn quantum(&self) -> Duration {
        self.quantum
    }

    /// Set the timer period (clamped)
    pub fn set_quantum(&mut self, quantum: Duration) -> Duration {
        self.quantum = RuntimeConfig::clamp_quantum(quantum);
        self.quantum
    }

    /// Ask the scheduler to return to the host at the next decision
    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    /// Consume a pending stop request
    pub fn take_stop_request(&mut self) -> bool {
        core::mem::take(&mut self.stop_requested)
    }

    // =========================================================================
    // Semaphores
    // =========================================================================

    /// Create a semaphore
    pub fn create_semaphore(&mut self, initial: i32) -> ExecResult<SemaphoreId> {
        let id = self.semaphores.create(initial)?;
        log::debug!("{} created with value {}", id, initial);
        Ok(id)
    }

    /// Destroy a semaphore
    pub fn destroy_semaphore(&mut self, id: SemaphoreId) -> ExecResult<()> {
        self.semaphores.destroy(id)
    }

    /// Wait on a semaphore on behalf of whoever executes
    ///
    /// On [`WaitOutcome::Blocked`] the executing fiber is already `Blocked`
    /// and queued; the caller must switch away.
    pub fn semaphore_wait(&mut self, id: SemaphoreId) -> WaitOutcome {
        let waiter = self.current_fiber();
        let outcome = self.semaphores.wait(id, waiter);

        match outcome {
            WaitOutcome::Blocked => {
                if let Some(cb) = waiter.and_then(|fiber| self.threads.get_mut(fiber)) {
                    cb.set_state(FiberState::Blocked);
                    cb.set_blocked_on(Some(id));
                    log::debug!("{} blocked on {}", cb.id(), id);
                }
            }
            WaitOutcome::Unavailable => {
                log::warn!("host cannot block on {}: no unit available", id);
            }
            WaitOutcome::Invalid => {
                log::debug!("semaphore_wait({}): invalid handle", id);
            }
            WaitOutcome::Acquired => {}
        }
        outcome
    }

    /// Signal a semaphore, making its oldest waiter runnable
    pub fn semaphore_signal(&mut self, id: SemaphoreId) -> SignalOutcome {
        let outcome = self.semaphores.signal(id);

        match outcome {
            SignalOutcome::Released(fiber) => self.wake(fiber, id),
            SignalOutcome::MissingWaiter => {
                log::error!("{}: count promises a waiter but the wait queue is empty", id);
            }
            SignalOutcome::Invalid => {
                log::debug!("semaphore_signal({}): invalid handle", id);
            }
            SignalOutcome::Incremented => {}
        }
        outcome
    }

    fn wake(&mut self, fiber: FiberId, sem: SemaphoreId) {
        let Some(cb) = self.threads.get_mut(fiber) else {
            log::error!("{}: released unknown {}", sem, fiber);
            return;
        };
        debug_assert_eq!(cb.blocked_on(), Some(sem));
        cb.set_blocked_on(None);
        cb.set_state(FiberState::Runnable);
        self.run_queue.enqueue(fiber);
        log::debug!("{} released by {}", fiber, sem);
    }

    // =========================================================================
    // Switching
    // =========================================================================

    /// Decide the next context switch
    ///
    /// 1. With an empty run queue: a fiber that is still `Running` keeps the
    ///    CPU, the host keeps the CPU, and a fiber that blocked or exited
    ///    hands it back to the host.
    /// 2. Otherwise the head of the queue is popped first, then a `Running`
    ///    outgoing fiber goes to the tail. The queue never grows here, so
    ///    the interrupt path does not allocate.
    ///
    /// A pending stop request sends a fiber straight back to the host.
    pub fn switch_thread(&mut self, reason: SwitchReason) -> Option<Switch> {
        let outgoing = self.current;
        let now = Instant::now();

        let from = match outgoing {
            Current::Fiber(from) => {
                if self.stop_requested {
                    return self.switch_to_host(from, reason, now);
                }
                Some(from)
            }
            Current::Host => None,
        };
        let outgoing_running = from
            .and_then(|id| self.threads.get(id))
            .is_some_and(|cb| cb.state() == FiberState::Running);

        let Some(next) = self.run_queue.dequeue() else {
            return match from {
                Some(from) if !outgoing_running => self.switch_to_host(from, reason, now),
                _ => None,
            };
        };

        self.account(now);
        if let (Some(from), true) = (from, outgoing_running) {
            if let Some(cb) = self.threads.get_mut(from) {
                cb.set_state(FiberState::Runnable);
                self.run_queue.enqueue(from);
            }
        }

        let Some(incoming) = self.threads.get_mut(next) else {
            context::fatal(format_args!("{} is queued but has no control block", next));
        };
        if incoming.state() != FiberState::Runnable {
            context::fatal(format_args!("{} was queued in state {}", next, incoming.state()));
        }
        incoming.set_state(FiberState::Running);
        incoming.record_turn();
        let resume = incoming.context() as *const Context;

        self.current = Current::Fiber(next);
        self.slice_start = Some(now);

        let save = match from {
            None => &mut self.host_context as *mut Context,
            Some(from) => match self.threads.get_mut(from) {
                Some(cb) => cb.context_mut() as *mut Context,
                None => context::fatal(format_args!("{} has no control block", from)),
            },
        };

        Some(Switch::new(save, resume, outgoing, Current::Fiber(next), reason))
    }

    fn switch_to_host(&mut self, from: FiberId, reason: SwitchReason, now: Instant) -> Option<Switch> {
        self.account(now);

        let cb = self.threads.get_mut(from)?;
        if cb.state() == FiberState::Running {
            cb.set_state(FiberState::Runnable);
            self.run_queue.enqueue(from);
        }
        let save = cb.context_mut() as *mut Context;

        self.current = Current::Host;
        Some(Switch::new(save, &self.host_context, Current::Fiber(from), Current::Host, reason))
    }

    /// Close the executing fiber's time slice
    fn account(&mut self, now: Instant) {
        if let (Current::Fiber(id), Some(start)) = (self.current, self.slice_start.take()) {
            if let Some(cb) = self.threads.get_mut(id) {
                cb.add_run_time(now.saturating_duration_since(start));
            }
        }
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    /// Snapshot every fiber, including the open slice of the executing one
    pub fn snapshot(&self) -> Vec<FiberSnapshot> {
        let now = Instant::now();
        self.threads
            .iter()
            .map(|cb| {
                let mut accounted_time = cb.run_time();
                if self.current == Current::Fiber(cb.id()) {
                    if let Some(start) = self.slice_start {
                        accounted_time += now.saturating_duration_since(start);
                    }
                }
                FiberSnapshot {
                    id: cb.id(),
                    name: *cb.name(),
                    state: cb.state(),
                    accounted_time,
                    turns: cb.turns(),
                    flags: cb.flags(),
                }
            })
            .collect()
    }

    /// Fill the per-state counts of a summary
    pub fn summarize(&self, summary: &mut RunSummary) {
        summary.exited = self.threads.count_by_state(FiberState::Exit);
        summary.blocked = self.threads.count_by_state(FiberState::Blocked);
        summary.runnable = self.threads.count_by_state(FiberState::Runnable);
    }

    /// Check that every fiber's state agrees with the queues it is in
    ///
    /// `Runnable` fibers are in the run queue exactly once, `Blocked` ones in
    /// exactly one wait queue, the others in none.
    pub fn is_consistent(&self) -> bool {
        for cb in self.threads.iter() {
            let id = cb.id();
            let in_run_queue = self.run_queue.contains(id);
            let waiting_on: Vec<SemaphoreId> = self
                .semaphores
                .iter()
                .filter(|(_, sem)| sem.is_waiting(id))
                .map(|(sid, _)| sid)
                .collect();

            let ok = match cb.state() {
                FiberState::Runnable => in_run_queue && waiting_on.is_empty(),
                FiberState::Blocked => {
                    !in_run_queue
                        && waiting_on.len() == 1
                        && cb.blocked_on() == waiting_on.first().copied()
                }
                FiberState::Running => {
                    !in_run_queue && waiting_on.is_empty() && self.current == Current::Fiber(id)
                }
                FiberState::Exit => !in_run_queue && waiting_on.is_empty(),
            };
            if !ok {
                log::error!("{} in state {} is queued inconsistently", id, cb.state());
                return false;
            }
        }
        self.semaphores.iter().all(|(_, sem)| sem.is_consistent())
    }
}
