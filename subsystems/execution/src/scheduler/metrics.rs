//! # Scheduler Metrics
//!
//! Counters updated on every scheduling decision. They are atomics so the
//! timer interrupt can record into them without taking the scheduler lock.

use core::sync::atomic::{AtomicU64, Ordering};

/// Scheduler metrics
#[derive(Debug)]
pub struct SchedulerMetrics {
    /// Total context switches
    context_switches: AtomicU64,
    /// Total timer ticks delivered
    ticks: AtomicU64,
    /// Total voluntary yields
    voluntary_yields: AtomicU64,
    /// Total preemptions
    preemptions: AtomicU64,
    /// Total blocking semaphore waits
    blocks: AtomicU64,
    /// Total fiber exits
    exits: AtomicU64,
    /// Ticks dropped because the scheduler state was held
    skipped_ticks: AtomicU64,
}

/// Point-in-time copy of [`SchedulerMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Total context switches
    pub context_switches: u64,
    /// Total timer ticks delivered
    pub ticks: u64,
    /// Total voluntary yields
    pub voluntary_yields: u64,
    /// Total preemptions
    pub preemptions: u64,
    /// Total blocking semaphore waits
    pub blocks: u64,
    /// Total fiber exits
    pub exits: u64,
    /// Ticks dropped because the scheduler state was held
    pub skipped_ticks: u64,
}

impl MetricsSnapshot {
    /// Counter-wise difference `self - earlier`
    pub fn since(&self, earlier: &MetricsSnapshot) -> MetricsSnapshot {
        MetricsSnapshot {
            context_switches: self.context_switches.saturating_sub(earlier.context_switches),
            ticks: self.ticks.saturating_sub(earlier.ticks),
            voluntary_yields: self.voluntary_yields.saturating_sub(earlier.voluntary_yields),
            preemptions: self.preemptions.saturating_sub(earlier.preemptions),
            blocks: self.blocks.saturating_sub(earlier.blocks),
            exits: self.exits.saturating_sub(earlier.exits),
            skipped_ticks: self.skipped_ticks.saturating_sub(earlier.skipped_ticks),
        }
    }
}

impl SchedulerMetrics {
    /// Create new metrics
    pub const fn new() -> Self {
        Self {
            context_switches: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
            voluntary_yields: AtomicU64::new(0),
            preemptions: AtomicU64::new(0),
            blocks: AtomicU64::new(0),
            exits: AtomicU64::new(0),
            skipped_ticks: AtomicU64::new(0),
        }
    }

    /// Record a context switch
    pub fn record_context_switch(&self) {
        self.context_switches.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a timer tick
    pub fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a voluntary yield
    pub fn record_yield(&self) {
        self.voluntary_yields.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a preemption
    pub fn record_preemption(&self) {
        self.preemptions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a blocking wait
    pub fn record_block(&self) {
        self.blocks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a fiber exit
    pub fn record_exit(&self) {
        self.exits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a skipped tick
    pub fn record_skipped_tick(&self) {
        self.skipped_ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Get total context switches
    pub fn context_switches(&self) -> u64 {
        self.context_switches.load(Ordering::Relaxed)
    }

    /// Copy all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            context_switches: self.context_switches.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
            voluntary_yields: self.voluntary_yields.load(Ordering::Relaxed),
            preemptions: self.preemptions.load(Ordering::Relaxed),
            blocks: self.blocks.load(Ordering::Relaxed),
            exits: self.exits.load(Ordering::Relaxed),
            skipped_ticks: self.skipped_ticks.load(Ordering::Relaxed),
        }
    }
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
