//! # Diagnostics
//!
//! Read-only reporting over the control-block table.

use crate::thread::{FiberFlags, FiberName, FiberState};
use crate::FiberId;
use core::fmt;
use std::time::Duration;

/// Point-in-time view of one fiber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiberSnapshot {
    /// Fiber ID
    pub id: FiberId,
    /// Display name
    pub name: FiberName,
    /// State at snapshot time
    pub state: FiberState,
    /// On-CPU time, including the open slice of a running fiber
    pub accounted_time: Duration,
    /// Times the scheduler picked the fiber
    pub turns: u64,
    /// Flags
    pub flags: FiberFlags,
}

/// Tab-separated state table
///
/// ```text
/// Thread Name	State	Running Time
/// producer	EXIT	1.25
/// ```
///
/// Running time is printed in milliseconds with two decimals.
#[derive(Debug, Clone, Copy)]
pub struct StateTable<'a>(pub &'a [FiberSnapshot]);

impl fmt::Display for StateTable<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Thread Name\tState\tRunning Time")?;
        for fiber in self.0 {
            let millis = fiber.accounted_time.as_secs_f64() * 1000.0;
            writeln!(f, "{}\t{}\t{:.2}", fiber.name, fiber.state, millis)?;
        }
        Ok(())
    }
}
