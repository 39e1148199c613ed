//! # Runtime Configuration

use crate::{ExecError, ExecResult};
use core::str::FromStr;
use std::time::Duration;

/// Configuration for a fiber runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Capacity of the control-block table
    pub max_threads: usize,
    /// Capacity of the semaphore table
    pub max_semaphores: usize,
    /// Timer interrupt period
    pub quantum: Duration,
    /// Lower bound applied to every requested stack size
    pub min_stack_size: usize,
    /// Arm the timer interrupt while the scheduler runs
    pub preemption: bool,
}

impl RuntimeConfig {
    /// Default fiber capacity
    pub const DEFAULT_MAX_THREADS: usize = 1000;
    /// Default semaphore capacity
    pub const DEFAULT_MAX_SEMAPHORES: usize = 100;
    /// Default quantum: 100µs
    pub const DEFAULT_QUANTUM: Duration = Duration::from_micros(100);
    /// Minimum quantum: 10µs
    pub const MIN_QUANTUM: Duration = Duration::from_micros(10);
    /// Maximum quantum: 1s
    pub const MAX_QUANTUM: Duration = Duration::from_secs(1);
    /// Default minimum stack size: 16 KiB
    pub const DEFAULT_MIN_STACK_SIZE: usize = 16 * 1024;

    /// Create default configuration
    pub fn new() -> Self {
        Self {
            max_threads: Self::DEFAULT_MAX_THREADS,
            max_semaphores: Self::DEFAULT_MAX_SEMAPHORES,
            quantum: Self::DEFAULT_QUANTUM,
            min_stack_size: Self::DEFAULT_MIN_STACK_SIZE,
            preemption: true,
        }
    }

    /// Create a cooperative configuration (no timer interrupt)
    ///
    /// Fibers only switch on exit, blocking waits and yields.
    pub fn cooperative() -> Self {
        Self::new().with_preemption(false)
    }

    /// Set the fiber capacity
    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    /// Set the semaphore capacity
    pub fn with_max_semaphores(mut self, max_semaphores: usize) -> Self {
        self.max_semaphores = max_semaphores;
        self
    }

    /// Set the quantum (clamped to `[MIN_QUANTUM, MAX_QUANTUM]`)
    pub fn with_quantum(mut self, quantum: Duration) -> Self {
        self.quantum = Self::clamp_quantum(quantum);
        self
    }

    /// Set the minimum stack size
    pub fn with_min_stack_size(mut self, size: usize) -> Self {
        self.min_stack_size = size;
        self
    }

    /// Enable or disable preemption
    pub fn with_preemption(mut self, preemption: bool) -> Self {
        self.preemption = preemption;
        self
    }

    /// Clamp a quantum to the supported range
    pub fn clamp_quantum(quantum: Duration) -> Duration {
        quantum.clamp(Self::MIN_QUANTUM, Self::MAX_QUANTUM)
    }

    /// Check the configuration for values the runtime cannot honor
    pub fn validate(&self) -> ExecResult<()> {
        if self.max_threads == 0 || self.max_semaphores == 0 || self.min_stack_size == 0 {
            return Err(ExecError::InvalidArgument);
        }
        if self.quantum < Self::MIN_QUANTUM || self.quantum > Self::MAX_QUANTUM {
            return Err(ExecError::InvalidArgument);
        }
        Ok(())
    }

    /// Build a configuration from `STRAND_*` environment variables
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `STRAND_MAX_THREADS` | `max_threads` |
    /// | `STRAND_MAX_SEMAPHORES` | `max_semaphores` |
    /// | `STRAND_QUANTUM_US` | `quantum` (microseconds) |
    /// | `STRAND_MIN_STACK` | `min_stack_size` (bytes) |
    /// | `STRAND_PREEMPTION` | `preemption` (`1/0`, `true/false`, `on/off`) |
    ///
    /// Unset variables keep their defaults; unparsable ones are ignored
    /// with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::new();

        if let Some(value) = parse_var(&lookup, "STRAND_MAX_THREADS") {
            config.max_threads = value;
        }
        if let Some(value) = parse_var(&lookup, "STRAND_MAX_SEMAPHORES") {
            config.max_semaphores = value;
        }
        if let Some(micros) = parse_var::<u64, _>(&lookup, "STRAND_QUANTUM_US") {
            config.quantum = Self::clamp_quantum(Duration::from_micros(micros));
        }
        if let Some(value) = parse_var(&lookup, "STRAND_MIN_STACK") {
            config.min_stack_size = value;
        }
        if let Some(raw) = lookup("STRAND_PREEMPTION") {
            match parse_switch(&raw) {
                Some(enabled) => config.preemption = enabled,
                None => log::warn!("ignoring STRAND_PREEMPTION={:?}: expected on/off", raw),
            }
        }

        config
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("ignoring {}={:?}: not a number", key, raw);
            None
        }
    }
}

fn parse_switch(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_threads, 1000);
        assert_eq!(config.max_semaphores, 100);
        assert_eq!(config.quantum, Duration::from_micros(100));
        assert!(config.preemption);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cooperative_preset() {
        let config = RuntimeConfig::cooperative();
        assert!(!config.preemption);
        assert_eq!(config.max_threads, RuntimeConfig::DEFAULT_MAX_THREADS);
    }

    #[test]
    fn test_quantum_is_clamped() {
        let config = RuntimeConfig::new().with_quantum(Duration::from_nanos(1));
        assert_eq!(config.quantum, RuntimeConfig::MIN_QUANTUM);

        let config = RuntimeConfig::new().with_quantum(Duration::from_secs(60));
        assert_eq!(config.quantum, RuntimeConfig::MAX_QUANTUM);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        assert_eq!(
            RuntimeConfig::new().with_max_threads(0).validate(),
            Err(ExecError::InvalidArgument)
        );
        assert_eq!(
            RuntimeConfig::new().with_max_semaphores(0).validate(),
            Err(ExecError::InvalidArgument)
        );
        assert_eq!(
            RuntimeConfig::new().with_min_stack_size(0).validate(),
            Err(ExecError::InvalidArgument)
        );
    }

    #[test]
    fn test_from_lookup() {
        let config = RuntimeConfig::from_lookup(lookup_from(&[
            ("STRAND_MAX_THREADS", "16"),
            ("STRAND_MAX_SEMAPHORES", " 4 "),
            ("STRAND_QUANTUM_US", "2500"),
            ("STRAND_MIN_STACK", "65536"),
            ("STRAND_PREEMPTION", "off"),
        ]));
        assert_eq!(config.max_threads, 16);
        assert_eq!(config.max_semaphores, 4);
        assert_eq!(config.quantum, Duration::from_micros(2500));
        assert_eq!(config.min_stack_size, 65536);
        assert!(!config.preemption);
    }

    #[test]
    fn test_from_lookup_ignores_garbage() {
        let config = RuntimeConfig::from_lookup(lookup_from(&[
            ("STRAND_MAX_THREADS", "many"),
            ("STRAND_PREEMPTION", "maybe"),
        ]));
        assert_eq!(config, RuntimeConfig::new());
    }
}
