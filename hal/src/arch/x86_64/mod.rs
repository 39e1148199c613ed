//! # x86_64 Architecture HAL Implementation
//!
//! Context switching for the System V AMD64 ABI.

pub mod context;

pub use context::{context_switch, Context};
