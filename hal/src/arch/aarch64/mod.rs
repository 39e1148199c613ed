//! # AArch64 Architecture HAL Implementation
//!
//! Context switching for the AAPCS64 ABI.

pub mod context;

pub use context::{context_switch, Context};
