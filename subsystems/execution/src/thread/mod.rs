//! # Fiber Management
//!
//! Control blocks, the control-block table and the fiber state machine.

pub mod control_block;
pub mod registry;
pub mod states;

pub use control_block::*;
pub use registry::*;
pub use states::*;
