//! # Architecture-Specific HAL Modules
//!
//! This module re-exports the appropriate context-switch implementation
//! based on the target architecture.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;

        // Re-export the current architecture's HAL
        pub use self::x86_64 as current;
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;

        // Re-export the current architecture's HAL
        pub use self::aarch64 as current;
    } else {
        compile_error!("strand-hal: unsupported target architecture");
    }
}

// Future architectures
// #[cfg(target_arch = "riscv64")]
// pub mod riscv64;
