//! # Context Switch
//!
//! On AArch64 the callee-saved state is x19-x28, the frame pointer, the
//! link register, the stack pointer and the low 64 bits of v8-v15.

use core::arch::naked_asm;
use core::mem::{offset_of, size_of};
use static_assertions::const_assert_eq;

/// Saved CPU context for context switching
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Stack pointer
    sp: u64,
    /// Link register (return address)
    lr: u64,
    /// Frame pointer
    fp: u64,
    /// General purpose (callee-saved)
    x19: u64,
    x20: u64,
    x21: u64,
    x22: u64,
    x23: u64,
    x24: u64,
    x25: u64,
    x26: u64,
    x27: u64,
    x28: u64,
    /// Floating-point/SIMD (callee-saved, lower 64 bits)
    d8: u64,
    d9: u64,
    d10: u64,
    d11: u64,
    d12: u64,
    d13: u64,
    d14: u64,
    d15: u64,
}

const_assert_eq!(offset_of!(Context, x19), 0x18);
const_assert_eq!(offset_of!(Context, d8), 0x68);
const_assert_eq!(size_of::<Context>(), 0xA8);

impl Context {
    /// Create an empty context
    ///
    /// An empty context is only a save target; it cannot be resumed until a
    /// [`context_switch`] has written into it.
    pub const fn empty() -> Self {
        Self {
            sp: 0,
            lr: 0,
            fp: 0,
            x19: 0,
            x20: 0,
            x21: 0,
            x22: 0,
            x23: 0,
            x24: 0,
            x25: 0,
            x26: 0,
            x27: 0,
            x28: 0,
            d8: 0,
            d9: 0,
            d10: 0,
            d11: 0,
            d12: 0,
            d13: 0,
            d14: 0,
            d15: 0,
        }
    }

    /// Create a context that starts executing `entry` on a fresh stack.
    ///
    /// # Safety
    /// `stack_top` must be the one-past-the-end address of a writable stack
    /// region that stays alive while the context can be resumed.
    pub unsafe fn new(stack_top: usize, entry: extern "C" fn() -> !) -> Self {
        // `ret` jumps to lr, so nothing needs to be pushed on the stack.
        // fp = 0 terminates frame-pointer walks.
        Self {
            sp: (stack_top & !0xF) as u64,
            lr: entry as usize as u64,
            ..Self::empty()
        }
    }

    /// Whether this context holds a resumable state
    pub fn is_initialized(&self) -> bool {
        self.sp != 0
    }

    /// Saved stack pointer
    pub fn stack_pointer(&self) -> usize {
        self.sp as usize
    }
}

/// Switch from one context to another
///
/// Saves the current CPU state into `save` and restores state from
/// `resume`. This function returns when another context switches back to
/// `save`.
///
/// # Safety
/// Both pointers must be valid. `resume` must have been initialized either
/// by a previous `context_switch` or by [`Context::new`], and the stack it
/// refers to must still be mapped.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_save: *mut Context, _resume: *const Context) {
    // Arguments: x0 = save, x1 = resume
    naked_asm!(
        "mov x9, sp",
        "str x9,  [x0, #0x00]",
        "str lr,  [x0, #0x08]",
        "str fp,  [x0, #0x10]",
        "stp x19, x20, [x0, #0x18]",
        "stp x21, x22, [x0, #0x28]",
        "stp x23, x24, [x0, #0x38]",
        "stp x25, x26, [x0, #0x48]",
        "stp x27, x28, [x0, #0x58]",
        "stp d8,  d9,  [x0, #0x68]",
        "stp d10, d11, [x0, #0x78]",
        "stp d12, d13, [x0, #0x88]",
        "stp d14, d15, [x0, #0x98]",
        "ldr x9,  [x1, #0x00]",
        "mov sp, x9",
        "ldr lr,  [x1, #0x08]",
        "ldr fp,  [x1, #0x10]",
        "ldp x19, x20, [x1, #0x18]",
        "ldp x21, x22, [x1, #0x28]",
        "ldp x23, x24, [x1, #0x38]",
        "ldp x25, x26, [x1, #0x48]",
        "ldp x27, x28, [x1, #0x58]",
        "ldp d8,  d9,  [x1, #0x68]",
        "ldp d10, d11, [x1, #0x78]",
        "ldp d12, d13, [x1, #0x88]",
        "ldp d14, d15, [x1, #0x98]",
        "ret",
    );
}
