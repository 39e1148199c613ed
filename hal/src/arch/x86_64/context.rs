//! # Context Switch
//!
//! Low-level routine for switching between execution contexts.
//!
//! Only the state the System V ABI requires a callee to preserve is saved:
//! the callee-saved general purpose registers, the stack pointer, MXCSR and
//! the x87 control word. Everything else is either caller-saved (and so
//! already spilled by the compiler around the call) or, when the switch
//! happens inside a signal handler, restored by `sigreturn`.

use core::arch::naked_asm;
use core::mem::{offset_of, size_of};
use core::ptr;
use static_assertions::const_assert_eq;

/// MXCSR at fiber start: all SSE exceptions masked, round to nearest
const INITIAL_MXCSR: u32 = 0x1F80;

/// x87 control word at fiber start: all exceptions masked, extended precision
const INITIAL_FPU_CW: u32 = 0x037F;

/// Saved CPU context for context switching
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Stack pointer
    rsp: u64,
    /// Frame pointer
    rbp: u64,
    /// General purpose (callee-saved)
    rbx: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
    /// SSE control/status
    mxcsr: u32,
    /// x87 control word (low 16 bits)
    fpu_cw: u32,
}

// The assembly below hard-codes these offsets.
const_assert_eq!(offset_of!(Context, rsp), 0x00);
const_assert_eq!(offset_of!(Context, r15), 0x30);
const_assert_eq!(offset_of!(Context, mxcsr), 0x38);
const_assert_eq!(offset_of!(Context, fpu_cw), 0x3C);
const_assert_eq!(size_of::<Context>(), 0x40);

impl Context {
    /// Create an empty context
    ///
    /// An empty context is only a save target; it cannot be resumed until a
    /// [`context_switch`] has written into it.
    pub const fn empty() -> Self {
        Self {
            rsp: 0,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            mxcsr: 0,
            fpu_cw: 0,
        }
    }

    /// Create a context that starts executing `entry` on a fresh stack.
    ///
    /// # Safety
    /// `stack_top` must be the one-past-the-end address of a writable stack
    /// region at least 16 bytes long that stays alive while the context can
    /// be resumed.
    pub unsafe fn new(stack_top: usize, entry: extern "C" fn() -> !) -> Self {
        // System V requires RSP to be 16-byte aligned BEFORE a `call`, so a
        // function body starts with RSP = 16n+8. We enter through `ret`
        // instead of `call`, so we simulate the pushed return address.
        //
        // Stack layout (growing downward):
        //   top - 8:  0 (fake return address, stops unwinders)
        //   top - 16: entry (consumed by `ret`)
        let top = stack_top & !0xF;
        let initial_rsp = top - 16;

        // SAFETY: the caller guarantees both slots lie inside the stack.
        unsafe {
            ptr::write((top - 8) as *mut u64, 0);
            ptr::write(initial_rsp as *mut u64, entry as usize as u64);
        }

        Self {
            rsp: initial_rsp as u64,
            mxcsr: INITIAL_MXCSR,
            fpu_cw: INITIAL_FPU_CW,
            ..Self::empty()
        }
    }

    /// Whether this context holds a resumable state
    pub fn is_initialized(&self) -> bool {
        self.rsp != 0
    }

    /// Saved stack pointer
    pub fn stack_pointer(&self) -> usize {
        self.rsp as usize
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
    naked_asm!(
        // Save callee-saved state to the old context (rdi)
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "stmxcsr dword ptr [rdi + 0x38]",
        "fnstcw word ptr [rdi + 0x3c]",
        // Load callee-saved state from the new context (rsi)
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        "ldmxcsr dword ptr [rsi + 0x38]",
        "fldcw word ptr [rsi + 0x3c]",
        // For a fresh context: pops the entry address and jumps there
        // For a suspended one: returns to where it called context_switch
        "ret",
    );
}
