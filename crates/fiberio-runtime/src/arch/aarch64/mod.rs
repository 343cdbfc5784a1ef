//! aarch64 context switching implementation
//!
//! Saves the AAPCS64 callee-saved set: x19-x29, the link register, sp and
//! the low halves of v8-v15.

use super::EntryFn;
use std::arch::naked_asm;

/// Saved registers of a suspended fiber
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Context {
    pub sp: u64,       // 0
    pub lr: u64,       // 8
    pub x19_x28: [u64; 10], // 16..96
    pub fp: u64,       // 96
    pub d8_d15: [u64; 8],   // 104..168
}

/// Prepare `ctx` so that switching to it runs `entry(arg)` on the stack
/// ending at `stack_top`.
///
/// # Safety
///
/// `stack_top` must be the high end of a writable stack region that stays
/// mapped for as long as the context may run.
#[inline]
pub unsafe fn init_context(ctx: &mut Context, stack_top: *mut u8, entry: EntryFn, arg: usize) {
    let sp = ((stack_top as usize) - 16) & !0xF;
    (sp as *mut u64).write(0);
    ((sp + 8) as *mut u64).write(0);

    let mut regs = [0u64; 10];
    regs[0] = entry as usize as u64; // x19
    regs[1] = arg as u64; // x20

    *ctx = Context {
        sp: sp as u64,
        lr: fiber_entry_trampoline as usize as u64,
        x19_x28: regs,
        ..Context::default()
    };
}

/// First code run on a fresh stack: `x19(x20)`, which never returns
#[unsafe(naked)]
unsafe extern "C" fn fiber_entry_trampoline() {
    naked_asm!(
        "mov x0, x20",
        "blr x19",
        "brk #0x1",
    );
}

/// Save the running context into `old` and resume `new`
///
/// # Safety
///
/// `new` must hold a context produced by `init_context` or by an earlier
/// `switch_context`, whose stack is still alive and not running elsewhere.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_old: *mut Context, _new: *const Context) {
    naked_asm!(
        // Save to old (x0)
        "mov x9, sp",
        "str x9, [x0, #0]",
        "str x30, [x0, #8]",
        "stp x19, x20, [x0, #16]",
        "stp x21, x22, [x0, #32]",
        "stp x23, x24, [x0, #48]",
        "stp x25, x26, [x0, #64]",
        "stp x27, x28, [x0, #80]",
        "str x29, [x0, #96]",
        "stp d8, d9, [x0, #104]",
        "stp d10, d11, [x0, #120]",
        "stp d12, d13, [x0, #136]",
        "stp d14, d15, [x0, #152]",
        // Load from new (x1)
        "ldr x9, [x1, #0]",
        "mov sp, x9",
        "ldr x30, [x1, #8]",
        "ldp x19, x20, [x1, #16]",
        "ldp x21, x22, [x1, #32]",
        "ldp x23, x24, [x1, #48]",
        "ldp x25, x26, [x1, #64]",
        "ldp x27, x28, [x1, #80]",
        "ldr x29, [x1, #96]",
        "ldp d8, d9, [x1, #104]",
        "ldp d10, d11, [x1, #120]",
        "ldp d12, d13, [x1, #136]",
        "ldp d14, d15, [x1, #152]",
        "ret",
    );
}
