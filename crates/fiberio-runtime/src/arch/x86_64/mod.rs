//! x86_64 context switching implementation
//!
//! Only the System V callee-saved registers are captured: a switch is an
//! ordinary function call from the compiler's point of view, so everything
//! else is already spilled by the caller.

use super::EntryFn;
use std::arch::naked_asm;

/// Saved registers of a suspended fiber
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Context {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
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
    // The trampoline is entered by `jmp`, so it sees the aligned value and
    // its own `call` leaves the entry function with the usual rsp % 16 == 8.
    // The zeroed slot above sp ends unwinder walks at the trampoline.
    let sp = ((stack_top as usize) - 16) & !0xF;
    (sp as *mut u64).write(0);
    ((sp + 8) as *mut u64).write(0);

    *ctx = Context {
        rsp: sp as u64,
        rip: fiber_entry_trampoline as usize as u64,
        r12: entry as usize as u64,
        r13: arg as u64,
        ..Context::default()
    };
}

/// First code run on a fresh stack: `r12(r13)`, which never returns
#[unsafe(naked)]
unsafe extern "C" fn fiber_entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "ud2",
    );
}

/// Save the running context into `old` and resume `new`
///
/// Returns when some other switch resumes `old`.
///
/// # Safety
///
/// `new` must hold a context produced by `init_context` or by an earlier
/// `switch_context`, whose stack is still alive and not running elsewhere.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_old: *mut Context, _new: *const Context) {
    naked_asm!(
        // Save callee-saved registers to old (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from new (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // Resume point of a saved context
        "2:",
        "ret",
    );
}
