//! Thread-local runtime context
//!
//! Per OS thread the runtime tracks:
//!
//! - the fiber currently executing,
//! - the thread-main fiber (the OS thread's own stack, created lazily),
//! - the scheduling fiber that `swap_out` returns to (the thread-main fiber
//!   on spawned workers, the root fiber on a participating caller),
//! - the scheduler bound to the thread,
//! - the hook-layer enable flag,
//! - the cached kernel thread id.
//!
//! Fibers migrate between threads across a switch. Accessors are kept out
//! of line so the compiler cannot reuse a TLS address computed on the
//! thread a fiber ran on before it was suspended.

use crate::fiber::Fiber;
use crate::scheduler::Scheduler;
use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Process-wide default for the hook flag of scheduler threads
static HOOK_DEFAULT: AtomicBool = AtomicBool::new(true);

thread_local! {
    static CURRENT_FIBER: Cell<*const Fiber> = const { Cell::new(std::ptr::null()) };
    static THREAD_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static SCHED_FIBER: Cell<*const Fiber> = const { Cell::new(std::ptr::null()) };
    static SCHEDULER: RefCell<Option<Weak<Scheduler>>> = const { RefCell::new(None) };
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
    static THREAD_ID: Cell<i32> = const { Cell::new(0) };
}

// ── fibers ──

#[inline(never)]
pub(crate) fn current_fiber() -> *const Fiber {
    CURRENT_FIBER.with(|c| c.get())
}

#[inline(never)]
pub(crate) fn set_current_fiber(fiber: *const Fiber) {
    CURRENT_FIBER.with(|c| c.set(fiber));
}

/// The thread-main fiber, if it was created
#[inline(never)]
pub(crate) fn thread_fiber() -> *const Fiber {
    THREAD_FIBER.with(|c| match c.borrow().as_ref() {
        Some(f) => Arc::as_ptr(f),
        None => std::ptr::null(),
    })
}

#[inline(never)]
pub(crate) fn set_thread_fiber(fiber: Arc<Fiber>) {
    THREAD_FIBER.with(|c| *c.borrow_mut() = Some(fiber));
}

#[inline(never)]
pub(crate) fn sched_fiber() -> *const Fiber {
    SCHED_FIBER.with(|c| c.get())
}

#[inline(never)]
pub(crate) fn set_sched_fiber(fiber: *const Fiber) {
    SCHED_FIBER.with(|c| c.set(fiber));
}

/// Check if the calling code runs inside a fiber with its own stack
#[inline(never)]
pub fn in_fiber() -> bool {
    let cur = current_fiber();
    !cur.is_null() && cur != thread_fiber() && cur != sched_fiber()
}

// ── scheduler ──

#[inline(never)]
pub(crate) fn scheduler() -> Option<Arc<Scheduler>> {
    SCHEDULER.with(|c| c.borrow().as_ref().and_then(Weak::upgrade))
}

#[inline(never)]
pub(crate) fn set_scheduler(sched: Option<Weak<Scheduler>>) {
    SCHEDULER.with(|c| *c.borrow_mut() = sched);
}

// ── hook flag ──

/// Check if hooked calls on this thread may suspend the calling fiber
#[inline(never)]
pub fn is_hook_enable() -> bool {
    HOOK_ENABLED.with(|c| c.get())
}

/// Override the hook flag for this thread
#[inline(never)]
pub fn set_hook_enable(enable: bool) {
    HOOK_ENABLED.with(|c| c.set(enable));
}

/// Process-wide default applied when a reactor worker starts
pub fn set_hook_default(enable: bool) {
    HOOK_DEFAULT.store(enable, Ordering::Relaxed);
}

pub fn hook_default() -> bool {
    HOOK_DEFAULT.load(Ordering::Relaxed)
}

// ── thread id ──

/// Kernel thread id of the calling thread
#[inline(never)]
pub fn thread_id() -> i32 {
    THREAD_ID.with(|c| {
        let mut tid = c.get();
        if tid == 0 {
            tid = unsafe { libc::syscall(libc::SYS_gettid) } as i32;
            c.set(tid);
        }
        tid
    })
}
