//! Stackful fibers
//!
//! A [`Fiber`] is a closure running on its own mmap'd stack with a saved
//! register context. It is switched in by a scheduling context and runs
//! until it yields or its closure returns; there is no preemption.
//!
//! Two switch pairs exist:
//!
//! - `swap_in` / `swap_out` exchange control with the thread's scheduling
//!   fiber (where the scheduler loop runs).
//! - `call` / `back` exchange control with the thread-main fiber; used for
//!   the root fiber that runs the scheduler loop on a participating caller
//!   thread.
//!
//! A fiber may resume on a different OS thread than the one it last ran on,
//! but never migrates while executing.

use crate::arch::{self, Context};
use crate::config;
use crate::stack::{Stack, StackPool};
use crate::tls;
use fiberio_core::{kassert, kdebug, kerror, kfatal, kprint, kwarn};
use fiberio_core::{FiberId, FiberState, SchedResult};
use std::backtrace::Backtrace;
use std::cell::{RefCell, UnsafeCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Once, Weak};

/// Closure type run by a fiber
pub type FiberFn = Box<dyn FnOnce() + Send + 'static>;

static LIVE_FIBERS: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// Backtrace captured by the panic hook for the fiber panicking on this thread
    static PANIC_TRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

/// Where a fiber's context goes when it yields or finishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReturnTo {
    /// The thread's scheduling fiber (`swap_out`)
    Scheduler,
    /// The thread-main fiber (`back`)
    Thread,
}

/// A stackful coroutine
pub struct Fiber {
    id: FiberId,
    state: AtomicU8,
    ctx: UnsafeCell<Context>,
    /// `None` for thread-main fibers, which run on the OS thread's stack
    stack: Option<Stack>,
    entry: UnsafeCell<Option<FiberFn>>,
    return_to: ReturnTo,
    me: Weak<Fiber>,
}

// Safety: `ctx` and `entry` are only touched by the thread that is about to
// switch into the fiber or that is running it; the state machine (EXEC is
// never switched into) serializes those threads.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber running `f` on a stack of `stack_size` bytes
    ///
    /// A size of 0 uses the `fiber.stack_size` config var. Stack allocation
    /// failure is fatal; use [`Fiber::try_new`] to handle it.
    pub fn new<F>(f: F, stack_size: usize) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        match Self::try_new(f, stack_size) {
            Ok(fiber) => fiber,
            Err(e) => kfatal!("fiber stack allocation failed: {}", e),
        }
    }

    /// Create a fiber, reporting stack allocation failure
    pub fn try_new<F>(f: F, stack_size: usize) -> SchedResult<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::build(Box::new(f), stack_size, ReturnTo::Scheduler)
    }

    pub(crate) fn from_boxed(f: FiberFn) -> Arc<Fiber> {
        match Self::build(f, 0, ReturnTo::Scheduler) {
            Ok(fiber) => fiber,
            Err(e) => kfatal!("fiber stack allocation failed: {}", e),
        }
    }

    /// Create the root fiber of a participating caller thread
    pub(crate) fn new_root(f: FiberFn) -> Arc<Fiber> {
        match Self::build(f, 0, ReturnTo::Thread) {
            Ok(fiber) => fiber,
            Err(e) => kfatal!("root fiber stack allocation failed: {}", e),
        }
    }

    fn build(f: FiberFn, stack_size: usize, return_to: ReturnTo) -> SchedResult<Arc<Fiber>> {
        install_panic_hook();
        let size = match stack_size {
            0 => config::fiber_stack_size().get() as usize,
            n => n,
        };
        let stack = StackPool::global().acquire(size)?;

        let fiber = Arc::new_cyclic(|me| Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Init as u8),
            ctx: UnsafeCell::new(Context::default()),
            stack: Some(stack),
            entry: UnsafeCell::new(Some(f)),
            return_to,
            me: me.clone(),
        });
        fiber.init_context();
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        kdebug!("fiber {} created", fiber.id);
        Ok(fiber)
    }

    fn new_thread_main() -> Arc<Fiber> {
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        Arc::new_cyclic(|me| Fiber {
            id: FiberId::MAIN,
            state: AtomicU8::new(FiberState::Exec as u8),
            ctx: UnsafeCell::new(Context::default()),
            stack: None,
            entry: UnsafeCell::new(None),
            return_to: ReturnTo::Thread,
            me: me.clone(),
        })
    }

    fn init_context(&self) {
        let Some(stack) = self.stack.as_ref() else {
            kfatal!("thread-main fiber has no context to initialize");
        };
        // Safety: the fiber is not running (INIT/TERM/EXCEPT), nobody else
        // reads ctx, and the stack lives as long as the fiber.
        unsafe {
            arch::init_context(
                &mut *self.ctx.get(),
                stack.top(),
                fiber_main,
                self as *const Fiber as usize,
            );
        }
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Number of fibers alive in the process, thread-main fibers included
    pub fn total() -> u64 {
        LIVE_FIBERS.load(Ordering::Relaxed)
    }

    /// The fiber running on this thread
    ///
    /// Creates the thread-main fiber on first use.
    pub fn current() -> Arc<Fiber> {
        let cur = tls::current_fiber();
        if !cur.is_null() {
            // Safety: the current fiber is kept alive by whoever switched into it
            return match unsafe { &*cur }.me.upgrade() {
                Some(f) => f,
                None => kfatal!("current fiber is being destroyed"),
            };
        }
        let main = Fiber::new_thread_main();
        tls::set_thread_fiber(Arc::clone(&main));
        tls::set_current_fiber(Arc::as_ptr(&main));
        main
    }

    /// Id of the fiber running on this thread, `FiberId::MAIN` if none
    pub fn current_id() -> FiberId {
        let cur = tls::current_fiber();
        if cur.is_null() {
            FiberId::MAIN
        } else {
            unsafe { (*cur).id }
        }
    }

    fn thread_main_ptr() -> *const Fiber {
        let main = tls::thread_fiber();
        if !main.is_null() {
            return main;
        }
        Fiber::current();
        tls::thread_fiber()
    }

    /// Context that `swap_in`/`swap_out` exchange with on this thread
    fn sched_ptr() -> *const Fiber {
        let sched = tls::sched_fiber();
        if sched.is_null() {
            Self::thread_main_ptr()
        } else {
            sched
        }
    }

    fn check_switchable(&self) {
        kassert!(self.stack.is_some(), "cannot switch into a thread-main fiber");
        let state = self.state();
        kassert!(state != FiberState::Exec, "fiber {} is already executing", self.id);
        kassert!(!state.is_terminal(), "fiber {} resumed after it finished ({})", self.id, state);
    }

    /// Switch from the scheduling fiber into this fiber
    ///
    /// Returns once the fiber yields or finishes. A fiber that switched out
    /// while still EXEC (`yield_to_hold`) is marked HOLD here, after its
    /// context has been saved.
    pub fn swap_in(&self) {
        self.check_switchable();
        let sched = Self::sched_ptr();
        kassert!(!std::ptr::eq(sched, self), "fiber {} swapped into itself", self.id);

        tls::set_current_fiber(self);
        kprint::set_fiber_id(self.id.as_u64());
        self.set_state(FiberState::Exec);
        // Safety: sched is this thread's scheduling fiber, alive for the
        // whole loop; self was checked to be suspended.
        unsafe { arch::switch_context((*sched).ctx.get(), self.ctx.get()) };
        self.park_if_running();
    }

    /// Switch from this fiber back to the scheduling fiber
    pub fn swap_out(&self) {
        let sched = Self::sched_ptr();
        tls::set_current_fiber(sched);
        kprint::set_fiber_id(unsafe { (*sched).id.as_u64() });
        unsafe { arch::switch_context(self.ctx.get(), (*sched).ctx.get()) };
    }

    /// Switch from the thread-main fiber into this fiber
    pub fn call(&self) {
        self.check_switchable();
        let main = Self::thread_main_ptr();

        tls::set_current_fiber(self);
        kprint::set_fiber_id(self.id.as_u64());
        self.set_state(FiberState::Exec);
        unsafe { arch::switch_context((*main).ctx.get(), self.ctx.get()) };
        self.park_if_running();
    }

    /// Switch from this fiber back to the thread-main fiber
    pub fn back(&self) {
        let main = Self::thread_main_ptr();
        tls::set_current_fiber(main);
        kprint::set_fiber_id(FiberId::MAIN.as_u64());
        unsafe { arch::switch_context(self.ctx.get(), (*main).ctx.get()) };
    }

    fn park_if_running(&self) {
        let _ = self.state.compare_exchange(
            FiberState::Exec as u8,
            FiberState::Hold as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Reuse a finished fiber's stack for a new closure
    pub fn reset<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_boxed(Box::new(f));
    }

    pub(crate) fn reset_boxed(&self, f: FiberFn) {
        kassert!(self.stack.is_some(), "cannot reset a thread-main fiber");
        let state = self.state();
        kassert!(state.is_resettable(), "fiber {} reset while {}", self.id, state);
        // Safety: INIT/TERM/EXCEPT fibers are not running anywhere
        unsafe { *self.entry.get() = Some(f) };
        self.init_context();
        self.set_state(FiberState::Init);
    }

    /// Mark the current fiber READY and switch out
    pub fn yield_to_ready() {
        let cur = Self::current_running();
        cur.set_state(FiberState::Ready);
        cur.swap_out();
    }

    /// Switch the current fiber out until something re-schedules it
    pub fn yield_to_hold() {
        let cur = Self::current_running();
        cur.swap_out();
    }

    fn current_running<'a>() -> &'a Fiber {
        let cur = tls::current_fiber();
        kassert!(!cur.is_null(), "yield outside of a fiber");
        // Safety: a running fiber outlives its own yield call
        let cur = unsafe { &*cur };
        kassert!(cur.stack.is_some(), "yield from a thread-main fiber");
        kassert!(cur.state() == FiberState::Exec, "yield from fiber {} in state {}", cur.id, cur.state());
        cur
    }

    fn run_entry(&self) {
        // Safety: only the fiber itself touches `entry` while EXEC
        let entry = unsafe { (*self.entry.get()).take() };
        let Some(entry) = entry else {
            self.set_state(FiberState::Term);
            return;
        };
        match panic::catch_unwind(AssertUnwindSafe(entry)) {
            Ok(()) => self.set_state(FiberState::Term),
            Err(payload) => {
                let trace = PANIC_TRACE.with(|t| t.borrow_mut().take());
                kerror!(
                    "fiber {} panicked: {}\n{}",
                    self.id,
                    panic_message(payload.as_ref()),
                    trace.map_or_else(|| "backtrace unavailable".to_string(), |b| b.to_string())
                );
                drop(payload);
                self.set_state(FiberState::Except);
            }
        }
    }
}

/// Entry point of every fiber stack
extern "C" fn fiber_main(arg: usize) -> ! {
    // Safety: arg is the fiber pointer given to init_context; the fiber is
    // kept alive by whoever switched into it.
    let fiber = unsafe { &*(arg as *const Fiber) };
    fiber.run_entry();

    let id = fiber.id;
    match fiber.return_to {
        ReturnTo::Scheduler => fiber.swap_out(),
        ReturnTo::Thread => fiber.back(),
    }
    kfatal!("fiber {} resumed after termination", id)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Chain a panic hook that records a backtrace for panics inside fibers
fn install_panic_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if tls::in_fiber() {
                PANIC_TRACE.with(|t| *t.borrow_mut() = Some(Backtrace::force_capture()));
            }
            previous(info);
        }));
    });
}

impl Drop for Fiber {
    fn drop(&mut self) {
        LIVE_FIBERS.fetch_sub(1, Ordering::Relaxed);
        let Some(stack) = self.stack.take() else {
            return;
        };
        let state = self.state();
        if state.is_resettable() {
            StackPool::global().release(stack);
        } else {
            kwarn!("fiber {} dropped while {}, its closure never finished", self.id, state);
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[test]
    fn test_thread_main_fiber() {
        let main = Fiber::current();
        assert_eq!(main.id(), FiberId::MAIN);
        assert_eq!(main.state(), FiberState::Exec);
        assert!(Arc::ptr_eq(&main, &Fiber::current()));
        assert_eq!(Fiber::current_id(), FiberId::MAIN);
        assert!(!tls::in_fiber());
    }

    #[test]
    fn test_fiber_yield_and_resume() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let t = Arc::clone(&trace);
        let fiber = Fiber::new(
            move || {
                t.lock().unwrap().push(1);
                Fiber::yield_to_ready();
                t.lock().unwrap().push(2);
                Fiber::yield_to_hold();
                t.lock().unwrap().push(3);
            },
            0,
        );
        assert_eq!(fiber.state(), FiberState::Init);

        fiber.swap_in();
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.swap_in();
        assert_eq!(fiber.state(), FiberState::Hold);
        fiber.swap_in();
        assert_eq!(fiber.state(), FiberState::Term);

        assert_eq!(*trace.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(Fiber::current_id(), FiberId::MAIN);
    }

    #[test]
    fn test_current_inside_fiber() {
        let seen = Arc::new(AtomicU64::new(0));
        let s = Arc::clone(&seen);
        let fiber = Fiber::new(
            move || {
                assert!(tls::in_fiber());
                s.store(Fiber::current_id().as_u64(), Ordering::SeqCst);
                assert_eq!(Fiber::current().state(), FiberState::Exec);
            },
            64 * 1024,
        );
        fiber.swap_in();
        assert_eq!(seen.load(Ordering::SeqCst), fiber.id().as_u64());
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_fiber_panic_is_contained() {
        let fiber = Fiber::new(|| panic!("boom"), 0);
        fiber.swap_in();
        assert_eq!(fiber.state(), FiberState::Except);

        // The thread keeps working and can run more fibers
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        let next = Fiber::new(move || { r.fetch_add(1, Ordering::SeqCst); }, 0);
        next.swap_in();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fiber_reset_reuses_stack() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let fiber = Fiber::new(move || { c.fetch_add(1, Ordering::SeqCst); }, 0);
        let id = fiber.id();
        fiber.swap_in();
        assert_eq!(fiber.state(), FiberState::Term);

        let c = Arc::clone(&count);
        fiber.reset(move || { c.fetch_add(10, Ordering::SeqCst); });
        assert_eq!(fiber.state(), FiberState::Init);
        assert_eq!(fiber.id(), id);
        fiber.swap_in();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(count.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_call_and_back() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let root = Fiber::new_root(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
            Fiber::current().back();
            h.fetch_add(1, Ordering::SeqCst);
        }));
        root.call();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(root.state(), FiberState::Hold);
        root.call();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(root.state(), FiberState::Term);
    }

    #[test]
    fn test_deep_stack_use() {
        fn recurse(n: u32) -> u32 {
            let pad = [n as u8; 256];
            if n == 0 { pad[0] as u32 } else { recurse(n - 1) + pad[1] as u32 / 255 }
        }
        let fiber = Fiber::new(|| { std::hint::black_box(recurse(1000)); }, 1024 * 1024);
        fiber.swap_in();
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_fibers_migrate_between_threads() {
        let fiber = Fiber::new(|| {
            let first = tls::thread_id();
            Fiber::yield_to_ready();
            assert_ne!(first, tls::thread_id());
        }, 0);
        fiber.swap_in();
        assert_eq!(fiber.state(), FiberState::Ready);

        let f = Arc::clone(&fiber);
        std::thread::spawn(move || f.swap_in()).join().unwrap();
        assert_eq!(fiber.state(), FiberState::Term);
    }
}
