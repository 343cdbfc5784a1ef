//! # fiberio - fibers, schedulers and an epoll reactor
//!
//! Userspace cooperative threads for Rust. Fibers run on a pool of worker
//! threads; blocking-style socket calls made from a fiber park only that
//! fiber while the reactor waits for readiness.
//!
//! ## Features
//!
//! - **Fibers**: own stack, hand-written context switch, resumable and reusable
//! - **Scheduler**: N:M, FIFO run queue, optional thread affinity, caller participation
//! - **Timers**: one-shot, recurring and condition timers on the reactor
//! - **IoManager**: epoll readiness for fibers and callbacks
//! - **Hooks**: `read`, `recv`, `connect`, `sleep`... that suspend instead of block
//!
//! ## Quick Start
//!
//! ```ignore
//! use fiberio::{Runtime, SchedulerConfig, spawn, sleep_ms, yield_now};
//!
//! fn main() {
//!     let rt = Runtime::new(SchedulerConfig::new().threads(4)).unwrap();
//!
//!     let answer = rt.block_on(|| {
//!         for i in 0..3 {
//!             spawn(move || {
//!                 sleep_ms(10 * i);
//!                 println!("fiber {} woke", i);
//!             })
//!             .unwrap();
//!         }
//!         yield_now();
//!         42
//!     });
//!     assert_eq!(answer, Ok(42));
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │        spawn(), yield_now(), sleep(), FiberStream           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │               IoManager = Scheduler + IoReactor             │
//! │     FIFO queue, affinity, epoll, TimerManager, tickle pipe  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Worker   │      │  Worker   │      │  Caller   │
//!    │  Thread   │      │  Thread   │      │ (optional)│
//!    └───────────┘      └───────────┘      └───────────┘
//!          │                   │                   │
//!          └───────────────────┼───────────────────┘
//!                              ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │                      Fibers                             │
//!    │          mmap stacks with guard page, pooled            │
//!    └─────────────────────────────────────────────────────────┘
//! ```

// Re-export core types
pub use fiberio_core::{CancelToken, FiberId, FiberState, SchedError, SchedResult, SpinLock};

// Re-export kprint macros for debug logging
pub use fiberio_core::{kdebug, kerror, kinfo, kprint, kprintln, ktrace, kwarn};
pub use fiberio_core::kprint::{init as init_logging, set_flush_enabled, set_log_level, set_time_enabled, LogLevel};

// Re-export env utilities
pub use fiberio_core::{env_get, env_get_bool, env_get_opt, env_get_str};

// Re-export runtime types
pub use fiberio_runtime::config;
pub use fiberio_runtime::{
    ConfigError, ConfigVar, Event, Fiber, IoManager, Scheduler, SchedulerConfig, Task, Timer, TimerManager,
};

// Re-export hooked I/O
pub use fiberio_hook::syscall;
pub use fiberio_hook::{
    is_hook_enable, set_hook_default, set_hook_enable, ClientHandler, FdCtx, FdManager, FiberListener, FiberStream,
    SocketStream, Stream, TcpServer,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;

/// Runtime handle owning an [`IoManager`]
///
/// The workers start on construction and stop when the runtime is shut
/// down or dropped, after the queued work has drained.
pub struct Runtime {
    iom: IoManager,
    stopped: AtomicBool,
}

impl Runtime {
    /// Create and start a runtime with the given configuration
    pub fn new(config: SchedulerConfig) -> SchedResult<Runtime> {
        Ok(Runtime {
            iom: IoManager::new(config)?,
            stopped: AtomicBool::new(false),
        })
    }

    /// Create a runtime configured from `FIO_*` environment variables
    pub fn from_env() -> SchedResult<Runtime> {
        Self::new(SchedulerConfig::from_env())
    }

    #[inline]
    pub fn io_manager(&self) -> &IoManager {
        &self.iom
    }

    /// Run `f` in a fiber and wait for its result
    ///
    /// Returns `Err(Cancelled)` if the fiber panicked. On a `use_caller`
    /// runtime the calling thread has to drive the loop itself, so the
    /// runtime is shut down before the result is returned.
    pub fn block_on<F, T>(&self, f: F) -> SchedResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        self.iom.schedule(move || {
            let _ = tx.send(f());
        });
        if self.iom.config().use_caller {
            self.shutdown();
        }
        rx.recv().map_err(|_| SchedError::Cancelled)
    }

    /// Queue `f` to run in a fiber on this runtime
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.iom.schedule(f);
    }

    /// Queue `f` to run on the worker with kernel thread id `thread`
    pub fn spawn_on<F>(&self, f: F, thread: i32)
    where
        F: FnOnce() + Send + 'static,
    {
        self.iom.schedule_on(f, thread);
    }

    /// Drain the queue and stop the workers
    pub fn shutdown(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.iom.stop();
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("iom", &self.iom)
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

/// Queue `f` on the scheduler of the calling thread
///
/// Fails with `NotInitialized` when called outside any scheduler.
pub fn spawn<F>(f: F) -> SchedResult<()>
where
    F: FnOnce() + Send + 'static,
{
    let sched = Scheduler::current().ok_or(SchedError::NotInitialized)?;
    sched.schedule(f);
    Ok(())
}

/// Alias of [`spawn`]
#[inline]
pub fn go<F>(f: F) -> SchedResult<()>
where
    F: FnOnce() + Send + 'static,
{
    spawn(f)
}

/// Yield execution to the scheduler
///
/// The current fiber goes to the back of the run queue. Outside a fiber
/// this yields the OS thread.
#[inline]
pub fn yield_now() {
    if in_fiber() {
        Fiber::yield_to_ready();
    } else {
        std::thread::yield_now();
    }
}

/// Suspend the caller for `duration`
///
/// A fiber on an IoManager is parked on a timer; anything else sleeps the
/// OS thread.
pub fn sleep(duration: Duration) {
    match IoManager::current().filter(|_| in_fiber()) {
        Some(iom) => syscall::park_for(&iom, duration.as_millis() as u64),
        None => std::thread::sleep(duration),
    }
}

#[inline]
pub fn sleep_ms(ms: u64) {
    sleep(Duration::from_millis(ms))
}

#[inline]
pub fn sleep_us(us: u64) {
    sleep(Duration::from_micros(us))
}

/// ID of the running fiber
#[inline]
pub fn current_id() -> FiberId {
    Fiber::current_id()
}

/// Check if currently executing within a fiber
#[inline]
pub fn in_fiber() -> bool {
    fiberio_runtime::tls::in_fiber()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    #[test]
    fn test_block_on_returns_value() {
        let rt = Runtime::new(SchedulerConfig::new().name("rt-block").threads(2)).unwrap();
        let value = rt.block_on(|| {
            assert!(in_fiber());
            assert!(Scheduler::current().is_some());
            6 * 7
        });
        assert_eq!(value, Ok(42));
    }

    #[test]
    fn test_block_on_reports_panic() {
        let rt = Runtime::new(SchedulerConfig::new().name("rt-panic").threads(1)).unwrap();
        let value: SchedResult<()> = rt.block_on(|| panic!("fiber failure"));
        assert_eq!(value, Err(SchedError::Cancelled));
    }

    #[test]
    fn test_spawn_from_fiber_and_sleep() {
        let rt = Runtime::new(SchedulerConfig::new().name("rt-spawn").threads(2)).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&done);
        let start = Instant::now();

        rt.block_on(move || {
            for i in 0..8u64 {
                let d = Arc::clone(&d);
                go(move || {
                    sleep_ms(20 + i);
                    d.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }
        })
        .unwrap();
        rt.shutdown();

        assert_eq!(done.load(Ordering::SeqCst), 8);
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_spawn_outside_scheduler_fails() {
        assert_eq!(spawn(|| {}), Err(SchedError::NotInitialized));
        assert!(!in_fiber());
        yield_now();
        sleep_us(100);
    }

    #[test]
    fn test_yield_now_interleaves() {
        let rt = Runtime::new(SchedulerConfig::new().name("rt-yield").threads(1)).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&log);
        // Queued from one fiber so both are waiting before either runs
        rt.block_on(move || {
            for name in ["a", "b"] {
                let log = Arc::clone(&l);
                spawn(move || {
                    for i in 0..3 {
                        log.lock().unwrap().push(format!("{}{}", name, i));
                        yield_now();
                    }
                })
                .unwrap();
            }
        })
        .unwrap();
        rt.shutdown();
        assert_eq!(*log.lock().unwrap(), ["a0", "b0", "a1", "b1", "a2", "b2"]);
    }

    #[test]
    fn test_use_caller_block_on() {
        let caller = fiberio_runtime::tls::thread_id();
        let rt = Runtime::new(SchedulerConfig::new().name("rt-caller").threads(1).use_caller(true)).unwrap();
        let ran_on = rt.block_on(fiberio_runtime::tls::thread_id);
        assert_eq!(ran_on, Ok(caller));
        assert!(Scheduler::current().is_none());
    }
}
