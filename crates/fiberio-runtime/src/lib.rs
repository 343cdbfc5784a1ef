//! # fiberio-runtime
//!
//! Linux runtime for fiberio.
//!
//! This crate provides:
//! - Stackful fibers with architecture-specific context switching
//! - Pooled mmap'd stacks with guard pages
//! - An N:M scheduler with an optional participating caller thread
//! - Deadline-ordered timers
//! - An epoll reactor (`IoManager`) that resumes fibers on fd readiness
//! - Hot-reloadable configuration variables

pub mod arch;
pub mod config;
pub mod fiber;
pub mod parking;
pub mod reactor;
pub mod scheduler;
pub mod stack;
pub mod timer;
pub mod tls;
pub mod worker;

// Re-exports
pub use config::{ConfigError, ConfigVar, SchedulerConfig};
pub use fiber::{Fiber, FiberFn};
pub use parking::{new_parking, WorkerParking};
pub use reactor::{Event, IoManager, IoReactor};
pub use scheduler::{Scheduler, Task};
pub use stack::{Stack, StackPool};
pub use timer::{Clock, ManualClock, SystemClock, Timer, TimerCallback, TimerManager};
pub use worker::WorkerPool;

// Platform detection
cfg_if::cfg_if! {
    if #[cfg(not(target_os = "linux"))] {
        compile_error!("fiberio-runtime requires Linux (epoll, futex)");
    }
}

