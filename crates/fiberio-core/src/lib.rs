//! # fiberio-core
//!
//! Core types for the fiberio runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Fibers, the scheduler and the reactor live in `fiberio-runtime`.
//!
//! ## Modules
//!
//! - `id` - Fiber identifier type
//! - `state` - Fiber state machine
//! - `cancel` - Cancellation token shared between a waiter and its canceller
//! - `error` - Error types
//! - `spinlock` - Internal spinlock primitive
//! - `kprint` - Kernel-style logging macros
//! - `env` - Environment variable utilities

pub mod id;
pub mod state;
pub mod cancel;
pub mod error;
pub mod spinlock;
pub mod kprint;
pub mod env;

pub use id::FiberId;
pub use state::FiberState;
pub use cancel::{CancelToken, WeakCancelToken};
pub use error::{SchedError, SchedResult, StackError, WorkerError};
pub use spinlock::SpinLock;
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str};

/// Constants shared across crates
pub mod constants {
    /// Guard page size below every fiber stack
    pub const GUARD_SIZE: usize = 4096;

    /// Default fiber stack size (1 MiB, reserved lazily)
    pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

    /// Smallest stack a fiber may be created with
    pub const MIN_STACK_SIZE: usize = 16 * 1024;

    /// Upper bound on scheduler worker threads
    pub const MAX_WORKERS: usize = 256;
}
