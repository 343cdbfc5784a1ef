//! Idle worker parking
//!
//! Idle workers of a cooperative scheduler sleep here between queue checks;
//! `schedule` wakes them. A wake issued while nobody is parked stays pending
//! and makes the next `park` return at once, so a wake racing with a worker
//! that is about to park is not lost.

use std::time::Duration;

/// Sleep/wake primitive for idle workers
pub trait WorkerParking: Send + Sync {
    /// Park the calling thread until woken or `timeout` elapses
    ///
    /// Returns `true` if a wake was consumed. Callers re-check for work
    /// either way.
    fn park(&self, timeout: Option<Duration>) -> bool;

    /// Wake one parked thread, or leave a pending wake
    fn wake_one(&self);

    /// Wake every parked thread, or leave a pending wake
    fn wake_all(&self);

    /// Number of currently parked threads (hint, may be stale)
    fn parked_count(&self) -> usize;
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod futex_linux;
        pub use futex_linux::FutexParking as PlatformParking;
    } else {
        compile_error!("fiberio requires Linux");
    }
}

/// Create a new platform-appropriate parking instance
pub fn new_parking() -> Box<dyn WorkerParking> {
    Box::new(PlatformParking::new())
}
