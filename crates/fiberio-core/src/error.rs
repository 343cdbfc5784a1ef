//! Error types for the fiber runtime

use core::fmt;

/// Result type for runtime operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors that can occur in runtime operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// Operation was cancelled
    Cancelled,

    /// Operation timed out
    Timeout,

    /// Invalid fiber or scheduler state for operation
    InvalidState,

    /// No scheduler bound to the calling thread
    NotInitialized,

    /// Scheduler already started
    AlreadyInitialized,

    /// Configuration rejected
    InvalidConfig(String),

    /// Fiber stack allocation failed
    StackError(StackError),

    /// Worker thread error
    WorkerError(WorkerError),

    /// OS call failed with the given errno
    Os(i32),
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::Cancelled => write!(f, "operation cancelled"),
            SchedError::Timeout => write!(f, "operation timed out"),
            SchedError::InvalidState => write!(f, "invalid fiber state"),
            SchedError::NotInitialized => write!(f, "no scheduler on this thread"),
            SchedError::AlreadyInitialized => write!(f, "scheduler already started"),
            SchedError::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
            SchedError::StackError(e) => write!(f, "stack error: {}", e),
            SchedError::WorkerError(e) => write!(f, "worker error: {}", e),
            SchedError::Os(code) => write!(f, "os error: {}", code),
        }
    }
}

impl std::error::Error for SchedError {}

/// Fiber stack errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackError {
    /// mmap failed
    AllocationFailed,

    /// mprotect of the guard page failed
    ProtectionFailed,

    /// madvise failed
    AdviseFailed,

    /// Requested size is zero or overflows
    InvalidSize,
}

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackError::AllocationFailed => write!(f, "stack allocation failed"),
            StackError::ProtectionFailed => write!(f, "guard page protection failed"),
            StackError::AdviseFailed => write!(f, "stack advise failed"),
            StackError::InvalidSize => write!(f, "invalid stack size"),
        }
    }
}

impl From<StackError> for SchedError {
    fn from(e: StackError) -> Self {
        SchedError::StackError(e)
    }
}

/// Worker thread related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// Failed to spawn worker thread
    SpawnFailed,

    /// Worker thread panicked
    Panicked,

    /// Worker exited before reporting its thread id
    StartupFailed,
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::SpawnFailed => write!(f, "failed to spawn worker thread"),
            WorkerError::Panicked => write!(f, "worker thread panicked"),
            WorkerError::StartupFailed => write!(f, "worker thread failed to start"),
        }
    }
}

impl From<WorkerError> for SchedError {
    fn from(e: WorkerError) -> Self {
        SchedError::WorkerError(e)
    }
}
