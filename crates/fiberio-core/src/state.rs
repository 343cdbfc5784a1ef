//! Fiber state

use core::fmt;

/// State of a fiber
///
/// ```text
/// Init ──swap_in──▶ Exec ──┬──▶ Ready  (yield_to_ready, re-run at once)
///                          ├──▶ Hold   (parked until an event re-submits it)
///                          ├──▶ Term   (closure returned)
///                          └──▶ Except (closure panicked)
/// ```
///
/// `Term` and `Except` are final until the fiber is `reset` with a new
/// closure, which brings it back to `Init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Created or reset, never run
    Init = 0,

    /// Paused, waiting for an external event to re-submit it
    Hold = 1,

    /// Currently executing on some thread
    Exec = 2,

    /// Closure ran to completion
    Term = 3,

    /// Paused, runnable immediately
    Ready = 4,

    /// Closure panicked
    Except = 5,
}

impl FiberState {
    /// Check if the fiber's closure has finished (normally or not)
    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, FiberState::Term | FiberState::Except)
    }

    /// Check if the fiber may be reset with a new closure
    #[inline]
    pub const fn is_resettable(&self) -> bool {
        matches!(self, FiberState::Init | FiberState::Term | FiberState::Except)
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Init,
            1 => FiberState::Hold,
            2 => FiberState::Exec,
            3 => FiberState::Term,
            4 => FiberState::Ready,
            _ => FiberState::Except,
        }
    }
}

impl From<FiberState> for u8 {
    fn from(state: FiberState) -> u8 {
        state as u8
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FiberState::Init => "INIT",
            FiberState::Hold => "HOLD",
            FiberState::Exec => "EXEC",
            FiberState::Term => "TERM",
            FiberState::Ready => "READY",
            FiberState::Except => "EXCEPT",
        };
        f.write_str(name)
    }
}
