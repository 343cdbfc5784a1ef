//! Cancellation token for cooperative cancellation
//!
//! A waiter parks on some event and, once resumed, checks its token to see
//! whether it was woken by the event or by a canceller (typically a timeout
//! timer). The canceller records a reason code (an errno value) so the
//! waiter can surface it to its own caller.
//!
//! Cancellers usually hold a `Weak` reference to the token: once the waiter
//! has moved on and dropped the token, a late canceller finds nothing to
//! cancel.

use core::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};

/// Reason value meaning "not cancelled"
const NOT_CANCELLED: i32 = 0;

/// Token for checking and triggering cancellation
///
/// Clones share the same flag.
#[derive(Clone, Debug)]
pub struct CancelToken {
    reason: Arc<AtomicI32>,
}

impl CancelToken {
    /// Create a new token in the not-cancelled state
    pub fn new() -> Self {
        Self {
            reason: Arc::new(AtomicI32::new(NOT_CANCELLED)),
        }
    }

    /// Check if cancellation has been requested
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.reason.load(Ordering::Acquire) != NOT_CANCELLED
    }

    /// The recorded reason, if cancelled
    #[inline]
    pub fn reason(&self) -> Option<i32> {
        match self.reason.load(Ordering::Acquire) {
            NOT_CANCELLED => None,
            code => Some(code),
        }
    }

    /// Request cancellation with a non-zero reason code
    ///
    /// The first reason wins. Returns `true` if this call cancelled the token.
    pub fn cancel(&self, reason: i32) -> bool {
        debug_assert!(reason != NOT_CANCELLED, "cancel reason must be non-zero");
        self.reason
            .compare_exchange(NOT_CANCELLED, reason, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// A weak handle for cancellers that must not keep the token alive
    pub fn downgrade(&self) -> WeakCancelToken {
        WeakCancelToken {
            reason: Arc::downgrade(&self.reason),
        }
    }

    /// The shared flag, usable as a liveness guard
    pub fn guard(&self) -> Weak<AtomicI32> {
        Arc::downgrade(&self.reason)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Weak counterpart of [`CancelToken`]
#[derive(Clone, Debug)]
pub struct WeakCancelToken {
    reason: Weak<AtomicI32>,
}

impl WeakCancelToken {
    /// Upgrade back to a token if the waiter still holds it
    pub fn upgrade(&self) -> Option<CancelToken> {
        self.reason.upgrade().map(|reason| CancelToken { reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_basic() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert_eq!(token.reason(), None);

        assert!(token.cancel(110));
        assert!(token.is_cancelled());
        assert_eq!(token.reason(), Some(110));
    }

    #[test]
    fn test_first_reason_wins() {
        let token = CancelToken::new();
        assert!(token.cancel(110));
        assert!(!token.cancel(9));
        assert_eq!(token.reason(), Some(110));
    }

    #[test]
    fn test_clone_shares_flag() {
        let a = CancelToken::new();
        let b = a.clone();
        a.cancel(4);
        assert!(b.is_cancelled());
    }

    #[test]
    fn test_weak_token() {
        let token = CancelToken::new();
        let weak = token.downgrade();
        weak.upgrade().unwrap().cancel(110);
        assert_eq!(token.reason(), Some(110));

        drop(token);
        assert!(weak.upgrade().is_none());
    }
}
