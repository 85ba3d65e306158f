//! Cancellation token for cooperative cancellation
//!
//! Blocking waits in the client check a token between peer round trips
//! and give up with `CmdBufError::Cancelled` once it fires. Tokens can be
//! linked to form parent-child relationships.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{CmdBufError, CmdBufResult};

/// Token for checking and triggering cancellation
///
/// Clones share state, so a token handed to a helper can be cancelled from
/// another thread (e.g. a watchdog) while the owner is blocked on the peer.
#[derive(Clone)]
pub struct CancellationToken {
    inner: CancellationInner,
}

#[derive(Clone)]
enum CancellationInner {
    Owned(Arc<OwnedCancellation>),
    /// Never cancels
    Dummy,
}

struct OwnedCancellation {
    cancelled: AtomicBool,
    parent: Option<CancellationToken>,
}

impl CancellationToken {
    /// Create a new independent cancellation token
    pub fn new() -> Self {
        Self {
            inner: CancellationInner::Owned(Arc::new(OwnedCancellation {
                cancelled: AtomicBool::new(false),
                parent: None,
            })),
        }
    }

    /// Create a dummy token that never cancels
    pub fn dummy() -> Self {
        Self {
            inner: CancellationInner::Dummy,
        }
    }

    /// Create a child token linked to this one
    ///
    /// If this token is cancelled, checking the child will also return cancelled.
    pub fn child(&self) -> Self {
        Self {
            inner: CancellationInner::Owned(Arc::new(OwnedCancellation {
                cancelled: AtomicBool::new(false),
                parent: Some(self.clone()),
            })),
        }
    }

    /// Check if cancellation was requested, walking the parent chain.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        match &self.inner {
            CancellationInner::Owned(arc) => {
                if arc.cancelled.load(Ordering::Acquire) {
                    return true;
                }
                match arc.parent {
                    Some(ref parent) => parent.is_cancelled(),
                    None => false,
                }
            }
            CancellationInner::Dummy => false,
        }
    }

    /// Request cancellation
    ///
    /// Only sets this token's flag. Children see it when they check.
    pub fn cancel(&self) {
        if let CancellationInner::Owned(arc) = &self.inner {
            arc.cancelled.store(true, Ordering::Release);
        }
    }

    /// Return `Err(Cancelled)` if cancellation was requested.
    ///
    /// ```ignore
    /// loop {
    ///     token.check()?;
    ///     // ... one peer round trip ...
    /// }
    /// ```
    #[inline]
    pub fn check(&self) -> CmdBufResult<()> {
        if self.is_cancelled() {
            Err(CmdBufError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Reset cancellation (for token reuse)
    pub fn reset(&self) {
        if let CancellationInner::Owned(arc) = &self.inner {
            arc.cancelled.store(false, Ordering::Release);
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_cancellation() {
        let token = CancellationToken::new();
        assert!(token.check().is_ok());

        token.cancel();
        assert!(token.is_cancelled());
        assert_eq!(token.check(), Err(CmdBufError::Cancelled));
    }

    #[test]
    fn test_child_token() {
        let parent = CancellationToken::new();
        let child = parent.child();
        assert!(!child.is_cancelled());

        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_child_independent_cancel() {
        let parent = CancellationToken::new();
        let child = parent.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_reset_and_clone() {
        let token = CancellationToken::new();
        let other = token.clone();
        token.cancel();
        assert!(other.is_cancelled());
        other.reset();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_cancel_from_other_thread() {
        let token = CancellationToken::new();
        let remote = token.clone();
        std::thread::spawn(move || remote.cancel()).join().unwrap();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_dummy_token() {
        let token = CancellationToken::dummy();
        token.cancel();
        assert!(!token.is_cancelled());
    }
}
