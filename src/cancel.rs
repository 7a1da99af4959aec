//! Cancellation token for initialization runs
//!
//! A run-level token is observed by the orchestrator between waves and handed
//! to lifecycle hooks so long-running startup work can abort cooperatively.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// A token signalling cancellation across async operations.
///
/// Cloning shares the same state. Child tokens observe their parent: a child
/// reports cancelled as soon as either itself or any ancestor is cancelled.
///
/// # Examples
///
/// ```rust
/// use ignition::CancellationToken;
///
/// let run = CancellationToken::new();
/// let wave = run.child_token();
///
/// run.cancel();
/// assert!(wave.is_cancelled());
/// ```
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
    parent: Option<CancellationToken>,
}

impl CancellationToken {
    /// Create a fresh, uncancelled token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
                parent: None,
            }),
        }
    }

    /// Create a child token cancelled when either it or its parent is.
    pub fn child_token(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Create a token that cancels itself after `timeout`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_timeout(timeout: Duration) -> Self {
        let token = Self::new();
        let armed = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            armed.cancel();
        });
        token
    }

    /// Signal cancellation and wake all waiters.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Whether this token or any ancestor has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::Acquire) {
            return true;
        }
        match &self.inner.parent {
            Some(parent) => parent.is_cancelled(),
            None => false,
        }
    }

    /// Wait until this token (or an ancestor) is cancelled.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            // The notified future is created before re-checking, so a cancel
            // racing with this loop cannot be missed on this token. Parent
            // cancellations wake their own waiters, hence the short poll.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            if self.inner.parent.is_some() {
                tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep(Duration::from_millis(5)) => {}
                }
            } else {
                notified.await;
            }
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
            .field("has_parent", &self.inner.parent.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_is_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn clones_share_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn child_observes_parent() {
        let parent = CancellationToken::new();
        let child = parent.child_token();

        parent.cancel();
        assert!(child.is_cancelled());
        // Only the parent flag flipped; the child reports it transitively.
        assert!(!child.inner.cancelled.load(Ordering::Acquire));
    }

    #[test]
    fn child_cancel_does_not_touch_parent() {
        let parent = CancellationToken::new();
        let child = parent.child_token();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_future_wakes_on_cancel() {
        let token = CancellationToken::new();
        let waiter = token.clone();

        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn timeout_token_cancels_itself() {
        let token = CancellationToken::with_timeout(Duration::from_millis(20));
        assert!(!token.is_cancelled());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(token.is_cancelled());
    }
}
