//! Cooperative cancellation.
//!
//! Used both for per-call cancellation and as the stop signal of a running
//! session. Backed by [`tokio_util::sync::CancellationToken`], which stays out
//! of the public API.

use std::future::Future;

use tokio_util::sync::CancellationToken;

/// A clonable cancellation token.
///
/// Clones share the same cancellation state. Cancelling is idempotent.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: CancellationToken,
}

impl CancelToken {
    /// Create a new, non-cancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel this token and wake every waiter.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Returns `true` if the token has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// A future that resolves when the token is cancelled.
    ///
    /// The returned future is `Send + 'static` and does not borrow the token.
    pub fn cancelled(&self) -> impl Future<Output = ()> + Send + 'static {
        self.inner.clone().cancelled_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clones_observe_cancellation() {
        let token = CancelToken::new();
        let clone = token.clone();
        let waiter = tokio::spawn(clone.cancelled());

        assert!(!token.is_cancelled());
        token.cancel();
        token.cancel();

        waiter.await.unwrap();
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn already_cancelled_resolves_immediately() {
        let token = CancelToken::new();
        token.cancel();
        token.cancelled().await;
    }
}
