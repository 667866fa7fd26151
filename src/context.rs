//! Per-call cancellation and deadline.

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation token and optional deadline threaded through every layer of a call.
///
/// Cancelling the token stops the call at its next suspension point (an attempt in
/// flight or a backoff sleep) with [`Error::Cancelled`](crate::Error::Cancelled).
/// A deadline stops retries early rather than letting a backoff run past it.
///
/// # Examples
///
/// ```
/// use callward::CallContext;
/// use std::time::Duration;
///
/// let ctx = CallContext::new().with_timeout(Duration::from_secs(20));
/// let token = ctx.cancellation_token();
///
/// // e.g. from a "screen closed" handler
/// token.cancel();
/// assert!(ctx.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    /// Creates a context with a fresh token and no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses an existing token, so one token can cancel several calls.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Sets an absolute deadline for the whole call.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets a deadline `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Returns a handle to this context's cancellation token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Returns `true` once the token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns the deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the time left before the deadline, or `None` without one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub(crate) async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_remaining_counts_down() {
        let ctx = CallContext::new().with_timeout(Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(ctx.remaining(), Some(Duration::from_secs(6)));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
        assert_eq!(CallContext::new().remaining(), None);
    }

    #[test]
    fn test_shared_token_cancels_clones() {
        let token = CancellationToken::new();
        let a = CallContext::new().with_cancellation(token.clone());
        let b = a.clone();
        token.cancel();
        assert!(a.is_cancelled() && b.is_cancelled());
    }
}
