//! Retry policy and the retry engine.
//!
//! [`RetryExecutor`] runs an operation up to `max_attempts` times. Each failure is
//! classified; fatal errors stop the loop at once, transient ones are retried after an
//! exponentially growing, jittered delay. When the attempt budget runs out the last
//! error is wrapped in [`Error::MaxRetriesExceeded`]. The engine never substitutes a
//! default value for a failed call.

use crate::classify::{Classifier, DefaultClassifier, ErrorClassification};
use crate::context::CallContext;
use crate::response::{Response, RetryAttempt};
use crate::{Error, Result};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Fraction of the delay by which jitter may move it in either direction.
pub const JITTER_FACTOR: f64 = 0.25;

/// Defines how many attempts a call gets and how long to wait between them.
///
/// The unjittered delay after attempt `n` (zero-based) is
/// `min(base_delay * 2^n, max_delay)`. With jitter enabled the delay is moved by up to
/// ±25% and then floored at `base_delay`, so a jittered wait always lies within
/// `[base_delay, max_delay * 1.25]`.
///
/// # Examples
///
/// ```
/// use callward::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     base_delay: Duration::from_millis(100),
///     max_delay: Duration::from_secs(1),
///     jitter: false,
///     ..RetryPolicy::default()
/// };
///
/// assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
/// assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(1));
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first.
    pub max_attempts: usize,
    /// The delay after the first failed attempt, and the floor for jittered delays.
    pub base_delay: Duration,
    /// Cap on the unjittered delay.
    pub max_delay: Duration,
    /// Whether to randomise delays (recommended, prevents synchronised retry storms).
    pub jitter: bool,
    /// Whether a server `Retry-After` hint on a 429 may lengthen the wait.
    pub respect_retry_after: bool,
    /// Cap on how long a server hint may make us wait.
    pub max_server_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: true,
            respect_retry_after: true,
            max_server_wait: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Returns the capped exponential delay after attempt `attempt`, without jitter.
    pub fn unjittered_delay(&self, attempt: usize) -> Duration {
        let exponent = attempt.min(31) as u32;
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }

    /// Returns the delay to sleep after attempt `attempt` (zero-based) has failed.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let delay = self.unjittered_delay(attempt);
        if !self.jitter {
            return delay;
        }

        let offset = rand::thread_rng().gen_range(-1.0f64..=1.0) * JITTER_FACTOR;
        let jittered = delay.as_secs_f64() * (1.0 + offset);
        Duration::from_secs_f64(jittered.max(0.0)).max(self.base_delay)
    }

    /// Returns the delay after a failed attempt, honouring a server rate limit hint.
    fn delay_after(&self, attempt: usize, error: &Error) -> Duration {
        let backoff = self.delay_for_attempt(attempt);
        if !self.respect_retry_after {
            return backoff;
        }
        match error.rate_limit_delay(self.max_server_wait) {
            Some(hint) if hint > backoff => {
                tracing::info!(
                    rate_limit_delay_ms = hint.as_millis(),
                    attempt,
                    "Server rate limited, waiting for its hint"
                );
                hint
            }
            _ => backoff,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::ConfigurationError(
                "max attempts must be at least 1".to_string(),
            ));
        }
        if self.base_delay > self.max_delay {
            return Err(Error::ConfigurationError(format!(
                "base delay {:?} exceeds max delay {:?}",
                self.base_delay, self.max_delay
            )));
        }
        Ok(())
    }
}

/// Values that can be "blank": present, but carrying nothing usable.
///
/// Validated executions treat a blank success as [`Error::EmptyResponse`].
pub trait Blank {
    /// Returns `true` if the value is empty or whitespace only.
    fn is_blank(&self) -> bool;
}

impl Blank for String {
    fn is_blank(&self) -> bool {
        self.trim().is_empty()
    }
}

impl Blank for &str {
    fn is_blank(&self) -> bool {
        self.trim().is_empty()
    }
}

impl Blank for Vec<u8> {
    fn is_blank(&self) -> bool {
        self.is_empty()
    }
}

impl Blank for serde_json::Value {
    fn is_blank(&self) -> bool {
        match self {
            serde_json::Value::Null => true,
            serde_json::Value::String(s) => s.trim().is_empty(),
            serde_json::Value::Array(items) => items.is_empty(),
            serde_json::Value::Object(map) => map.is_empty(),
            serde_json::Value::Bool(_) | serde_json::Value::Number(_) => false,
        }
    }
}

impl<T: Blank> Blank for Option<T> {
    fn is_blank(&self) -> bool {
        self.as_ref().map_or(true, |value| value.is_blank())
    }
}

async fn until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Runs operations with classification-driven retries.
///
/// # Examples
///
/// ```no_run
/// use callward::{CallContext, Error, RetryExecutor, RetryPolicy};
///
/// # async fn example() -> Result<(), Error> {
/// let executor = RetryExecutor::new(RetryPolicy::default());
///
/// let response = executor
///     .execute_validated("gemini_text", &CallContext::new(), |attempt| async move {
///         if attempt == 0 {
///             Err(Error::Api { message: "503 overloaded".into() })
///         } else {
///             Ok("done".to_string())
///         }
///     })
///     .await?;
/// assert_eq!(response.attempts, 2);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    classifier: Arc<dyn Classifier>,
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RetryExecutor {
    /// Creates an executor using the [`DefaultClassifier`].
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            classifier: Arc::new(DefaultClassifier),
        }
    }

    /// Replaces the classifier.
    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Returns the retry policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Returns the classifier.
    pub fn classifier(&self) -> &dyn Classifier {
        self.classifier.as_ref()
    }

    /// Runs `f` with retries. `f` receives the zero-based attempt index.
    ///
    /// # Errors
    ///
    /// Returns the error unchanged if it is not retryable,
    /// [`Error::MaxRetriesExceeded`] if the attempt budget runs out,
    /// [`Error::DeadlineExceeded`] if another attempt would overrun the context deadline,
    /// and [`Error::Cancelled`] if the context is cancelled.
    pub async fn execute<F, Fut, T>(
        &self,
        operation: &str,
        ctx: &CallContext,
        f: F,
    ) -> Result<Response<T>>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with(operation, ctx, f, |_| false, |_| {})
            .await
    }

    /// Like [`execute`](Self::execute), but a blank success counts as
    /// [`Error::EmptyResponse`] and is retried.
    pub async fn execute_validated<F, Fut, T>(
        &self,
        operation: &str,
        ctx: &CallContext,
        f: F,
    ) -> Result<Response<T>>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T>>,
        T: Blank,
    {
        self.execute_with(operation, ctx, f, T::is_blank, |_| {})
            .await
    }

    /// The general form: `is_blank` decides whether a success is empty, and
    /// `on_attempt` observes every finished attempt.
    pub async fn execute_with<F, Fut, T, V, O>(
        &self,
        operation: &str,
        ctx: &CallContext,
        mut f: F,
        is_blank: V,
        mut on_attempt: O,
    ) -> Result<Response<T>>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T>>,
        V: Fn(&T) -> bool,
        O: FnMut(&RetryAttempt),
    {
        let start = Instant::now();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut history: Vec<RetryAttempt> = Vec::with_capacity(max_attempts);
        let mut delay_before = Duration::ZERO;
        let mut index = 0;

        loop {
            tracing::debug!(operation, attempt = index, "Executing attempt");
            let attempt_start = Instant::now();

            let outcome = tokio::select! {
                biased;
                _ = ctx.cancelled() => Err(Error::Cancelled),
                _ = until_deadline(ctx.deadline()) => Err(Error::Timeout),
                result = f(index) => result,
            };
            let outcome = match outcome {
                Ok(data) if is_blank(&data) => Err(Error::EmptyResponse),
                other => other,
            };

            let mut attempt = RetryAttempt {
                index,
                delay_before,
                duration: attempt_start.elapsed(),
                classification: None,
            };

            let error = match outcome {
                Ok(data) => {
                    on_attempt(&attempt);
                    history.push(attempt);
                    return Ok(Response::new(data, operation, start.elapsed(), history));
                }
                Err(Error::Cancelled) => {
                    tracing::debug!(operation, attempt = index, "Call cancelled");
                    return Err(Error::Cancelled);
                }
                Err(error) => error,
            };

            let classification = self.classifier.classify(&error);
            attempt.classification = Some(classification);
            on_attempt(&attempt);
            history.push(attempt);

            tracing::warn!(
                operation,
                attempt = index,
                error = %error,
                classification = %classification,
                "Attempt failed"
            );

            if !classification.is_retryable() {
                return Err(error);
            }

            let attempts = index + 1;
            if attempts >= max_attempts {
                return Err(Error::MaxRetriesExceeded {
                    attempts,
                    last_error: Box::new(error),
                });
            }

            let delay = self.policy.delay_after(index, &error);
            if let Some(deadline) = ctx.deadline() {
                if Instant::now() + delay >= deadline {
                    tracing::warn!(operation, attempts, "Deadline leaves no room for a retry");
                    return Err(Error::DeadlineExceeded {
                        attempts,
                        last_error: Box::new(error),
                    });
                }
            }

            tracing::info!(
                operation,
                delay_ms = delay.as_millis(),
                attempt = attempts,
                "Retrying after delay"
            );
            tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }

            delay_before = delay;
            index = attempts;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::FnClassifier;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            jitter: false,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_exponential_backoff_delays() {
        let policy = fast_policy(5);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(1600));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(200), Duration::from_secs(2));
    }

    proptest! {
        #[test]
        fn backoff_is_monotonic_capped_and_jitter_bounded(
            base_ms in 1u64..2_000,
            extra_ms in 0u64..60_000,
            attempts in 1usize..40,
        ) {
            let policy = RetryPolicy {
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(base_ms + extra_ms),
                jitter: true,
                ..RetryPolicy::default()
            };
            let upper = policy.max_delay.mul_f64(1.0 + JITTER_FACTOR);
            let mut previous = Duration::ZERO;
            for attempt in 0..attempts {
                let unjittered = policy.unjittered_delay(attempt);
                prop_assert!(unjittered >= previous);
                prop_assert!(unjittered <= policy.max_delay);
                previous = unjittered;

                let jittered = policy.delay_for_attempt(attempt);
                prop_assert!(jittered >= policy.base_delay);
                // Allow for float rounding in the upper bound.
                prop_assert!(jittered <= upper + Duration::from_micros(1));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_retryable_failures_then_success() {
        let executor = RetryExecutor::new(fast_policy(3));
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let response = executor
            .execute("op", &CallContext::new(), move |_| async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Timeout)
                } else {
                    Ok("ok")
                }
            })
            .await
            .unwrap();

        assert_eq!(response.data, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(response.attempts, 3);
        assert_eq!(response.history[1].delay_before, Duration::from_millis(100));
        assert_eq!(response.history[2].delay_before, Duration::from_millis(200));
        assert!(response.history[2].succeeded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_not_retried() {
        let executor = RetryExecutor::new(fast_policy(5));
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let result = executor
            .execute("op", &CallContext::new(), move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::Api {
                    message: "400 Bad Request: invalid argument".into(),
                })
            })
            .await;

        assert!(matches!(result, Err(Error::Api { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_wraps_last_error() {
        let executor = RetryExecutor::new(fast_policy(3));
        let result = executor
            .execute("op", &CallContext::new(), |attempt| async move {
                Err::<(), _>(Error::Api {
                    message: format!("503 unavailable (attempt {attempt})"),
                })
            })
            .await;

        match result {
            Err(Error::MaxRetriesExceeded {
                attempts,
                last_error,
            }) => {
                assert_eq!(attempts, 3);
                assert!(last_error.to_string().contains("attempt 2"));
            }
            other => panic!("Expected MaxRetriesExceeded, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_result_is_retried_as_empty() {
        let executor = RetryExecutor::new(fast_policy(2));
        let mut seen = Vec::new();

        let result = executor
            .execute_with(
                "op",
                &CallContext::new(),
                |_| async { Ok::<_, Error>("   ".to_string()) },
                |s: &String| s.is_blank(),
                |attempt| seen.push(attempt.classification),
            )
            .await;

        match result {
            Err(Error::MaxRetriesExceeded { last_error, .. }) => {
                assert!(matches!(*last_error, Error::EmptyResponse))
            }
            other => panic!("Expected MaxRetriesExceeded, got {:?}", other),
        }
        assert_eq!(seen, vec![Some(ErrorClassification::EmptyResponse); 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unvalidated_blank_is_success() {
        let executor = RetryExecutor::new(fast_policy(2));
        let response = executor
            .execute("op", &CallContext::new(), |_| async {
                Ok::<_, Error>(String::new())
            })
            .await
            .unwrap();
        assert_eq!(response.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff() {
        let executor = RetryExecutor::new(RetryPolicy {
            base_delay: Duration::from_secs(10),
            jitter: false,
            ..RetryPolicy::default()
        });
        let ctx = CallContext::new();
        let token = ctx.cancellation_token();
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        let result = executor
            .execute("op", &ctx, move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::Timeout)
            })
            .await;
        canceller.await.unwrap();

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_retries_early() {
        let executor = RetryExecutor::new(RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(4),
            max_delay: Duration::from_secs(60),
            jitter: false,
            ..RetryPolicy::default()
        });
        let ctx = CallContext::new().with_timeout(Duration::from_secs(10));
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let result = executor
            .execute("op", &ctx, move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::Timeout)
            })
            .await;

        // Sleeps of 4s then 8s: the second would overrun the 10s deadline.
        match result {
            Err(Error::DeadlineExceeded { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("Expected DeadlineExceeded, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expiring_mid_attempt() {
        let executor = RetryExecutor::new(fast_policy(5));
        let ctx = CallContext::new().with_timeout(Duration::from_secs(3));
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let result = executor
            .execute("op", &ctx, move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                std::future::pending::<Result<()>>().await
            })
            .await;

        match result {
            Err(Error::DeadlineExceeded {
                attempts,
                last_error,
            }) => {
                assert_eq!(attempts, 1);
                assert!(matches!(*last_error, Error::Timeout));
            }
            other => panic!("Expected DeadlineExceeded, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_classifier() {
        let executor = RetryExecutor::new(fast_policy(4)).with_classifier(Arc::new(
            FnClassifier(|_: &Error| ErrorClassification::Fatal),
        ));
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let _ = executor
            .execute("op", &CallContext::new(), move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::Timeout)
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_policy_validation() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        }
        .validate()
        .is_err());
        assert!(RetryPolicy {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(1),
            ..RetryPolicy::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_blank_values() {
        assert!(" \n".to_string().is_blank());
        assert!(!"x".is_blank());
        assert!(serde_json::Value::Null.is_blank());
        assert!(serde_json::json!([]).is_blank());
        assert!(!serde_json::json!([1]).is_blank());
        assert!(None::<String>.is_blank());
        assert!(Vec::<u8>::new().is_blank());
    }
}
