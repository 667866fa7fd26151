//! The composition root.
//!
//! [`ResilientCaller`] wires the pieces together for a named operation:
//!
//! ```text
//! RateLimiter::try_acquire ──denied──> Error::RateLimited
//!        │
//! CircuitBreaker::acquire ───open────> Error::CircuitOpen
//!        │
//! RetryExecutor (each attempt under the breaker's call timeout)
//!        │
//! permit.success() / permit.failure()
//! ```
//!
//! The breaker sees the outcome of the whole retry sequence, not of individual
//! attempts: a transient failure that a later attempt recovers from is not a breaker
//! failure, while an exhausted retry budget (or deadline) counts as exactly one.
//! Fatal errors and cancellations are not counted.

use crate::audit::{emit, AuditOutcome, AuditRecord, AuditSink, TracingAuditSink};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::classify::{Classifier, ErrorClassification};
use crate::config::ResilienceConfig;
use crate::context::CallContext;
use crate::rate_limit::{RateLimitRule, RateLimiter};
use crate::retry::{Blank, RetryExecutor, RetryPolicy};
use crate::{Error, Response, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Single entry point for resilient calls.
///
/// Construct one at start-up and share it (it is cheap to clone); all clones see the
/// same per-operation limiter and breaker state.
///
/// # Examples
///
/// ```no_run
/// use callward::{CallContext, Error, ResilientCaller};
///
/// # async fn call_model(prompt: &str) -> Result<String, Error> { Ok(prompt.to_string()) }
/// # async fn example() -> Result<(), Error> {
/// let caller = ResilientCaller::builder().max_attempts(4).build()?;
///
/// let response = caller
///     .execute_validated("gemini_text", &CallContext::new(), |_attempt| {
///         call_model("Describe this room")
///     })
///     .await?;
/// println!("{} (after {} attempts)", response.data, response.attempts);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ResilientCaller {
    inner: Arc<CallerInner>,
}

struct CallerInner {
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    executor: RetryExecutor,
    audit: Arc<dyn AuditSink>,
}

impl ResilientCaller {
    /// Creates a new `ResilientCallerBuilder`.
    pub fn builder() -> ResilientCallerBuilder {
        ResilientCallerBuilder::new()
    }

    /// Returns the rate limiter.
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    /// Returns the circuit breaker.
    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    /// Returns the retry executor.
    pub fn retry_executor(&self) -> &RetryExecutor {
        &self.inner.executor
    }

    /// Runs `f` under `operation`'s rate limit, circuit breaker and retry policy.
    ///
    /// `f` is called once per attempt with the zero-based attempt index.
    ///
    /// # Errors
    ///
    /// - [`Error::RateLimited`] or [`Error::CircuitOpen`] without calling `f`.
    /// - A fatal error from `f`, unchanged, after one attempt.
    /// - [`Error::MaxRetriesExceeded`] or [`Error::DeadlineExceeded`] wrapping the last
    ///   error once retrying stops.
    /// - [`Error::Cancelled`] if the context is cancelled.
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
        self.run(operation, ctx, f, |_| false).await
    }

    /// Like [`execute`](Self::execute), but a blank result is treated as
    /// [`Error::EmptyResponse`] and retried.
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
        self.run(operation, ctx, f, T::is_blank).await
    }

    async fn run<F, Fut, T, V>(
        &self,
        operation: &str,
        ctx: &CallContext,
        mut f: F,
        is_blank: V,
    ) -> Result<Response<T>>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T>>,
        V: Fn(&T) -> bool,
    {
        let inner = &*self.inner;

        if let Err(retry_after) = inner.limiter.try_acquire(operation) {
            tracing::warn!(
                operation,
                retry_after_ms = retry_after.as_millis(),
                "Rate limited, call not attempted"
            );
            self.reject(operation, ErrorClassification::RateLimited);
            return Err(Error::RateLimited {
                operation: operation.to_string(),
                retry_after,
            });
        }

        let permit = match inner.breaker.acquire(operation) {
            Ok(permit) => permit,
            Err(e) => {
                tracing::warn!(operation, error = %e, "Circuit open, call not attempted");
                self.reject(operation, ErrorClassification::CircuitOpen);
                return Err(e);
            }
        };

        let breaker = &inner.breaker;
        let sink = inner.audit.as_ref();
        let result = inner
            .executor
            .execute_with(
                operation,
                ctx,
                |attempt| breaker.guard_attempt(f(attempt)),
                is_blank,
                |attempt| {
                    let outcome = match attempt.classification {
                        None => AuditOutcome::Success,
                        Some(c) => AuditOutcome::Failed(c),
                    };
                    emit(
                        sink,
                        operation,
                        AuditRecord {
                            attempt: attempt.index,
                            duration: attempt.duration,
                            outcome,
                            circuit_state: permit.state(),
                        },
                    );
                },
            )
            .await;

        match &result {
            Ok(response) => {
                tracing::debug!(
                    operation,
                    attempts = response.attempts,
                    latency_ms = response.latency.as_millis(),
                    "Call succeeded"
                );
                permit.success();
            }
            Err(e @ (Error::MaxRetriesExceeded { .. } | Error::DeadlineExceeded { .. })) => {
                tracing::warn!(operation, error = %e, "Call failed");
                permit.failure();
            }
            // Cancellation and fatal errors say nothing about the remote service's health.
            Err(e) => {
                tracing::debug!(operation, error = %e, "Call ended without a circuit verdict");
                drop(permit);
            }
        }
        result
    }

    fn reject(&self, operation: &str, classification: ErrorClassification) {
        emit(
            self.inner.audit.as_ref(),
            operation,
            AuditRecord {
                attempt: 0,
                duration: Duration::ZERO,
                outcome: AuditOutcome::Rejected(classification),
                circuit_state: self.inner.breaker.state(operation),
            },
        );
    }

    /// Forces `operation`'s circuit closed and clears its rate window.
    pub fn reset(&self, operation: &str) {
        self.inner.breaker.reset(operation);
        self.inner.limiter.reset(operation);
    }

    /// Resets every circuit and rate window.
    pub fn reset_all(&self) {
        self.inner.breaker.reset_all();
        self.inner.limiter.reset_all();
    }
}

impl std::fmt::Debug for ResilientCaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientCaller")
            .field("limiter", &self.inner.limiter)
            .field("breaker", &self.inner.breaker)
            .field("executor", &self.inner.executor)
            .finish_non_exhaustive()
    }
}

/// Builder for configuring and creating a [`ResilientCaller`].
///
/// # Examples
///
/// ```
/// use callward::{ResilientCaller, RetryPolicy};
/// use callward::rate_limit::RateLimitRule;
/// use std::time::Duration;
///
/// let caller = ResilientCaller::builder()
///     .retry_policy(RetryPolicy {
///         max_attempts: 4,
///         base_delay: Duration::from_millis(500),
///         ..RetryPolicy::default()
///     })
///     .rate_limit("gemini_text", RateLimitRule::per_minute(20))
///     .build()
///     .unwrap();
/// ```
pub struct ResilientCallerBuilder {
    config: ResilienceConfig,
    classifier: Option<Arc<dyn Classifier>>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl ResilientCallerBuilder {
    /// Creates a builder with default settings.
    pub fn new() -> Self {
        Self {
            config: ResilienceConfig::default(),
            classifier: None,
            audit: None,
        }
    }

    /// Replaces the whole configuration, e.g. with [`ResilienceConfig::from_env`].
    pub fn config(mut self, config: ResilienceConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the retry policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    /// Sets the attempt budget, keeping the rest of the retry policy.
    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.config.retry.max_attempts = max_attempts;
        self
    }

    /// Sets the circuit breaker configuration.
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.config.circuit = config;
        self
    }

    /// Sets the admission rule for `operation`.
    pub fn rate_limit(mut self, operation: impl Into<String>, rule: RateLimitRule) -> Self {
        self.config.rate_limits.insert(operation.into(), rule);
        self
    }

    /// Sets the admission rule for operations without their own.
    pub fn default_rate_limit(mut self, rule: RateLimitRule) -> Self {
        self.config.default_rate_limit = rule;
        self
    }

    /// Sets a custom error classifier.
    ///
    /// By default errors are classified by [`DefaultClassifier`](crate::DefaultClassifier).
    pub fn classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Sets the audit sink. Defaults to [`TracingAuditSink`].
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Builds the configured `ResilientCaller`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationError`] if the configuration is invalid.
    pub fn build(self) -> Result<ResilientCaller> {
        self.config.validate()?;

        let mut executor = RetryExecutor::new(self.config.retry);
        if let Some(classifier) = self.classifier {
            executor = executor.with_classifier(classifier);
        }

        Ok(ResilientCaller {
            inner: Arc::new(CallerInner {
                limiter: RateLimiter::with_rules(
                    self.config.default_rate_limit,
                    self.config.rate_limits,
                ),
                breaker: CircuitBreaker::new(self.config.circuit),
                executor,
                audit: self.audit.unwrap_or_else(|| Arc::new(TracingAuditSink)),
            }),
        })
    }
}

impl Default for ResilientCallerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<(String, AuditRecord)>>);

    impl AuditSink for RecordingSink {
        fn record(&self, operation: &str, record: &AuditRecord) {
            self.0
                .lock()
                .unwrap()
                .push((operation.to_string(), record.clone()));
        }
    }

    fn caller(sink: Arc<RecordingSink>) -> ResilientCaller {
        ResilientCaller::builder()
            .retry_policy(RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
                jitter: false,
                ..RetryPolicy::default()
            })
            .circuit_breaker(CircuitBreakerConfig::default().with_failure_threshold(2))
            .audit_sink(sink)
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovered_transient_failure_does_not_count_against_circuit() {
        let sink = Arc::new(RecordingSink::default());
        let caller = caller(sink.clone());
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        for _ in 0..3 {
            let response = caller
                .execute("gemini_text", &CallContext::new(), move |attempt| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if attempt == 0 {
                        Err(Error::Timeout)
                    } else {
                        Ok(attempt)
                    }
                })
                .await
                .unwrap();
            assert_eq!(response.data, 1);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(caller.circuit_breaker().failure_count("gemini_text"), 0);

        let records = sink.0.lock().unwrap();
        assert_eq!(records.len(), 6);
        assert_eq!(
            records[0].1.outcome,
            AuditOutcome::Failed(ErrorClassification::Retryable)
        );
        assert_eq!(records[1].1.outcome, AuditOutcome::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_count_once() {
        let sink = Arc::new(RecordingSink::default());
        let caller = caller(sink);

        let result = caller
            .execute("k", &CallContext::new(), |_| async {
                Err::<(), _>(Error::Api {
                    message: "502 bad gateway".into(),
                })
            })
            .await;
        assert!(matches!(result, Err(Error::MaxRetriesExceeded { attempts: 3, .. })));
        assert_eq!(caller.circuit_breaker().failure_count("k"), 1);
        assert_eq!(caller.circuit_breaker().state("k"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_not_a_circuit_failure() {
        let caller = caller(Arc::new(RecordingSink::default()));
        for _ in 0..3 {
            let result = caller
                .execute("k", &CallContext::new(), |_| async {
                    Err::<(), _>(Error::Api {
                        message: "400 Bad Request".into(),
                    })
                })
                .await;
            assert!(matches!(result, Err(Error::Api { .. })));
        }
        assert_eq!(caller.circuit_breaker().failure_count("k"), 0);
        assert_eq!(caller.circuit_breaker().state("k"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejections_are_audited_and_not_attempted() {
        let sink = Arc::new(RecordingSink::default());
        let caller = ResilientCaller::builder()
            .rate_limit("k", RateLimitRule::per_minute(1))
            .audit_sink(sink.clone())
            .build()
            .unwrap();
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let op = move |_: usize| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Error>(())
        };
        caller.execute("k", &CallContext::new(), op).await.unwrap();
        let denied = caller.execute("k", &CallContext::new(), op).await;

        match denied {
            Err(Error::RateLimited { retry_after, .. }) => assert!(retry_after > Duration::ZERO),
            other => panic!("Expected RateLimited, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let records = sink.0.lock().unwrap();
        assert_eq!(
            records.last().unwrap().1.outcome,
            AuditOutcome::Rejected(ErrorClassification::RateLimited)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_validated_blank_result_is_retried() {
        let caller = caller(Arc::new(RecordingSink::default()));
        let response = caller
            .execute_validated("k", &CallContext::new(), |attempt| async move {
                Ok::<_, Error>(if attempt < 2 { String::new() } else { "text".into() })
            })
            .await
            .unwrap();
        assert_eq!(response.data, "text");
        assert_eq!(response.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_breaker_and_window() {
        let caller = ResilientCaller::builder()
            .rate_limit("k", RateLimitRule::per_minute(1))
            .circuit_breaker(CircuitBreakerConfig::default().with_failure_threshold(1))
            .max_attempts(1)
            .build()
            .unwrap();

        let _ = caller
            .execute("k", &CallContext::new(), |_| async {
                Err::<(), _>(Error::Timeout)
            })
            .await;
        assert_eq!(caller.circuit_breaker().state("k"), CircuitState::Open);
        assert!(!caller.rate_limiter().admit("k"));

        caller.reset("k");
        assert_eq!(caller.circuit_breaker().state("k"), CircuitState::Closed);
        assert!(caller.rate_limiter().admit("k"));
    }

    #[test]
    fn test_invalid_config_fails_build() {
        assert!(ResilientCaller::builder().max_attempts(0).build().is_err());
    }
}
