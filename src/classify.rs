//! Error classification.
//!
//! Every error or response anomaly maps to exactly one [`ErrorClassification`]. The
//! [`DefaultClassifier`] looks at structured information first (HTTP status codes, typed
//! variants) and only falls back to message matching for opaque [`Error::Api`] errors.

use crate::Error;
use regex::Regex;
use std::sync::OnceLock;

/// The handling category of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClassification {
    /// Transient failure; the same call may succeed after a backoff.
    Retryable,
    /// Permanent failure; retrying cannot succeed and wastes quota.
    Fatal,
    /// The circuit breaker rejected the call without attempting it.
    CircuitOpen,
    /// The rate limiter rejected the call without attempting it.
    RateLimited,
    /// The response carried no usable content.
    EmptyResponse,
    /// The response was blocked by a content filter.
    ContentFiltered,
}

impl ErrorClassification {
    /// Returns `true` if the retry engine should try again after this outcome.
    ///
    /// Load-shedding classifications are returned to the caller immediately and are
    /// never retried internally.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorClassification::Retryable
                | ErrorClassification::EmptyResponse
                | ErrorClassification::ContentFiltered
        )
    }

    /// A short, stable label for logs and audit records.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClassification::Retryable => "retryable",
            ErrorClassification::Fatal => "fatal",
            ErrorClassification::CircuitOpen => "circuit_open",
            ErrorClassification::RateLimited => "rate_limited",
            ErrorClassification::EmptyResponse => "empty_response",
            ErrorClassification::ContentFiltered => "content_filtered",
        }
    }
}

impl std::fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps an error to its handling category.
///
/// Implementations must be pure: the same error always yields the same classification.
///
/// # Examples
///
/// ```
/// use callward::{Classifier, Error, ErrorClassification};
///
/// struct NeverRetry;
///
/// impl Classifier for NeverRetry {
///     fn classify(&self, _error: &Error) -> ErrorClassification {
///         ErrorClassification::Fatal
///     }
/// }
///
/// assert_eq!(NeverRetry.classify(&Error::Timeout), ErrorClassification::Fatal);
/// ```
pub trait Classifier: Send + Sync {
    /// Classifies the error.
    fn classify(&self, error: &Error) -> ErrorClassification;
}

/// Status-code-aware classifier with a message-matching fallback.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl Classifier for DefaultClassifier {
    fn classify(&self, error: &Error) -> ErrorClassification {
        match error {
            Error::Network(_) | Error::Timeout => ErrorClassification::Retryable,
            Error::HttpError { status, .. } => classify_status(status.as_u16()),
            // A 200 with an unparsable body is an API-shape problem, which resolves on retry.
            Error::DeserializationFailed { status, .. } if status.is_success() => {
                ErrorClassification::Retryable
            }
            Error::DeserializationFailed { status, .. } => classify_status(status.as_u16()),
            Error::Api { message } => classify_message(message),
            Error::RateLimited { .. } => ErrorClassification::RateLimited,
            Error::CircuitOpen { .. } => ErrorClassification::CircuitOpen,
            Error::EmptyResponse => ErrorClassification::EmptyResponse,
            Error::ContentFiltered { .. } => ErrorClassification::ContentFiltered,
            Error::MalformedResponse { .. } => ErrorClassification::Retryable,
            Error::MaxRetriesExceeded { .. }
            | Error::DeadlineExceeded { .. }
            | Error::Cancelled
            | Error::ConfigurationError(_)
            | Error::SerializationFailed(_)
            | Error::InvalidUrl(_) => ErrorClassification::Fatal,
        }
    }
}

/// Classifier backed by a closure.
pub struct FnClassifier<F>(pub F);

impl<F> Classifier for FnClassifier<F>
where
    F: Fn(&Error) -> ErrorClassification + Send + Sync,
{
    fn classify(&self, error: &Error) -> ErrorClassification {
        (self.0)(error)
    }
}

/// Classifies an HTTP status code.
///
/// 408, 429 and every 5xx are retryable; every other non-success code is fatal.
pub fn classify_status(status: u16) -> ErrorClassification {
    match status {
        408 | 429 => ErrorClassification::Retryable,
        500..=599 => ErrorClassification::Retryable,
        _ => ErrorClassification::Fatal,
    }
}

fn fatal_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"\b(400|401|403)\b|bad request|unauthori[sz]ed|unauthenticated|forbidden|permission denied|invalid argument|api key not valid",
        )
        .unwrap_or_else(|e| unreachable!("static pattern: {e}"))
    })
}

fn retryable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"\b(429|500|502|503|504)\b|timeout|timed out|deadline exceeded|network|connection|unavailable|overloaded|resource exhausted|resource_exhausted|too many requests|internal error|unhandled content format",
        )
        .unwrap_or_else(|e| unreachable!("static pattern: {e}"))
    })
}

/// Classifies an opaque error message.
///
/// This is the fallback for error sources that expose no status code. Matching is
/// case-insensitive. Fatal status codes and phrases win over retryable ones, and
/// anything unrecognised is fatal so unknown errors are not retried.
///
/// # Examples
///
/// ```
/// use callward::classify::classify_message;
/// use callward::ErrorClassification;
///
/// assert_eq!(classify_message("Connection reset by peer"), ErrorClassification::Retryable);
/// assert_eq!(classify_message("HTTP 503 Service Unavailable"), ErrorClassification::Retryable);
/// assert_eq!(classify_message("HTTP 403 Forbidden"), ErrorClassification::Fatal);
/// assert_eq!(classify_message("something odd"), ErrorClassification::Fatal);
/// ```
pub fn classify_message(message: &str) -> ErrorClassification {
    let lowered = message.to_lowercase();
    if fatal_pattern().is_match(&lowered) {
        ErrorClassification::Fatal
    } else if retryable_pattern().is_match(&lowered) {
        ErrorClassification::Retryable
    } else {
        ErrorClassification::Fatal
    }
}
