//! Error types for resilient calls.
//!
//! Every failure the resilience core can surface is a variant of [`Error`]. Transport-level
//! causes (network failures, timeouts, HTTP errors) keep their raw details for debugging,
//! while load-shedding signals ([`Error::RateLimited`], [`Error::CircuitOpen`]) and
//! response-shape anomalies carry just enough context for the caller to decide what to do.

use crate::classify::{Classifier, DefaultClassifier, ErrorClassification};
use http::{HeaderMap, StatusCode};
use std::time::Duration;

/// The main error type for resilient calls.
///
/// # Examples
///
/// ```no_run
/// use callward::{Error, ResilientCaller, CallContext};
///
/// # async fn example() -> Result<(), Error> {
/// let caller = ResilientCaller::builder().build()?;
///
/// let result = caller
///     .execute("gemini_text", &CallContext::new(), |_attempt| async {
///         Ok::<_, Error>("hello".to_string())
///     })
///     .await;
///
/// match result {
///     Ok(response) => println!("Success: {}", response.data),
///     Err(Error::RateLimited { retry_after, .. }) => {
///         eprintln!("Slow down, try again in {:?}", retry_after);
///     }
///     Err(Error::CircuitOpen { operation, .. }) => {
///         eprintln!("{} is currently unavailable", operation);
///     }
///     Err(e) => eprintln!("Other error: {}", e),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A network-level error occurred (connection failed, DNS lookup failed, etc.).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The request or attempt timed out.
    #[error("Request timed out")]
    Timeout,

    /// The server returned a non-2xx HTTP status code.
    #[error("HTTP error {status}: {raw_response}")]
    HttpError {
        /// The HTTP status code
        status: StatusCode,
        /// The raw response body
        raw_response: String,
        /// The response headers
        headers: HeaderMap,
        /// Rate limit information parsed from headers
        rate_limit_info: Option<crate::rate_limit::RateLimitInfo>,
    },

    /// Failed to deserialize the response body.
    ///
    /// The raw body is preserved so malformed payloads can be inspected in production.
    #[error("Failed to deserialize response (status {status}): {serde_error}")]
    DeserializationFailed {
        /// The raw response body that failed to deserialize
        raw_response: String,
        /// The serde error message
        serde_error: String,
        /// The HTTP status code
        status: StatusCode,
    },

    /// An opaque error reported by the API or an SDK that exposes no status code.
    ///
    /// These are classified by message text only.
    #[error("API error: {message}")]
    Api {
        /// The error message as reported
        message: String,
    },

    /// Admission was denied by the local rate limiter. The operation was not attempted.
    #[error("Rate limited on '{operation}', retry after {retry_after:?}")]
    RateLimited {
        /// The operation key that was denied
        operation: String,
        /// How long until the window has room again
        retry_after: Duration,
    },

    /// The circuit breaker for this operation is open. The operation was not attempted.
    #[error("Circuit open for '{operation}', retry after {retry_after:?}")]
    CircuitOpen {
        /// The operation key whose circuit is open
        operation: String,
        /// How long until the breaker will admit a probe
        retry_after: Duration,
    },

    /// The response was well-formed but carried no usable content.
    #[error("Empty response")]
    EmptyResponse,

    /// The response was blocked by a safety or content filter.
    #[error("Content filtered: {reason}")]
    ContentFiltered {
        /// The block or finish reason reported by the API
        reason: String,
    },

    /// The response did not have the expected shape.
    #[error("Malformed response: {detail}")]
    MalformedResponse {
        /// What was wrong with the payload
        detail: String,
        /// The offending payload text, truncated, when there is one
        snippet: Option<String>,
    },

    /// All attempts were used up without success.
    #[error("Max retries exceeded after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded {
        /// The number of attempts made
        attempts: usize,
        /// The last error encountered
        last_error: Box<Error>,
    },

    /// The caller's deadline would be exceeded by another attempt.
    #[error("Deadline exceeded after {attempts} attempts: {last_error}")]
    DeadlineExceeded {
        /// The number of attempts made
        attempts: usize,
        /// The last error encountered
        last_error: Box<Error>,
    },

    /// The call was cancelled by the caller.
    #[error("Call cancelled")]
    Cancelled,

    /// Invalid configuration was provided.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Failed to serialize the request payload.
    #[error("Failed to serialize request: {0}")]
    SerializationFailed(String),

    /// An invalid URL was provided.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl Error {
    /// Returns the classification of this error under the [`DefaultClassifier`].
    ///
    /// # Examples
    ///
    /// ```
    /// use callward::{Error, ErrorClassification};
    ///
    /// assert_eq!(Error::Timeout.classification(), ErrorClassification::Retryable);
    /// assert_eq!(
    ///     Error::Api { message: "401 Unauthorized".into() }.classification(),
    ///     ErrorClassification::Fatal,
    /// );
    /// ```
    pub fn classification(&self) -> ErrorClassification {
        DefaultClassifier.classify(self)
    }

    /// Returns `true` if a retry of the same call could succeed.
    ///
    /// Fatal errors and load-shedding signals are not retryable; transient failures and
    /// response-shape anomalies are.
    pub fn is_retryable(&self) -> bool {
        self.classification().is_retryable()
    }

    /// Returns the HTTP status code if this error has one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::HttpError { status, .. } => Some(*status),
            Error::DeserializationFailed { status, .. } => Some(*status),
            Error::MaxRetriesExceeded { last_error, .. }
            | Error::DeadlineExceeded { last_error, .. } => last_error.status(),
            _ => None,
        }
    }

    /// Returns the raw response body if this error has one.
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            Error::HttpError { raw_response, .. } => Some(raw_response),
            Error::DeserializationFailed { raw_response, .. } => Some(raw_response),
            Error::MalformedResponse { snippet, .. } => snippet.as_deref(),
            _ => None,
        }
    }

    /// Returns server-side rate limit information if available.
    pub fn rate_limit_info(&self) -> Option<&crate::rate_limit::RateLimitInfo> {
        match self {
            Error::HttpError {
                rate_limit_info, ..
            } => rate_limit_info.as_ref(),
            _ => None,
        }
    }

    /// Returns the server-recommended delay, capped by `max_wait`.
    pub fn rate_limit_delay(&self, max_wait: Duration) -> Option<Duration> {
        self.rate_limit_info()?.delay(max_wait)
    }

    /// Returns how long the caller should wait before trying again, for load-shedding errors.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after, .. } | Error::CircuitOpen { retry_after, .. } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }

    /// Returns the innermost cause, unwrapping retry-exhaustion wrappers.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::MaxRetriesExceeded { last_error, .. }
            | Error::DeadlineExceeded { last_error, .. } => last_error.root_cause(),
            other => other,
        }
    }
}

/// A specialized `Result` type for resilient calls.
pub type Result<T> = std::result::Result<T, Error>;
