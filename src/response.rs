//! Result wrapper for successful resilient calls.
//!
//! The [`Response`] type carries the value produced by the operation together with
//! how it was obtained: how many attempts it took, how long the whole call ran, and
//! the record of every attempt.

use std::time::Duration;

use crate::classify::ErrorClassification;

/// Record of one attempt within a single call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryAttempt {
    /// Zero-based attempt index.
    pub index: usize,
    /// The backoff slept before this attempt (zero for the first).
    pub delay_before: Duration,
    /// How long the attempt itself ran.
    pub duration: Duration,
    /// The classification of the attempt's error, or `None` if it succeeded.
    pub classification: Option<ErrorClassification>,
}

impl RetryAttempt {
    /// Returns `true` if this attempt produced the result.
    pub fn succeeded(&self) -> bool {
        self.classification.is_none()
    }
}

/// A successful call result with attempt metadata.
///
/// # Examples
///
/// ```no_run
/// use callward::{CallContext, Error, ResilientCaller};
///
/// # async fn example() -> Result<(), Error> {
/// let caller = ResilientCaller::builder().build()?;
/// let response = caller
///     .execute("gemini_text", &CallContext::new(), |_| async {
///         Ok::<_, Error>("a cat on a sofa".to_string())
///     })
///     .await?;
///
/// println!("Got: {}", response.data);
/// println!("Took {:?} over {} attempt(s)", response.latency, response.attempts);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Response<T> {
    /// The value produced by the operation.
    pub data: T,

    /// The operation key the call ran under.
    pub operation: String,

    /// Total latency, including backoff sleeps between attempts.
    pub latency: Duration,

    /// The number of attempts made.
    ///
    /// This will be `1` for calls that succeeded on the first try.
    pub attempts: usize,

    /// Every attempt in order; the last one succeeded.
    pub history: Vec<RetryAttempt>,
}

impl<T> Response<T> {
    /// Creates a new `Response`.
    pub fn new(
        data: T,
        operation: impl Into<String>,
        latency: Duration,
        history: Vec<RetryAttempt>,
    ) -> Self {
        Self {
            data,
            operation: operation.into(),
            latency,
            attempts: history.len(),
            history,
        }
    }

    /// Maps the response data while keeping the metadata.
    ///
    /// # Examples
    ///
    /// ```
    /// # use callward::Response;
    /// # use std::time::Duration;
    /// let response = Response::new(42, "gemini_text", Duration::from_millis(100), Vec::new());
    /// let string_response = response.map(|n| n.to_string());
    /// assert_eq!(string_response.data, "42");
    /// ```
    pub fn map<U, F>(self, f: F) -> Response<U>
    where
        F: FnOnce(T) -> U,
    {
        Response {
            data: f(self.data),
            operation: self.operation,
            latency: self.latency,
            attempts: self.attempts,
            history: self.history,
        }
    }

    /// Returns `true` if the call needed more than one attempt.
    pub fn was_retried(&self) -> bool {
        self.attempts > 1
    }

    /// Returns the total time spent sleeping between attempts.
    pub fn total_backoff(&self) -> Duration {
        self.history.iter().map(|a| a.delay_before).sum()
    }
}

impl<T> AsRef<T> for Response<T> {
    fn as_ref(&self) -> &T {
        &self.data
    }
}

impl<T> std::ops::Deref for Response<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}
