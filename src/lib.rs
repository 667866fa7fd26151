//! # Callward - resilient calls to rate-limited generative AI APIs
//!
//! Callward sits between your application and a remote model API. Every call goes
//! through the same pipeline, keyed by an *operation* name such as `"gemini_text"`:
//!
//! 1. a sliding-window [`RateLimiter`](rate_limit::RateLimiter) admits or rejects it,
//! 2. a [`CircuitBreaker`](circuit_breaker::CircuitBreaker) short-circuits it while the
//!    operation is failing,
//! 3. a [`RetryExecutor`] runs it with jittered exponential backoff, retrying only what
//!    the [`Classifier`] says is transient,
//! 4. response validators turn the decoded payload into text, bytes or JSON, or into a
//!    typed anomaly (empty, filtered, malformed) that is retried like any other
//!    transient failure.
//!
//! Each operation key has its own limiter window and circuit; keys never interfere.
//!
//! ## Quick Start
//!
//! ```no_run
//! use callward::{CallContext, GeminiClient};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), callward::Error> {
//!     let client = GeminiClient::from_api_key(std::env::var("GEMINI_API_KEY").unwrap_or_default())?;
//!
//!     let ctx = CallContext::new().with_timeout(Duration::from_secs(60));
//!     let response = client.generate_text(&ctx, "Name three warm paint colours").await?;
//!     println!("{}", response.data);
//!     println!("Took {:?} over {} attempt(s)", response.latency, response.attempts);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Bring your own transport
//!
//! [`ResilientCaller`] is transport-agnostic: any async closure can be guarded.
//!
//! ```no_run
//! use callward::{CallContext, Error, ResilientCaller};
//!
//! # async fn fetch() -> Result<String, Error> { Ok(String::new()) }
//! # async fn example() -> Result<(), Error> {
//! let caller = ResilientCaller::builder().build()?;
//!
//! let response = caller
//!     .execute_validated("gemini_text", &CallContext::new(), |_attempt| fetch())
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! Errors keep their cause and classification:
//!
//! ```no_run
//! use callward::{CallContext, Error, GeminiClient};
//!
//! # async fn example() -> Result<(), Error> {
//! # let client = GeminiClient::from_api_key("key")?;
//! match client.generate_text(&CallContext::new(), "Hello").await {
//!     Ok(response) => println!("{}", response.data),
//!     Err(Error::RateLimited { retry_after, .. }) => {
//!         eprintln!("Slow down, try again in {:?}", retry_after);
//!     }
//!     Err(Error::CircuitOpen { retry_after, .. }) => {
//!         eprintln!("Service unavailable, next probe in {:?}", retry_after);
//!     }
//!     Err(Error::MaxRetriesExceeded { attempts, last_error }) => {
//!         eprintln!("Gave up after {} attempts: {}", attempts, last_error);
//!     }
//!     Err(e) => eprintln!("Failed ({}): {}", e.classification(), e),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! Defaults can be overridden in code through [`ResilientCallerBuilder`] or from the
//! environment with [`ResilienceConfig::from_env`].
//!
//! ## Examples
//!
//! Runnable samples live in `demos/` and are registered as cargo examples, e.g.
//! `cargo run --example basic_call`.

pub mod audit;
pub mod caller;
pub mod circuit_breaker;
pub mod classify;
pub mod client;
pub mod config;
pub mod context;
mod error;
pub mod operation;
pub mod rate_limit;
mod response;
pub mod retry;
pub mod transport;
pub mod validate;

pub use caller::{ResilientCaller, ResilientCallerBuilder};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use classify::{Classifier, DefaultClassifier, ErrorClassification};
pub use client::GeminiClient;
pub use config::ResilienceConfig;
pub use context::CallContext;
pub use error::{Error, Result};
pub use operation::OperationKind;
pub use rate_limit::{RateLimitRule, RateLimiter};
pub use response::{Response, RetryAttempt};
pub use retry::{RetryExecutor, RetryPolicy};
