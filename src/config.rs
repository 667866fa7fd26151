//! Resilience configuration.
//!
//! All settings have defaults. They can be set in code through the
//! [`ResilientCallerBuilder`](crate::ResilientCallerBuilder) or read from the
//! environment with [`ResilienceConfig::from_env`].

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::operation::OperationKind;
use crate::rate_limit::RateLimitRule;
use crate::retry::RetryPolicy;
use crate::{Error, Result};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable for the attempt budget (first attempt included).
pub const ENV_MAX_RETRIES: &str = "CALLWARD_MAX_RETRIES";
/// Environment variable for the base backoff delay, in milliseconds.
pub const ENV_BASE_DELAY_MS: &str = "CALLWARD_BASE_DELAY_MS";
/// Environment variable for the maximum backoff delay, in milliseconds.
pub const ENV_MAX_DELAY_MS: &str = "CALLWARD_MAX_DELAY_MS";
/// Environment variable for the circuit failure threshold.
pub const ENV_FAILURE_THRESHOLD: &str = "CALLWARD_FAILURE_THRESHOLD";
/// Environment variable for the circuit reset timeout, in seconds.
pub const ENV_RESET_TIMEOUT_SECS: &str = "CALLWARD_RESET_TIMEOUT_SECS";
/// Environment variable for the per-attempt call timeout, in seconds.
pub const ENV_CALL_TIMEOUT_SECS: &str = "CALLWARD_CALL_TIMEOUT_SECS";

/// Everything the resilience core can be tuned with.
#[derive(Debug, Clone, PartialEq)]
pub struct ResilienceConfig {
    /// Retry policy applied to every operation.
    pub retry: RetryPolicy,
    /// Circuit breaker settings applied to every operation.
    pub circuit: CircuitBreakerConfig,
    /// Admission rules per operation key.
    pub rate_limits: HashMap<String, RateLimitRule>,
    /// Admission rule for keys without their own.
    pub default_rate_limit: RateLimitRule,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        let rate_limits = OperationKind::ALL
            .into_iter()
            .map(|kind| (kind.key().to_string(), kind.default_rate_limit()))
            .collect();
        Self {
            retry: RetryPolicy::default(),
            circuit: CircuitBreakerConfig::default(),
            rate_limits,
            default_rate_limit: RateLimitRule::default(),
        }
    }
}

impl ResilienceConfig {
    /// Reads overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationError`] if a variable is set but unparsable, or if
    /// the resulting configuration is invalid.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads overrides through `lookup`, which maps a variable name to its value.
    ///
    /// # Examples
    ///
    /// ```
    /// use callward::ResilienceConfig;
    /// use std::time::Duration;
    ///
    /// let config = ResilienceConfig::from_lookup(|name| match name {
    ///     "CALLWARD_MAX_RETRIES" => Some("5".to_string()),
    ///     "CALLWARD_RESET_TIMEOUT_SECS" => Some("600".to_string()),
    ///     _ => None,
    /// })
    /// .unwrap();
    ///
    /// assert_eq!(config.retry.max_attempts, 5);
    /// assert_eq!(config.circuit.reset_timeout, Duration::from_secs(600));
    /// ```
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(n) = parse_var::<usize, _>(&lookup, ENV_MAX_RETRIES)? {
            config.retry.max_attempts = n;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_BASE_DELAY_MS)? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_MAX_DELAY_MS)? {
            config.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var::<u32, _>(&lookup, ENV_FAILURE_THRESHOLD)? {
            config.circuit.failure_threshold = n;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, ENV_RESET_TIMEOUT_SECS)? {
            config.circuit.reset_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, ENV_CALL_TIMEOUT_SECS)? {
            config.circuit.call_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Sets the admission rule for `key`.
    pub fn with_rate_limit(mut self, key: impl Into<String>, rule: RateLimitRule) -> Self {
        self.rate_limits.insert(key.into(), rule);
        self
    }

    /// Checks that the settings are usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationError`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        self.circuit.validate()?;
        for (key, rule) in self
            .rate_limits
            .iter()
            .map(|(k, r)| (k.as_str(), r))
            .chain(std::iter::once(("<default>", &self.default_rate_limit)))
        {
            if rule.max_requests == 0 || rule.window.is_zero() {
                return Err(Error::ConfigurationError(format!(
                    "rate limit for '{key}' must admit at least one request per non-zero window"
                )));
            }
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|e| {
            Error::ConfigurationError(format!("{name}={raw:?} is not valid: {e}"))
        }),
    }
}
