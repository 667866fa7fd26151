//! Per-operation circuit breaker.
//!
//! ```text
//! Closed ──[failure_threshold failures]──> Open
//!   ▲                                        │
//!   │                                        │ [reset_timeout elapses]
//!   │                                        ▼
//!   └────────[probe succeeds]────────── HalfOpen
//!            [probe fails] ──────────────> Open
//! ```
//!
//! Each operation key has its own state, created on first use. While open, calls fail
//! fast with [`Error::CircuitOpen`]. Once the reset timeout has elapsed a single probe
//! is let through; its outcome closes or re-opens the circuit.

use crate::{Error, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a probe is allowed.
    pub reset_timeout: Duration,
    /// Wall-clock limit applied to each attempt let through the breaker.
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(15 * 60),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Sets the failure threshold.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the reset timeout.
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Sets the per-attempt call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::ConfigurationError(
                "circuit failure threshold must be at least 1".to_string(),
            ));
        }
        if self.call_timeout.is_zero() {
            return Err(Error::ConfigurationError(
                "circuit call timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Current state of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Calls flow through.
    Closed,
    /// Calls are rejected without being attempted.
    Open,
    /// One probe call is allowed to test recovery.
    HalfOpen,
}

impl CircuitState {
    /// A short, stable label for logs and audit records.
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
}

impl Default for Circuit {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            probe_in_flight: false,
        }
    }
}

fn lock(circuit: &Mutex<Circuit>) -> MutexGuard<'_, Circuit> {
    circuit.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry of circuits, one per operation key.
///
/// # Examples
///
/// ```
/// use callward::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
/// use callward::Error;
///
/// # async fn example() {
/// let breaker = CircuitBreaker::new(CircuitBreakerConfig::default().with_failure_threshold(2));
///
/// for _ in 0..2 {
///     let _ = breaker
///         .execute("gemini_text", || async { Err::<(), _>(Error::Timeout) })
///         .await;
/// }
/// assert_eq!(breaker.state("gemini_text"), CircuitState::Open);
///
/// let result = breaker.execute("gemini_text", || async { Ok::<_, Error>(()) }).await;
/// assert!(matches!(result, Err(Error::CircuitOpen { .. })));
/// # }
/// ```
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuits: Mutex<HashMap<String, Arc<Mutex<Circuit>>>>,
}

impl CircuitBreaker {
    /// Creates a breaker applying `config` to every key.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the breaker configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn circuit(&self, key: &str) -> Arc<Mutex<Circuit>> {
        let mut circuits = self.circuits.lock().unwrap_or_else(PoisonError::into_inner);
        circuits.entry(key.to_string()).or_default().clone()
    }

    /// Returns the current state of `key`'s circuit.
    ///
    /// An open circuit whose reset timeout has elapsed still reports `Open` until the
    /// next call moves it to `HalfOpen`.
    pub fn state(&self, key: &str) -> CircuitState {
        lock(&self.circuit(key)).state
    }

    /// Returns the consecutive failure count for `key`.
    pub fn failure_count(&self, key: &str) -> u32 {
        lock(&self.circuit(key)).failure_count
    }

    /// Asks for permission to call `key`.
    ///
    /// The returned permit must be resolved with [`CircuitPermit::success`] or
    /// [`CircuitPermit::failure`]. Dropping it unresolved (for example when the call is
    /// cancelled) records nothing and frees the half-open probe slot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CircuitOpen`] if the circuit is open and the reset timeout has
    /// not elapsed, or if it is half-open with a probe already in flight.
    pub fn acquire(&self, key: &str) -> Result<CircuitPermit> {
        let circuit = self.circuit(key);
        let probe = {
            let mut guard = lock(&circuit);
            match guard.state {
                CircuitState::Closed => false,
                CircuitState::Open => {
                    let elapsed = guard
                        .last_failure
                        .map(|at| at.elapsed())
                        .unwrap_or(self.config.reset_timeout);
                    if elapsed < self.config.reset_timeout {
                        return Err(Error::CircuitOpen {
                            operation: key.to_string(),
                            retry_after: self.config.reset_timeout - elapsed,
                        });
                    }
                    guard.state = CircuitState::HalfOpen;
                    guard.probe_in_flight = true;
                    tracing::info!(operation = key, "Circuit half-open, allowing probe");
                    true
                }
                CircuitState::HalfOpen => {
                    if guard.probe_in_flight {
                        return Err(Error::CircuitOpen {
                            operation: key.to_string(),
                            retry_after: Duration::ZERO,
                        });
                    }
                    guard.probe_in_flight = true;
                    true
                }
            }
        };

        Ok(CircuitPermit {
            key: key.to_string(),
            circuit,
            failure_threshold: self.config.failure_threshold,
            probe,
            resolved: false,
        })
    }

    /// Runs `fut` under `call_timeout`, mapping an elapsed timer to [`Error::Timeout`].
    pub async fn guard_attempt<Fut, T>(&self, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.config.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Runs `f` through `key`'s circuit.
    ///
    /// The call is rejected without invoking `f` while the circuit is open. Otherwise
    /// `f` runs under the configured call timeout and its outcome is recorded. A
    /// [`Error::Cancelled`] outcome is not counted as a failure.
    pub async fn execute<F, Fut, T>(&self, key: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.acquire(key)?;
        let result = self.guard_attempt(f()).await;
        match &result {
            Ok(_) => permit.success(),
            Err(Error::Cancelled) => drop(permit),
            Err(_) => permit.failure(),
        }
        result
    }

    /// Forces `key`'s circuit closed and clears its counters.
    pub fn reset(&self, key: &str) {
        let circuit = self.circuit(key);
        let mut guard = lock(&circuit);
        let previous = guard.state;
        *guard = Circuit::default();
        tracing::info!(operation = key, previous = %previous, "Circuit reset");
    }

    /// Forces every circuit closed.
    pub fn reset_all(&self) {
        let circuits = self.circuits.lock().unwrap_or_else(PoisonError::into_inner);
        for (key, circuit) in circuits.iter() {
            *lock(circuit) = Circuit::default();
            tracing::info!(operation = %key, "Circuit reset");
        }
    }
}

/// Permission to make one call through a circuit.
#[derive(Debug)]
pub struct CircuitPermit {
    key: String,
    circuit: Arc<Mutex<Circuit>>,
    failure_threshold: u32,
    probe: bool,
    resolved: bool,
}

impl CircuitPermit {
    /// Returns `true` if this permit is the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Returns the state of the circuit this permit belongs to.
    pub fn state(&self) -> CircuitState {
        lock(&self.circuit).state
    }

    /// Records a successful call. A successful probe closes the circuit.
    pub fn success(mut self) {
        self.resolved = true;
        let mut guard = lock(&self.circuit);
        match guard.state {
            CircuitState::Closed => guard.failure_count = 0,
            CircuitState::HalfOpen if self.probe => {
                guard.state = CircuitState::Closed;
                guard.failure_count = 0;
                guard.probe_in_flight = false;
                tracing::info!(operation = %self.key, "Circuit closed after successful probe");
            }
            // A call admitted before the circuit tripped cannot close it; only the probe can.
            _ => {}
        }
    }

    /// Records a failed call, opening the circuit if the threshold is reached or if this
    /// was the half-open probe.
    pub fn failure(mut self) {
        self.resolved = true;
        let mut guard = lock(&self.circuit);
        guard.failure_count = guard.failure_count.saturating_add(1);
        guard.last_failure = Some(Instant::now());
        if self.probe {
            guard.probe_in_flight = false;
        }

        let trip = match guard.state {
            CircuitState::HalfOpen => self.probe || guard.failure_count >= self.failure_threshold,
            CircuitState::Closed => guard.failure_count >= self.failure_threshold,
            // Reset timer restarts on any late failure.
            CircuitState::Open => false,
        };
        if trip {
            tracing::warn!(
                operation = %self.key,
                failure_count = guard.failure_count,
                from = %guard.state,
                "Circuit opened"
            );
            guard.state = CircuitState::Open;
        } else {
            tracing::debug!(
                operation = %self.key,
                failure_count = guard.failure_count,
                "Circuit failure recorded"
            );
        }
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if !self.resolved && self.probe {
            lock(&self.circuit).probe_in_flight = false;
        }
    }
}
