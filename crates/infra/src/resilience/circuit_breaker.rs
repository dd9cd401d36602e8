//! Three-state circuit breaker guarding calls to an unhealthy dependency.
//!
//! State transitions:
//!
//! | from      | to        | trigger                                              |
//! |-----------|-----------|------------------------------------------------------|
//! | Closed    | Open      | `failure_threshold` consecutive failures             |
//! | Open      | Half-Open | next call after `timeout` since the last failure     |
//! | Half-Open | Closed    | `success_threshold` consecutive successes            |
//! | Half-Open | Open      | any failure                                          |
//!
//! The Open → Half-Open transition happens lazily on admission; there is no
//! background timer.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow through
    Closed,
    /// Requests fail fast
    Open,
    /// Probing whether the dependency recovered
    HalfOpen,
}

impl core::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Name used in logs and errors
    pub name: String,
    /// Consecutive failures (while closed) that open the circuit
    pub failure_threshold: u32,
    /// Consecutive successes (while half-open) that close the circuit
    pub success_threshold: u32,
    /// How long the circuit stays open before admitting a trial call
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "circuit-breaker".to_string(),
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// Rejected without invoking the operation.
    #[error("circuit breaker '{name}' is open")]
    Open { name: String },

    #[error(transparent)]
    Inner(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitBreakerError::Open { .. })
    }

    /// The operation's own error, if it ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            CircuitBreakerError::Inner(e) => Some(e),
            CircuitBreakerError::Open { .. } => None,
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failures: u32,
    pub successes: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_ms: u64,
    pub times_opened: u64,
    pub rejected: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_state_change_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    successes: u32,
    /// Monotonic clock for the open timeout.
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    last_state_change_at: Option<DateTime<Utc>>,
    times_opened: u64,
    rejected: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            last_failure: None,
            last_failure_at: None,
            last_success_at: None,
            last_state_change_at: None,
            times_opened: 0,
            rejected: 0,
        }
    }

    fn transition(&mut self, name: &str, to: CircuitState) {
        let from = self.state;
        if from == to {
            return;
        }

        self.state = to;
        self.last_state_change_at = Some(Utc::now());
        match to {
            CircuitState::Closed => {
                self.failures = 0;
                self.successes = 0;
            }
            CircuitState::HalfOpen => self.successes = 0,
            CircuitState::Open => self.times_opened += 1,
        }

        if to == CircuitState::Open {
            warn!(breaker = %name, %from, %to, "circuit breaker state changed");
        } else {
            info!(breaker = %name, %from, %to, "circuit breaker state changed");
        }
    }
}

/// Thread-safe circuit breaker. All bookkeeping sits behind one mutex; the
/// guarded operation runs outside it.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `f` if the circuit admits it, recording its outcome.
    pub fn execute_with_result<T, E, F>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        self.admit()?;

        match f() {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }

    /// Convenience for operations with no result value.
    pub fn execute<E, F>(&self, f: F) -> Result<(), CircuitBreakerError<E>>
    where
        F: FnOnce() -> Result<(), E>,
    {
        self.execute_with_result(f)
    }

    /// Current state, after applying any pending Open → Half-Open transition.
    pub fn state(&self) -> CircuitState {
        let mut state = self.lock();
        self.maybe_half_open(&mut state);
        state.state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let state = self.lock();
        CircuitBreakerStats {
            name: self.config.name.clone(),
            state: state.state,
            failures: state.failures,
            successes: state.successes,
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            timeout_ms: self.config.timeout.as_millis() as u64,
            times_opened: state.times_opened,
            rejected: state.rejected,
            last_failure_at: state.last_failure_at,
            last_success_at: state.last_success_at,
            last_state_change_at: state.last_state_change_at,
        }
    }

    /// Open the circuit now. The timeout runs from this moment.
    pub fn force_open(&self) {
        let mut state = self.lock();
        state.last_failure = Some(Instant::now());
        state.transition(&self.config.name, CircuitState::Open);
    }

    pub fn force_close(&self) {
        self.lock().transition(&self.config.name, CircuitState::Closed);
    }

    /// Back to a freshly constructed breaker.
    pub fn reset(&self) {
        *self.lock() = BreakerState::new();
        info!(breaker = %self.config.name, "circuit breaker reset");
    }

    fn admit<E>(&self) -> Result<(), CircuitBreakerError<E>> {
        let mut state = self.lock();
        self.maybe_half_open(&mut state);

        if state.state == CircuitState::Open {
            state.rejected += 1;
            return Err(CircuitBreakerError::Open {
                name: self.config.name.clone(),
            });
        }
        Ok(())
    }

    fn maybe_half_open(&self, state: &mut BreakerState) {
        if state.state != CircuitState::Open {
            return;
        }
        let elapsed = state
            .last_failure
            .map_or(true, |at| at.elapsed() >= self.config.timeout);
        if elapsed {
            state.transition(&self.config.name, CircuitState::HalfOpen);
        }
    }

    fn on_success(&self) {
        let mut state = self.lock();
        state.last_success_at = Some(Utc::now());

        match state.state {
            CircuitState::Closed => state.failures = 0,
            CircuitState::HalfOpen => {
                state.successes += 1;
                if state.successes >= self.config.success_threshold {
                    state.transition(&self.config.name, CircuitState::Closed);
                }
            }
            // Admitted before a concurrent caller opened the circuit.
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut state = self.lock();
        state.last_failure = Some(Instant::now());
        state.last_failure_at = Some(Utc::now());

        match state.state {
            CircuitState::Closed => {
                state.failures += 1;
                if state.failures >= self.config.failure_threshold {
                    state.transition(&self.config.name, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                state.failures += 1;
                state.transition(&self.config.name, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::cell::Cell;

    fn breaker(failures: u32, successes: u32, timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig::default()
                .with_name("test")
                .with_failure_threshold(failures)
                .with_success_threshold(successes)
                .with_timeout(timeout),
        )
    }

    fn fail(cb: &CircuitBreaker) {
        let _ = cb.execute(|| Err::<(), _>("down"));
    }

    fn succeed(cb: &CircuitBreaker) {
        let _ = cb.execute(|| Ok::<(), &str>(()));
    }

    #[test]
    fn open_circuit_rejects_without_invoking() {
        let cb = breaker(2, 1, Duration::from_secs(60));
        fail(&cb);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);

        let calls = Cell::new(0);
        let result = cb.execute(|| {
            calls.set(calls.get() + 1);
            Ok::<(), &str>(())
        });

        assert!(result.unwrap_err().is_open());
        assert_eq!(calls.get(), 0);
        assert_eq!(cb.stats().rejected, 1);
    }

    #[test]
    fn success_while_closed_resets_failure_streak() {
        let cb = breaker(3, 1, Duration::from_secs(60));
        fail(&cb);
        fail(&cb);
        succeed(&cb);
        fail(&cb);
        fail(&cb);

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().failures, 2);
    }

    #[test]
    fn elapsed_timeout_admits_trial_call_and_closes_on_successes() {
        let cb = breaker(1, 2, Duration::ZERO);
        fail(&cb);
        assert_eq!(cb.stats().state, CircuitState::Open);

        succeed(&cb);
        assert_eq!(cb.stats().state, CircuitState::HalfOpen);
        assert_eq!(cb.stats().successes, 1);

        succeed(&cb);
        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!((stats.failures, stats.successes), (0, 0));
    }

    #[test]
    fn failure_while_half_open_reopens() {
        let cb = breaker(1, 5, Duration::ZERO);
        fail(&cb);
        succeed(&cb);
        assert_eq!(cb.stats().state, CircuitState::HalfOpen);

        fail(&cb);

        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::Open);
        assert_eq!(stats.times_opened, 2);
    }

    #[test]
    fn inner_error_is_passed_through() {
        let cb = breaker(5, 1, Duration::from_secs(1));
        let err = cb.execute(|| Err::<(), _>("broker down")).unwrap_err();
        assert_eq!(err.into_inner(), Some("broker down"));
    }

    #[test]
    fn force_open_then_reset() {
        let cb = breaker(5, 1, Duration::from_secs(60));
        cb.force_open();
        assert_eq!(cb.state(), CircuitState::Open);

        cb.force_close();
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.force_open();
        cb.reset();
        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.times_opened, 0);
        assert!(stats.last_state_change_at.is_none());
    }

    #[test]
    fn stats_serialize_state_in_snake_case() {
        let cb = breaker(1, 1, Duration::from_secs(60));
        fail(&cb);
        let json = serde_json::to_value(cb.stats()).unwrap();
        assert_eq!(json["state"], "open");
        assert_eq!(json["timeout_ms"], 60_000);
    }

    proptest! {
        #[test]
        fn opens_after_exactly_threshold_failures(threshold in 1u32..20) {
            let cb = breaker(threshold, 1, Duration::from_secs(60));
            for _ in 0..threshold - 1 {
                fail(&cb);
            }
            prop_assert_eq!(cb.state(), CircuitState::Closed);

            fail(&cb);
            prop_assert_eq!(cb.state(), CircuitState::Open);
        }

        #[test]
        fn closes_after_exactly_success_threshold(threshold in 1u32..10) {
            let cb = breaker(1, threshold, Duration::ZERO);
            fail(&cb);
            for _ in 0..threshold - 1 {
                succeed(&cb);
                prop_assert_eq!(cb.stats().state, CircuitState::HalfOpen);
            }

            succeed(&cb);
            prop_assert_eq!(cb.stats().state, CircuitState::Closed);
        }
    }
}
