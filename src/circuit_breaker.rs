//! Per-resource circuit breaker.
//!
//! A breaker starts `Closed` and lets calls through. Enough consecutive
//! failures, or a high enough failure rate once `min_requests` calls have
//! completed, trip it `Open`: calls are rejected without running until
//! `reset_timeout` has passed. The next call then moves it to `HalfOpen` and
//! runs as a probe. A failing probe reopens the breaker; `success_threshold`
//! consecutive successful probes close it again.

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::OperationError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed breaker.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the breaker.
    pub success_threshold: u32,
    #[serde(with = "crate::config::duration_secs")]
    pub reset_timeout: Duration,
    /// Failure ratio in `0.0..=1.0` that opens the breaker once
    /// `min_requests` calls have completed.
    pub failure_rate_threshold: f64,
    pub min_requests: u64,
    /// Probes allowed in flight at once while half-open.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(60),
            failure_rate_threshold: 0.5,
            min_requests: 10,
            half_open_max_calls: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cumulative counters, kept across state transitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitStats {
    /// Admitted calls, including ones still in flight.
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rejected_requests: u64,
    pub last_success_time: Option<DateTime<Utc>>,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub state_changes: u64,
}

impl CircuitStats {
    /// Calls that have finished, successfully or not.
    pub fn completed_requests(&self) -> u64 {
        self.successful_requests + self.failed_requests
    }

    /// Failed share of completed calls.
    pub fn failure_rate(&self) -> f64 {
        match self.completed_requests() {
            0 => 0.0,
            completed => self.failed_requests as f64 / completed as f64,
        }
    }

    pub fn success_rate(&self) -> f64 {
        match self.completed_requests() {
            0 => 0.0,
            completed => self.successful_requests as f64 / completed as f64,
        }
    }

    fn count(&mut self, success: bool) {
        if success {
            self.successful_requests += 1;
            self.last_success_time = Some(Utc::now());
        } else {
            self.failed_requests += 1;
            self.last_failure_time = Some(Utc::now());
        }
    }
}

/// Point-in-time view of a breaker, returned by
/// [`CircuitBreaker::get_statistics`].
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub stats: CircuitStats,
    pub failure_rate: f64,
    pub success_rate: f64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub state_changed_at: DateTime<Utc>,
    #[serde(with = "crate::config::duration_secs")]
    pub time_in_state: Duration,
    pub config: CircuitBreakerConfig,
}

/// Returned instead of running the operation while the breaker is open.
#[derive(Error, Debug, Clone)]
#[error("Circuit breaker '{name}' is open; retry after {retry_after:?}")]
pub struct CircuitOpenError {
    pub name: String,
    pub retry_after: Duration,
}

#[derive(Error, Debug)]
pub enum CircuitError<E> {
    /// The operation was not attempted.
    #[error("{0}")]
    Open(#[source] CircuitOpenError),
    /// The operation ran and failed; its error is passed through unchanged.
    #[error("{0}")]
    Operation(#[source] E),
}

impl<E> CircuitError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open(_))
    }

    pub fn into_operation_error(self) -> Option<E> {
        match self {
            Self::Operation(err) => Some(err),
            Self::Open(_) => None,
        }
    }
}

impl From<CircuitError<OperationError>> for OperationError {
    fn from(err: CircuitError<OperationError>) -> Self {
        match err {
            CircuitError::Open(open) => OperationError::CircuitOpen(open),
            CircuitError::Operation(inner) => inner,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    stats: CircuitStats,
    state_changed_at: Instant,
    state_changed_wall: DateTime<Utc>,
    half_open_in_flight: u32,
    // Bumped on every transition so stale probe permits don't release
    // slots belonging to a later half-open period.
    generation: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            stats: CircuitStats::default(),
            state_changed_at: Instant::now(),
            state_changed_wall: Utc::now(),
            half_open_in_flight: 0,
            generation: 0,
        }
    }
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

/// Admission for one call. Releases the half-open probe slot on drop, which
/// also covers calls whose future is dropped mid-flight.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    generation: u64,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.probe {
            let mut inner = self.breaker.inner.lock();
            if inner.generation == self.generation {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            }
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Runs `operation` if the breaker admits the call. The operation's own
    /// error is returned as [`CircuitError::Operation`] after bookkeeping; a
    /// rejected call returns [`CircuitError::Open`] without running it.
    ///
    /// A call that finishes after the breaker has changed state since it was
    /// admitted only updates the counters; it cannot move the state.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.acquire().map_err(CircuitError::Open)?;

        let result = operation().await;
        {
            let mut inner = self.inner.lock();
            if inner.generation != permit.generation {
                inner.stats.count(result.is_ok());
                debug!(breaker = %self.name, success = result.is_ok(), "Outcome from an earlier state");
            } else if result.is_ok() {
                self.on_success(&mut inner);
            } else {
                self.on_failure(&mut inner);
            }
        }
        drop(permit);

        result.map_err(CircuitError::Operation)
    }

    /// Whether a call made now would be admitted. Does not change state.
    pub fn is_call_permitted(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => inner.state_changed_at.elapsed() >= self.config.reset_timeout,
            CircuitState::HalfOpen => {
                inner.half_open_in_flight < self.config.half_open_max_calls.max(1)
            }
        }
    }

    /// Records a successful call made without going through [`call`](Self::call).
    /// Admission applies as for `call`: while open the record only counts as
    /// rejected, and once `reset_timeout` has passed it is taken as a probe.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if self.admit_record(&mut inner) {
            self.on_success(&mut inner);
        }
    }

    /// Records a failed call made without going through [`call`](Self::call).
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        if self.admit_record(&mut inner) {
            self.on_failure(&mut inner);
        }
    }

    fn admit_record(&self, inner: &mut BreakerState) -> bool {
        if inner.state == CircuitState::Open {
            if inner.state_changed_at.elapsed() < self.config.reset_timeout {
                inner.stats.rejected_requests += 1;
                debug!(breaker = %self.name, "Circuit open, ignoring recorded outcome");
                return false;
            }
            self.transition(inner, CircuitState::HalfOpen);
        }
        inner.stats.total_requests += 1;
        true
    }

    pub fn get_statistics(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            stats: inner.stats.clone(),
            failure_rate: inner.stats.failure_rate(),
            success_rate: inner.stats.success_rate(),
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            state_changed_at: inner.state_changed_wall,
            time_in_state: inner.state_changed_at.elapsed(),
            config: self.config.clone(),
        }
    }

    /// Forces the breaker closed and clears all counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let generation = inner.generation + 1;
        *inner = BreakerState::new();
        inner.generation = generation;
        info!(breaker = %self.name, "Circuit breaker reset");
    }

    fn acquire(&self) -> Result<Permit<'_>, CircuitOpenError> {
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open {
            let elapsed = inner.state_changed_at.elapsed();
            if elapsed < self.config.reset_timeout {
                inner.stats.rejected_requests += 1;
                debug!(breaker = %self.name, "Circuit open, rejecting call");
                return Err(CircuitOpenError {
                    name: self.name.clone(),
                    retry_after: self.config.reset_timeout - elapsed,
                });
            }
            self.transition(&mut inner, CircuitState::HalfOpen);
        }

        let probe = inner.state == CircuitState::HalfOpen;
        if probe {
            if inner.half_open_in_flight >= self.config.half_open_max_calls.max(1) {
                inner.stats.rejected_requests += 1;
                return Err(CircuitOpenError {
                    name: self.name.clone(),
                    retry_after: Duration::ZERO,
                });
            }
            inner.half_open_in_flight += 1;
        }

        inner.stats.total_requests += 1;
        Ok(Permit {
            breaker: self,
            probe,
            generation: inner.generation,
        })
    }

    fn on_success(&self, inner: &mut BreakerState) {
        inner.stats.count(true);
        inner.consecutive_failures = 0;
        inner.consecutive_successes += 1;

        if inner.state == CircuitState::HalfOpen
            && inner.consecutive_successes >= self.config.success_threshold
        {
            self.transition(inner, CircuitState::Closed);
        }
    }

    fn on_failure(&self, inner: &mut BreakerState) {
        inner.stats.count(false);
        inner.consecutive_successes = 0;
        inner.consecutive_failures += 1;

        match inner.state {
            CircuitState::Closed => {
                let rate_tripped = inner.stats.completed_requests() >= self.config.min_requests
                    && inner.stats.failure_rate() >= self.config.failure_rate_threshold;
                if inner.consecutive_failures >= self.config.failure_threshold || rate_tripped {
                    warn!(
                        breaker = %self.name,
                        consecutive_failures = inner.consecutive_failures,
                        failure_rate = inner.stats.failure_rate(),
                        "Circuit breaker tripped"
                    );
                    self.transition(inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => self.transition(inner, CircuitState::Open),
            CircuitState::Open => {}
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        if inner.state == to {
            return;
        }
        info!(breaker = %self.name, from = %inner.state, to = %to, "Circuit breaker state change");
        inner.state = to;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.half_open_in_flight = 0;
        inner.generation += 1;
        inner.stats.state_changes += 1;
        inner.state_changed_at = Instant::now();
        inner.state_changed_wall = Utc::now();
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}
