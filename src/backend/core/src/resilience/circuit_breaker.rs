//! Circuit breaker for Redis failure isolation.
//!
//! Stops calling a failing dependency for a cooldown period and probes
//! recovery with a bounded number of successes before closing again.

use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::config::CircuitBreakerSettings;
use crate::error::{CoreError, Result};
use crate::telemetry::{BreakerStateValue, CacheMetrics};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - requests allowed
    Closed,
    /// Too many failures - requests short-circuited
    Open,
    /// Probing recovery - requests allowed, one failure re-opens
    HalfOpen,
}

impl From<CircuitState> for BreakerStateValue {
    fn from(state: CircuitState) -> Self {
        match state {
            CircuitState::Closed => BreakerStateValue::Closed,
            CircuitState::Open => BreakerStateValue::Open,
            CircuitState::HalfOpen => BreakerStateValue::HalfOpen,
        }
    }
}

/// Thresholds for a [`CircuitBreaker`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker
    pub threshold: u32,
    /// Time spent open before probing
    pub timeout: Duration,
    /// Consecutive half-open successes needed to close
    pub half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            timeout: Duration::from_secs(60),
            half_open_requests: 3,
        }
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            threshold: settings.threshold.max(1),
            timeout: settings.timeout,
            half_open_requests: settings.half_open_requests.max(1),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
}

/// Circuit breaker for failure detection and recovery.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a breaker with the given failure threshold and default timings.
    pub fn new(threshold: u32) -> Self {
        Self::with_config(
            "default",
            CircuitBreakerConfig {
                threshold: threshold.max(1),
                ..Default::default()
            },
        )
    }

    pub fn with_config(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
            }),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        }
    }

    /// Create with custom recovery timeout.
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Create with a custom number of half-open successes.
    pub fn with_half_open_requests(mut self, requests: u32) -> Self {
        self.config.half_open_requests = requests.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if execution is allowed, moving OPEN to HALF_OPEN once the
    /// timeout has elapsed.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure_time
                    .map_or(Duration::MAX, |at| at.elapsed());
                if elapsed >= self.config.timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    drop(inner);
                    self.publish(CircuitState::HalfOpen);
                    tracing::info!(breaker = %self.name, "Circuit breaker transitioning to half-open");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful execution.
    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.half_open_requests {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.last_failure_time = None;
                    drop(inner);
                    self.publish(CircuitState::Closed);
                    tracing::info!(breaker = %self.name, "Circuit breaker closed after successful recovery");
                }
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed execution.
    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.success_count = 0;
                inner.last_failure_time = Some(Instant::now());
                drop(inner);
                self.trip();
                tracing::warn!(breaker = %self.name, "Circuit breaker re-opened after failed recovery attempt");
            }
            CircuitState::Closed => {
                inner.failure_count += 1;
                let failures = inner.failure_count;
                if failures >= self.config.threshold {
                    inner.state = CircuitState::Open;
                    inner.last_failure_time = Some(Instant::now());
                    drop(inner);
                    self.trip();
                    tracing::warn!(
                        breaker = %self.name,
                        failures,
                        threshold = self.config.threshold,
                        "Circuit breaker opened due to consecutive failures"
                    );
                }
            }
            CircuitState::Open => {
                inner.last_failure_time = Some(Instant::now());
            }
        }
    }

    /// Run `operation` through the breaker.
    ///
    /// Fails with `CircuitOpen` without calling `operation` while open.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.can_execute() {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            return Err(CoreError::circuit_open(&self.name, self.retry_after()));
        }
        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    /// Run `operation` through the breaker, answering from `fallback` when
    /// the circuit is open or the operation fails.
    pub async fn execute_with_fallback<T, F, Fut, FB, FutB>(&self, operation: F, fallback: FB) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        FB: FnOnce() -> FutB,
        FutB: Future<Output = Result<T>>,
    {
        match self.execute(operation).await {
            Ok(value) => Ok(value),
            Err(e) => {
                tracing::debug!(breaker = %self.name, error = %e, "Serving fallback");
                fallback().await
            }
        }
    }

    /// Get current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Time left before an open breaker lets a probe through.
    pub fn retry_after(&self) -> Duration {
        let inner = self.inner.lock();
        match (inner.state, inner.last_failure_time) {
            (CircuitState::Open, Some(at)) => self.config.timeout.saturating_sub(at.elapsed()),
            _ => Duration::ZERO,
        }
    }

    /// Get metrics.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            failure_threshold: self.config.threshold,
            half_open_requests: self.config.half_open_requests,
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }

    /// Force reset the circuit breaker.
    pub fn reset(&self) {
        {
            let mut inner = self.inner.lock();
            inner.state = CircuitState::Closed;
            inner.failure_count = 0;
            inner.success_count = 0;
            inner.last_failure_time = None;
        }
        self.publish(CircuitState::Closed);
        tracing::info!(breaker = %self.name, "Circuit breaker manually reset");
    }

    fn trip(&self) {
        CacheMetrics::record_breaker_trip(&self.name);
        self.publish(CircuitState::Open);
    }

    fn publish(&self, state: CircuitState) {
        CacheMetrics::record_breaker_state(&self.name, state.into());
    }
}

/// Metrics for the circuit breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub failure_threshold: u32,
    pub half_open_requests: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
}
