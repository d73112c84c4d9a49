//! Circuit breaker state machine tests.
//!
//! Tests cover:
//! - Closed -> Open after `threshold` consecutive failures
//! - Open -> HalfOpen after the recovery timeout
//! - HalfOpen -> Closed after `half_open_requests` successes
//! - HalfOpen -> Open on any failure
//! - Fallback routing and metrics
//! - Concurrent recording

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use technews_core::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use technews_core::{CoreError, ErrorCode};

fn fast_breaker(threshold: u32, half_open_requests: u32) -> CircuitBreaker {
    CircuitBreaker::with_config(
        "test",
        CircuitBreakerConfig {
            threshold,
            timeout: Duration::from_millis(20),
            half_open_requests,
        },
    )
}

fn wait_for_timeout() {
    thread::sleep(Duration::from_millis(40));
}

// ============================================================================
// Closed -> Open
// ============================================================================

#[test]
fn test_new_breaker_is_closed() {
    let breaker = CircuitBreaker::new(5);
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert!(breaker.can_execute());
}

#[test]
fn test_trips_after_threshold_failures() {
    let breaker = CircuitBreaker::new(3);

    breaker.record_failure();
    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Closed);

    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(!breaker.can_execute());
}

#[test]
fn test_success_resets_consecutive_failures() {
    let breaker = CircuitBreaker::new(3);
    breaker.record_failure();
    breaker.record_failure();
    breaker.record_success();

    breaker.record_failure();
    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Closed);

    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);
}

#[test]
fn test_alternating_results_never_trip() {
    let breaker = CircuitBreaker::new(2);
    for _ in 0..50 {
        breaker.record_failure();
        breaker.record_success();
    }
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[test]
fn test_zero_threshold_is_treated_as_one() {
    let breaker = CircuitBreaker::new(0);
    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);
}

// ============================================================================
// Open -> HalfOpen -> Closed / Open
// ============================================================================

#[test]
fn test_stays_open_before_timeout() {
    let breaker = CircuitBreaker::new(1).with_recovery_timeout(Duration::from_secs(60));
    breaker.record_failure();
    for _ in 0..10 {
        assert!(!breaker.can_execute());
    }
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(breaker.retry_after() > Duration::from_secs(50));
}

#[test]
fn test_half_open_after_timeout() {
    let breaker = fast_breaker(1, 3);
    breaker.record_failure();
    wait_for_timeout();

    assert!(breaker.can_execute());
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    assert_eq!(breaker.retry_after(), Duration::ZERO);
}

#[test]
fn test_half_open_closes_after_required_successes() {
    let breaker = fast_breaker(1, 3);
    breaker.record_failure();
    wait_for_timeout();
    assert!(breaker.can_execute());

    breaker.record_success();
    breaker.record_success();
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    breaker.record_success();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.metrics().failure_count, 0);
}

#[test]
fn test_half_open_failure_reopens() {
    let breaker = fast_breaker(1, 3);
    breaker.record_failure();
    wait_for_timeout();
    assert!(breaker.can_execute());

    breaker.record_success();
    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(!breaker.can_execute());
}

#[test]
fn test_multiple_recovery_attempts() {
    let breaker = fast_breaker(1, 1);
    breaker.record_failure();

    for _ in 0..3 {
        wait_for_timeout();
        assert!(breaker.can_execute());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    wait_for_timeout();
    assert!(breaker.can_execute());
    breaker.record_success();
    assert_eq!(breaker.state(), CircuitState::Closed);
}

// ============================================================================
// Execute / fallback
// ============================================================================

#[tokio::test]
async fn test_open_breaker_uses_fallback_without_calling_operation() {
    let breaker = fast_breaker(2, 1);
    let calls = AtomicUsize::new(0);

    for _ in 0..2 {
        let value = breaker
            .execute_with_fallback(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<&str, _>(CoreError::internal("redis down"))
                },
                || async { Ok("fallback") },
            )
            .await
            .unwrap();
        assert_eq!(value, "fallback");
    }
    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let value = breaker
        .execute_with_fallback(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("primary")
            },
            || async { Ok("fallback") },
        )
        .await
        .unwrap();
    assert_eq!(value, "fallback");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(breaker.metrics().total_rejections, 1);
}

#[tokio::test]
async fn test_execute_without_fallback_reports_circuit_open() {
    let breaker = fast_breaker(1, 1);
    let err = breaker
        .execute(|| async { Err::<(), _>(CoreError::internal("boom")) })
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InternalError);

    let err = breaker.execute(|| async { Ok(()) }).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::CircuitOpen);
}

#[tokio::test]
async fn test_probe_after_timeout_closes_circuit() {
    let breaker = fast_breaker(1, 1);
    let _ = breaker
        .execute(|| async { Err::<(), _>(CoreError::internal("boom")) })
        .await;
    tokio::time::sleep(Duration::from_millis(40)).await;

    let value = breaker.execute(|| async { Ok(5) }).await.unwrap();
    assert_eq!(value, 5);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

// ============================================================================
// Reset and metrics
// ============================================================================

#[test]
fn test_reset_from_open() {
    let breaker = CircuitBreaker::new(1);
    breaker.record_failure();
    breaker.reset();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert!(breaker.can_execute());
}

#[test]
fn test_metrics_track_totals() {
    let breaker = CircuitBreaker::new(5);
    for _ in 0..3 {
        breaker.record_success();
    }
    breaker.record_failure();
    breaker.record_failure();

    let metrics = breaker.metrics();
    assert_eq!(metrics.total_successes, 3);
    assert_eq!(metrics.total_failures, 2);
    assert_eq!(metrics.failure_count, 2);
    assert_eq!(metrics.failure_threshold, 5);
    assert_eq!(metrics.state, CircuitState::Closed);
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_failures_trip_once() {
    let breaker = Arc::new(CircuitBreaker::new(10));
    let handles: Vec<_> = (0..10)
        .map(|_| {
            let breaker = Arc::clone(&breaker);
            thread::spawn(move || {
                for _ in 0..10 {
                    breaker.record_failure();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let metrics = breaker.metrics();
    assert_eq!(metrics.total_failures, 100);
    assert_eq!(metrics.state, CircuitState::Open);
}

#[test]
fn test_concurrent_successes_keep_closed() {
    let breaker = Arc::new(CircuitBreaker::new(3));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let breaker = Arc::clone(&breaker);
            thread::spawn(move || {
                for _ in 0..25 {
                    breaker.record_success();
                    assert!(breaker.can_execute());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(breaker.metrics().total_successes, 100);
    assert_eq!(breaker.state(), CircuitState::Closed);
}
