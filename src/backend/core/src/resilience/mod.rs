//! Failure isolation and cross-process coordination.

pub mod circuit_breaker;
pub mod lock;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState};
pub use lock::{generate_token, DistributedLock, LockConfig};
