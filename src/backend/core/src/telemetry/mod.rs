//! Telemetry: structured logging and Prometheus metrics.
//!
//! - **Logging**: JSON/pretty/compact `tracing` output with credential redaction
//! - **Metrics**: cache hit/miss counters, batch sizes, breaker state and
//!   Redis memory gauges exported through `metrics-exporter-prometheus`

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, redact_url, LogFormat, LoggingConfig};
pub use metrics::{init_metrics, BreakerStateValue, CacheMetrics, MetricsConfig, MetricsRegistry};

/// Initialize logging and metrics from the loaded settings.
pub fn init_telemetry(settings: &crate::config::Settings) -> anyhow::Result<MetricsRegistry> {
    init_logging(&settings.logging, &settings.redis.environment)?;
    init_metrics(&settings.metrics, &settings.redis.key_prefix)
}
