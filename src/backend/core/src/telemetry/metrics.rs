//! Prometheus metrics for the cache and batch layers.
//!
//! Every helper here is a thin wrapper over the `metrics` macros so call
//! sites stay one line. Without an installed recorder the macros are no-ops,
//! which is what unit tests rely on.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Address of the Prometheus scrape endpoint
    #[serde(default = "default_metrics_endpoint")]
    pub endpoint: String,

    /// Serve `endpoint` over HTTP; otherwise metrics are only rendered on demand
    #[serde(default)]
    pub serve_http: bool,

    /// Histogram buckets for durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: BTreeMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            endpoint: default_metrics_endpoint(),
            serve_http: false,
            duration_buckets: default_duration_buckets(),
            global_labels: BTreeMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_endpoint() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
}

/// Handle to the installed recorder, if any.
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// A registry with no recorder installed.
    pub fn disabled() -> Self {
        Self {
            prometheus_handle: None,
        }
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Initialize the metrics subsystem.
///
/// With `serve_http` the exporter also spawns its scrape listener, which
/// needs a running Tokio runtime.
///
/// # Errors
///
/// Returns an error if the buckets or endpoint are invalid, or if a global
/// recorder is already installed.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let mut builder = PrometheusBuilder::new().add_global_label("service", service_name);
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }
    builder = builder.set_buckets(&config.duration_buckets)?;

    let handle = if config.serve_http {
        let addr: SocketAddr = config.endpoint.parse()?;
        let (recorder, exporter) = builder.with_http_listener(addr).build()?;
        let handle = recorder.handle();
        metrics::set_global_recorder(recorder)
            .map_err(|e| anyhow::anyhow!("failed to install metrics recorder: {e}"))?;
        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::warn!("Prometheus exporter stopped");
            }
        });
        handle
    } else {
        builder.install_recorder()?
    };

    register_metric_descriptions();

    tracing::info!(
        service_name = %service_name,
        endpoint = %config.endpoint,
        serve_http = config.serve_http,
        "Metrics initialized"
    );

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

fn register_metric_descriptions() {
    describe_counter!("technews_cache_hits_total", "Cache hits by layer and domain");
    describe_counter!("technews_cache_misses_total", "Cache misses by layer and domain");
    describe_counter!("technews_cache_errors_total", "Swallowed cache store errors");
    describe_counter!("technews_cache_evictions_total", "Memory cache LRU evictions");
    describe_gauge!("technews_memory_cache_entries", "Entries held by the memory cache");

    describe_histogram!("technews_batch_load_duration_seconds", "Two-layer batch load duration");
    describe_counter!("technews_batch_db_fetches_total", "Keys fetched from the database");
    describe_gauge!("technews_batch_size", "Current optimizer batch size by query kind");
    describe_counter!("technews_batch_adjustments_total", "Optimizer batch size changes");

    describe_gauge!(
        "technews_circuit_breaker_state",
        "Circuit breaker state (0=closed, 1=half-open, 2=open)"
    );
    describe_counter!("technews_circuit_breaker_trips_total", "Circuit breaker trips");

    describe_counter!("technews_lock_acquired_total", "Distributed locks acquired");
    describe_counter!("technews_lock_contended_total", "Lock attempts that found the key held");
    describe_counter!("technews_stampede_fallbacks_total", "Loads that bypassed the lock");

    describe_gauge!("technews_redis_memory_usage_percent", "Redis memory usage percentage");
    describe_counter!("technews_memory_optimizations_total", "Memory optimizer runs by level");
    describe_counter!("technews_warm_runs_total", "Cache warm runs by category and outcome");
    describe_counter!("technews_errors_total", "Errors by code and layer");
}

/// Circuit breaker state encoded for the state gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerStateValue {
    Closed,
    HalfOpen,
    Open,
}

/// Cache and batch metric helpers.
pub struct CacheMetrics;

impl CacheMetrics {
    pub fn record_hit(layer: &'static str, domain: &str) {
        counter!(
            "technews_cache_hits_total",
            "layer" => layer,
            "domain" => domain.to_string(),
        )
        .increment(1);
    }

    pub fn record_miss(layer: &'static str, domain: &str) {
        counter!(
            "technews_cache_misses_total",
            "layer" => layer,
            "domain" => domain.to_string(),
        )
        .increment(1);
    }

    pub fn record_hits(layer: &'static str, domain: &str, hits: u64, misses: u64) {
        if hits > 0 {
            counter!("technews_cache_hits_total", "layer" => layer, "domain" => domain.to_string())
                .increment(hits);
        }
        if misses > 0 {
            counter!("technews_cache_misses_total", "layer" => layer, "domain" => domain.to_string())
                .increment(misses);
        }
    }

    pub fn record_store_error(operation: &'static str) {
        counter!("technews_cache_errors_total", "operation" => operation).increment(1);
    }

    pub fn record_eviction() {
        counter!("technews_cache_evictions_total").increment(1);
    }

    pub fn set_memory_entries(count: usize) {
        gauge!("technews_memory_cache_entries").set(count as f64);
    }

    /// Record a finished two-layer batch load.
    pub fn record_batch_load(domain: &str, duration: Duration, db_fetched: usize) {
        histogram!(
            "technews_batch_load_duration_seconds",
            "domain" => domain.to_string(),
        )
        .record(duration.as_secs_f64());
        counter!(
            "technews_batch_db_fetches_total",
            "domain" => domain.to_string(),
        )
        .increment(db_fetched as u64);
    }

    pub fn set_batch_size(kind: &'static str, size: usize) {
        gauge!("technews_batch_size", "kind" => kind).set(size as f64);
    }

    pub fn record_batch_adjustment(kind: &'static str, direction: &'static str) {
        counter!(
            "technews_batch_adjustments_total",
            "kind" => kind,
            "direction" => direction,
        )
        .increment(1);
    }

    pub fn record_breaker_state(name: &str, state: BreakerStateValue) {
        let value = match state {
            BreakerStateValue::Closed => 0.0,
            BreakerStateValue::HalfOpen => 1.0,
            BreakerStateValue::Open => 2.0,
        };
        gauge!("technews_circuit_breaker_state", "breaker" => name.to_string()).set(value);
    }

    pub fn record_breaker_trip(name: &str) {
        counter!("technews_circuit_breaker_trips_total", "breaker" => name.to_string())
            .increment(1);
    }

    pub fn record_lock_acquired() {
        counter!("technews_lock_acquired_total").increment(1);
    }

    pub fn record_lock_contended() {
        counter!("technews_lock_contended_total").increment(1);
    }

    pub fn record_stampede_fallback(reason: &'static str) {
        counter!("technews_stampede_fallbacks_total", "reason" => reason).increment(1);
    }

    pub fn set_redis_memory_usage(percent: f64) {
        gauge!("technews_redis_memory_usage_percent").set(percent);
    }

    pub fn record_memory_optimization(level: &'static str) {
        counter!("technews_memory_optimizations_total", "level" => level).increment(1);
    }

    pub fn record_warm_run(category: &'static str, success: bool) {
        counter!(
            "technews_warm_runs_total",
            "category" => category,
            "outcome" => if success { "ok" } else { "error" },
        )
        .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_config_defaults() {
        let config = MetricsConfig::default();
        assert!(config.enabled);
        assert!(!config.serve_http);
        assert_eq!(config.endpoint, "0.0.0.0:9090");
        assert!(!config.duration_buckets.is_empty());
    }

    #[test]
    fn test_disabled_registry_renders_empty() {
        let registry = MetricsRegistry::disabled();
        assert!(registry.render().is_empty());
    }

    #[test]
    fn test_helpers_without_recorder_are_noops() {
        CacheMetrics::record_hit("memory", "article");
        CacheMetrics::record_hits("redis", "article", 3, 1);
        CacheMetrics::set_batch_size("article", 50);
        CacheMetrics::record_breaker_state("redis", BreakerStateValue::Open);
    }
}
