//! Configuration management.
//!
//! Settings are read from an optional TOML file and from environment
//! variables prefixed with `TECHNEWS` (`TECHNEWS__REDIS__URL`, ...).
//! `REDIS_URL` and `DATABASE_URL` are accepted as plain overrides because
//! the web tier already exports them.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::batch::optimizer::OptimizerConfig;
use crate::telemetry::{LoggingConfig, MetricsConfig};

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub redis: RedisSettings,

    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub memory_cache: MemoryCacheSettings,

    /// Per-domain TTL overrides
    #[serde(default)]
    pub ttl: TtlSettings,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,

    #[serde(default)]
    pub lock: LockSettings,

    #[serde(default)]
    pub stampede: StampedeSettings,

    #[serde(default)]
    pub batch: BatchSettings,

    #[serde(default)]
    pub warmer: WarmerSettings,

    #[serde(default)]
    pub memory_optimizer: MemoryOptimizerSettings,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisSettings {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Application key prefix (first segment of every key)
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Deployment environment (second segment of every key)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Timeout applied to every Redis command
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
            environment: default_environment(),
            command_timeout: default_command_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseSettings {
    /// PostgreSQL connection URL
    #[serde(default = "default_database_url")]
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemoryCacheSettings {
    #[serde(default = "default_memory_max_size")]
    pub max_size: usize,

    #[serde(default = "default_memory_ttl", with = "humantime_serde")]
    pub default_ttl: Duration,

    #[serde(default = "default_cleanup_interval", with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for MemoryCacheSettings {
    fn default() -> Self {
        Self {
            max_size: default_memory_max_size(),
            default_ttl: default_memory_ttl(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

/// Optional TTL overrides; unset fields fall back to each domain's default.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TtlSettings {
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub stats: Option<Duration>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub trends: Option<Duration>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub search: Option<Duration>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub tags: Option<Duration>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub filters: Option<Duration>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub article_detail: Option<Duration>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub article: Option<Duration>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub favorite: Option<Duration>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub view: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_breaker_threshold")]
    pub threshold: u32,

    #[serde(default = "default_breaker_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    #[serde(default = "default_half_open_requests")]
    pub half_open_requests: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            threshold: default_breaker_threshold(),
            timeout: default_breaker_timeout(),
            half_open_requests: default_half_open_requests(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LockSettings {
    #[serde(default = "default_lock_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,

    #[serde(default = "default_max_wait", with = "humantime_serde")]
    pub max_wait: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            ttl: default_lock_ttl(),
            retry_interval: default_retry_interval(),
            max_wait: default_max_wait(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StampedeSettings {
    #[serde(default = "default_poll_attempts")]
    pub poll_attempts: u32,

    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for StampedeSettings {
    fn default() -> Self {
        Self {
            poll_attempts: default_poll_attempts(),
            poll_interval: default_poll_interval(),
        }
    }
}

/// Batch loader settings, one optimizer block per query kind.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchSettings {
    /// How long a loader waits to collect keys before dispatching
    #[serde(default = "default_batch_window", with = "humantime_serde")]
    pub window: Duration,

    #[serde(default = "OptimizerConfig::for_articles")]
    pub article: OptimizerConfig,

    #[serde(default = "OptimizerConfig::for_favorites")]
    pub favorite: OptimizerConfig,

    #[serde(default = "OptimizerConfig::for_views")]
    pub view: OptimizerConfig,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            window: default_batch_window(),
            article: OptimizerConfig::for_articles(),
            favorite: OptimizerConfig::for_favorites(),
            view: OptimizerConfig::for_views(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WarmerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_true")]
    pub warm_on_startup: bool,

    /// Tick of the periodic loop; never shorter than ten minutes
    #[serde(default = "default_warm_tick", with = "humantime_serde")]
    pub tick: Duration,

    #[serde(default = "default_stats_interval", with = "humantime_serde")]
    pub stats_interval: Duration,

    #[serde(default = "default_trends_interval", with = "humantime_serde")]
    pub trends_interval: Duration,

    #[serde(default = "default_trends_interval", with = "humantime_serde")]
    pub keywords_interval: Duration,

    #[serde(default = "default_search_interval", with = "humantime_serde")]
    pub search_interval: Duration,

    /// How many popular searches are pre-executed
    #[serde(default = "default_popular_search_limit")]
    pub popular_search_limit: u32,
}

impl Default for WarmerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            warm_on_startup: true,
            tick: default_warm_tick(),
            stats_interval: default_stats_interval(),
            trends_interval: default_trends_interval(),
            keywords_interval: default_trends_interval(),
            search_interval: default_search_interval(),
            popular_search_limit: default_popular_search_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemoryOptimizerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_memory_check_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Usage percentage that triggers normal optimization
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: f64,

    /// Usage percentage that triggers emergency optimization
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: f64,

    /// TTL given to application keys found without one
    #[serde(default = "default_orphan_ttl", with = "humantime_serde")]
    pub default_ttl: Duration,

    /// Keys evicted per emergency pass
    #[serde(default = "default_eviction_batch")]
    pub eviction_batch: usize,
}

impl Default for MemoryOptimizerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_memory_check_interval(),
            alert_threshold: default_alert_threshold(),
            critical_threshold: default_critical_threshold(),
            default_ttl: default_orphan_ttl(),
            eviction_batch: default_eviction_batch(),
        }
    }
}

// Default value functions
fn default_redis_url() -> String { "redis://127.0.0.1:6379".to_string() }
fn default_key_prefix() -> String { "technews".to_string() }
fn default_environment() -> String { "development".to_string() }
fn default_command_timeout() -> Duration { Duration::from_secs(2) }
fn default_database_url() -> String { "postgres://localhost:5432/technews".to_string() }
fn default_max_connections() -> u32 { 10 }
fn default_min_connections() -> u32 { 1 }
fn default_memory_max_size() -> usize { 1000 }
fn default_memory_ttl() -> Duration { Duration::from_secs(60) }
fn default_cleanup_interval() -> Duration { Duration::from_secs(60) }
fn default_breaker_threshold() -> u32 { 5 }
fn default_breaker_timeout() -> Duration { Duration::from_secs(60) }
fn default_half_open_requests() -> u32 { 3 }
fn default_lock_ttl() -> Duration { Duration::from_secs(30) }
fn default_retry_interval() -> Duration { Duration::from_millis(50) }
fn default_max_wait() -> Duration { Duration::from_secs(5) }
fn default_poll_attempts() -> u32 { 10 }
fn default_poll_interval() -> Duration { Duration::from_millis(200) }
fn default_batch_window() -> Duration { Duration::from_millis(2) }
fn default_true() -> bool { true }
fn default_warm_tick() -> Duration { Duration::from_secs(600) }
fn default_stats_interval() -> Duration { Duration::from_secs(3600) }
fn default_trends_interval() -> Duration { Duration::from_secs(1800) }
fn default_search_interval() -> Duration { Duration::from_secs(600) }
fn default_popular_search_limit() -> u32 { 10 }
fn default_memory_check_interval() -> Duration { Duration::from_secs(60) }
fn default_alert_threshold() -> f64 { 75.0 }
fn default_critical_threshold() -> f64 { 90.0 }
fn default_orphan_ttl() -> Duration { Duration::from_secs(3600) }
fn default_eviction_batch() -> usize { 1000 }

impl Settings {
    /// Load configuration from the environment.
    pub fn load() -> anyhow::Result<Self> {
        Self::build(None)
    }

    /// Load from a specific file path, with environment overrides on top.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        Self::build(Some(path))
    }

    fn build(path: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder
            .add_source(config::Environment::with_prefix("TECHNEWS").separator("__"))
            .set_override_option("redis.url", std::env::var("REDIS_URL").ok())?
            .set_override_option("database.url", std::env::var("DATABASE_URL").ok())?;

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject combinations the cache layers cannot honour.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.memory_cache.max_size == 0 {
            anyhow::bail!("memory_cache.max_size must be greater than zero");
        }
        if self.memory_optimizer.alert_threshold >= self.memory_optimizer.critical_threshold {
            anyhow::bail!("memory_optimizer.alert_threshold must be below critical_threshold");
        }
        for (name, cfg) in [
            ("article", &self.batch.article),
            ("favorite", &self.batch.favorite),
            ("view", &self.batch.view),
        ] {
            if cfg.min_batch_size == 0 || cfg.min_batch_size > cfg.max_batch_size {
                anyhow::bail!("batch.{name}: min_batch_size must be in 1..=max_batch_size");
            }
        }
        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_constants() {
        let settings = Settings::default();
        assert_eq!(settings.memory_cache.max_size, 1000);
        assert_eq!(settings.memory_cache.default_ttl, Duration::from_secs(60));
        assert_eq!(settings.circuit_breaker.threshold, 5);
        assert_eq!(settings.circuit_breaker.half_open_requests, 3);
        assert_eq!(settings.lock.max_wait, Duration::from_secs(5));
        assert_eq!(settings.lock.retry_interval, Duration::from_millis(50));
        assert_eq!(settings.stampede.poll_attempts, 10);
        assert_eq!(settings.warmer.search_interval, Duration::from_secs(600));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_from_file_parses_humantime_durations() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[redis]
key_prefix = "news"
environment = "staging"

[memory_cache]
max_size = 50
default_ttl = "2m"

[ttl]
search = "90s"
"#
        )
        .unwrap();

        let settings = Settings::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(settings.redis.key_prefix, "news");
        assert_eq!(settings.redis.environment, "staging");
        assert_eq!(settings.memory_cache.max_size, 50);
        assert_eq!(settings.memory_cache.default_ttl, Duration::from_secs(120));
        assert_eq!(settings.ttl.search, Some(Duration::from_secs(90)));
        assert_eq!(settings.ttl.stats, None);
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let mut settings = Settings::default();
        settings.memory_optimizer.alert_threshold = 95.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_to_toml_round_trips() {
        let settings = Settings::default();
        let rendered = settings.to_toml().unwrap();
        assert!(rendered.contains("[redis]"));
        let parsed: Settings = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.lock.ttl, settings.lock.ttl);
    }
}
