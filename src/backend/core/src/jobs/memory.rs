//! Redis memory monitor.
//!
//! Reads `INFO memory` on an interval and, when usage crosses the alert or
//! critical threshold, trims the application's own keys. Keys outside
//! `<prefix>:<env>:*` and lock records are never touched.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use super::{shutdown_requested, JobHandle};
use crate::cache::{CacheDomain, DomainCaches, KeyNamespace};
use crate::config::MemoryOptimizerSettings;
use crate::error::Result;
use crate::store::{scan_keys, scan_keys_where, KeyValueStore, TTL_PERSISTENT};
use crate::telemetry::CacheMetrics;

const SCAN_COUNT: usize = 500;
const TTL_CHUNK: usize = 500;

/// TTL factor applied at the alert threshold.
pub const NORMAL_TTL_FACTOR: f64 = 0.8;
/// TTL factor applied at the critical threshold.
pub const EMERGENCY_TTL_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryLevel {
    Normal,
    Alert,
    Critical,
    /// No memory ceiling is known
    Unknown,
}

impl MemoryLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Alert => "alert",
            Self::Critical => "critical",
            Self::Unknown => "unknown",
        }
    }
}

/// What a check did about the measured level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemoryAction {
    None,
    /// Another check was still running
    Skipped,
    Optimized {
        ttls_shortened: usize,
        ttls_assigned: usize,
    },
    Emergency {
        evicted: u64,
        ttls_shortened: usize,
        ttls_assigned: usize,
        search_cleared: u64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryReport {
    pub used: u64,
    pub max: Option<u64>,
    pub usage_percent: Option<f64>,
    pub level: MemoryLevel,
    pub action: MemoryAction,
    pub checked_at: DateTime<Utc>,
}

impl MemoryReport {
    fn skipped() -> Self {
        Self {
            used: 0,
            max: None,
            usage_percent: None,
            level: MemoryLevel::Unknown,
            action: MemoryAction::Skipped,
            checked_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct TtlChanges {
    shortened: usize,
    assigned: usize,
}

/// Clears the running flag when a check ends, however it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Periodic Redis memory check. Cheap to clone.
#[derive(Clone)]
pub struct MemoryOptimizer {
    store: Arc<dyn KeyValueStore>,
    namespace: KeyNamespace,
    caches: Option<DomainCaches>,
    settings: MemoryOptimizerSettings,
    running: Arc<AtomicBool>,
}

impl MemoryOptimizer {
    pub fn new(store: Arc<dyn KeyValueStore>, namespace: KeyNamespace, settings: MemoryOptimizerSettings) -> Self {
        Self {
            store,
            namespace,
            caches: None,
            settings,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Domain caches whose stats are reset and whose search entries are
    /// dropped under pressure.
    pub fn with_caches(mut self, caches: DomainCaches) -> Self {
        self.caches = Some(caches);
        self
    }

    pub fn level_for(&self, usage_percent: Option<f64>) -> MemoryLevel {
        match usage_percent {
            None => MemoryLevel::Unknown,
            Some(p) if p >= self.settings.critical_threshold => MemoryLevel::Critical,
            Some(p) if p >= self.settings.alert_threshold => MemoryLevel::Alert,
            Some(_) => MemoryLevel::Normal,
        }
    }

    /// Measure usage and act on it. Overlapping calls are skipped.
    #[instrument(skip(self))]
    pub async fn check(&self) -> Result<MemoryReport> {
        if self.running.swap(true, Ordering::AcqRel) {
            debug!("Memory check already running");
            return Ok(MemoryReport::skipped());
        }
        let _guard = RunningGuard(&self.running);

        let info = self.store.memory_info().await?;
        let usage_percent = info.usage_percent();
        if let Some(percent) = usage_percent {
            CacheMetrics::set_redis_memory_usage(percent);
        }
        let level = self.level_for(usage_percent);

        let action = match level {
            MemoryLevel::Normal | MemoryLevel::Unknown => MemoryAction::None,
            MemoryLevel::Alert => {
                warn!(usage = ?usage_percent, "Redis memory above alert threshold");
                self.optimize().await?
            }
            MemoryLevel::Critical => {
                warn!(usage = ?usage_percent, "Redis memory critical, evicting");
                self.emergency().await?
            }
        };
        if action != MemoryAction::None {
            CacheMetrics::record_memory_optimization(level.as_str());
        }

        Ok(MemoryReport {
            used: info.used_memory,
            max: info.effective_max(),
            usage_percent,
            level,
            action,
            checked_at: Utc::now(),
        })
    }

    /// Shorten TTLs by a fifth, give persistent keys the default TTL and
    /// reset cache stats.
    async fn optimize(&self) -> Result<MemoryAction> {
        let changes = self.adjust_ttls(NORMAL_TTL_FACTOR).await?;
        if let Some(caches) = &self.caches {
            caches.reset_stats();
        }
        info!(
            shortened = changes.shortened,
            assigned = changes.assigned,
            "Memory optimization done"
        );
        Ok(MemoryAction::Optimized {
            ttls_shortened: changes.shortened,
            ttls_assigned: changes.assigned,
        })
    }

    /// Evict a batch of keys, halve the remaining TTLs and drop the search
    /// cache.
    async fn emergency(&self) -> Result<MemoryAction> {
        let victims = scan_keys_where(
            self.store.as_ref(),
            &self.namespace.app_pattern(),
            SCAN_COUNT,
            Some(self.settings.eviction_batch),
            |k| !self.is_lock_key(k),
        )
        .await?;
        let evicted = if victims.is_empty() { 0 } else { self.store.unlink(&victims).await? };

        let changes = self.adjust_ttls(EMERGENCY_TTL_FACTOR).await?;
        let search_cleared = match &self.caches {
            Some(caches) => caches.search.cache().clear().await,
            None => 0,
        };
        info!(
            evicted,
            shortened = changes.shortened,
            search_cleared,
            "Emergency memory optimization done"
        );
        Ok(MemoryAction::Emergency {
            evicted,
            ttls_shortened: changes.shortened,
            ttls_assigned: changes.assigned,
            search_cleared,
        })
    }

    async fn adjust_ttls(&self, factor: f64) -> Result<TtlChanges> {
        let keys: Vec<String> = scan_keys(
            self.store.as_ref(),
            &self.namespace.app_pattern(),
            SCAN_COUNT,
            None,
        )
        .await?
        .into_iter()
        .filter(|k| !self.is_lock_key(k))
        .collect();

        let mut changes = TtlChanges::default();
        for chunk in keys.chunks(TTL_CHUNK) {
            let ttls = self.store.ttl_many(chunk).await?;
            let mut updates = Vec::new();
            for (key, ttl) in chunk.iter().zip(ttls) {
                if ttl > 0 {
                    let shorter = ((ttl as f64 * factor).floor() as u64).max(1);
                    if shorter < ttl as u64 {
                        updates.push((key.clone(), Duration::from_secs(shorter)));
                        changes.shortened += 1;
                    }
                } else if ttl == TTL_PERSISTENT {
                    updates.push((key.clone(), self.settings.default_ttl));
                    changes.assigned += 1;
                }
            }
            if !updates.is_empty() {
                self.store.expire_many(&updates).await?;
            }
        }
        Ok(changes)
    }

    fn is_lock_key(&self, key: &str) -> bool {
        key.starts_with(&format!("{}:", self.namespace.domain(CacheDomain::Lock)))
    }

    /// Check on the configured interval until the handle is shut down.
    pub fn start(&self) -> JobHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let optimizer = self.clone();
        let period = self.settings.interval.max(Duration::from_secs(1));

        let task = tokio::spawn(async move {
            info!(interval = ?period, "Memory optimizer started");
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown_requested(&mut shutdown_rx) => break,
                    _ = ticker.tick() => {
                        if let Err(e) = optimizer.check().await {
                            warn!(error = %e, "Memory check failed");
                        }
                    }
                }
            }
            info!("Memory optimizer stopped");
        });

        JobHandle::new("memory_optimizer", shutdown_tx, task)
    }
}

impl fmt::Debug for MemoryOptimizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryOptimizer")
            .field("namespace", &self.namespace)
            .field("settings", &self.settings)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DomainCacheBuilder;
    use crate::store::MemoryStore;

    fn setup(max_memory: u64) -> (MemoryOptimizer, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::with_max_memory(max_memory));
        let namespace = KeyNamespace::new("tn", "test");
        let caches = DomainCacheBuilder::new(store.clone(), namespace.clone()).build();
        let optimizer = MemoryOptimizer::new(store.clone(), namespace, MemoryOptimizerSettings::default())
            .with_caches(caches);
        (optimizer, store)
    }

    #[test]
    fn test_levels_follow_thresholds() {
        let (optimizer, _) = setup(0);
        assert_eq!(optimizer.level_for(None), MemoryLevel::Unknown);
        assert_eq!(optimizer.level_for(Some(10.0)), MemoryLevel::Normal);
        assert_eq!(optimizer.level_for(Some(75.0)), MemoryLevel::Alert);
        assert_eq!(optimizer.level_for(Some(95.0)), MemoryLevel::Critical);
    }

    #[tokio::test]
    async fn test_no_action_below_alert() {
        let (optimizer, store) = setup(1_000_000);
        store.set_ex("tn:test:stats:site", "{}", Duration::from_secs(100)).await.unwrap();

        let report = optimizer.check().await.unwrap();
        assert_eq!(report.level, MemoryLevel::Normal);
        assert_eq!(report.action, MemoryAction::None);
        assert_eq!(store.ttl("tn:test:stats:site").await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_alert_shortens_ttls_within_namespace() {
        let (optimizer, store) = setup(0);
        store.set_ex("tn:test:stats:site", "{}", Duration::from_secs(100)).await.unwrap();
        store.set_persistent("tn:test:tags:list:100", "[]");
        store.set_persistent("other:app:key", "x");
        store.set_ex("tn:test:lock:k", "token", Duration::from_secs(30)).await.unwrap();

        // Used memory is now known; pin the ceiling so usage lands near 80%.
        let used = store.memory_info().await.unwrap().used_memory;
        store.set_max_memory(used * 100 / 80);

        let report = optimizer.check().await.unwrap();
        assert_eq!(report.level, MemoryLevel::Alert);
        assert_eq!(
            report.action,
            MemoryAction::Optimized {
                ttls_shortened: 1,
                ttls_assigned: 1,
            }
        );
        assert_eq!(store.ttl("tn:test:stats:site").await.unwrap(), 80);
        assert_eq!(store.ttl("tn:test:tags:list:100").await.unwrap(), 3600);
        assert_eq!(store.ttl("other:app:key").await.unwrap(), TTL_PERSISTENT);
        assert_eq!(store.ttl("tn:test:lock:k").await.unwrap(), 30);
    }

    #[tokio::test]
    async fn test_critical_evicts_but_spares_locks_and_foreign_keys() {
        let (optimizer, store) = setup(0);
        for i in 0..5 {
            store
                .set_ex(&format!("tn:test:search:results:{i}"), "{}", Duration::from_secs(100))
                .await
                .unwrap();
        }
        store.set_persistent("other:app:key", "x");
        store.set_ex("tn:test:lock:k", "token", Duration::from_secs(30)).await.unwrap();
        store.set_max_memory(1);

        let report = optimizer.check().await.unwrap();
        assert_eq!(report.level, MemoryLevel::Critical);
        match report.action {
            MemoryAction::Emergency { evicted, .. } => assert_eq!(evicted, 5),
            other => panic!("unexpected action {other:?}"),
        }
        assert!(store.exists("other:app:key").await.unwrap());
        assert!(store.exists("tn:test:lock:k").await.unwrap());
        assert!(!store.exists("tn:test:search:results:0").await.unwrap());
    }

    #[tokio::test]
    async fn test_emergency_eviction_stops_at_batch_size() {
        let store = Arc::new(MemoryStore::with_max_memory(0));
        let settings = MemoryOptimizerSettings {
            eviction_batch: 3,
            ..Default::default()
        };
        let optimizer = MemoryOptimizer::new(store.clone(), KeyNamespace::new("tn", "test"), settings);
        for i in 0..4 {
            store.set_ex(&format!("tn:test:lock:job{i}"), "token", Duration::from_secs(30)).await.unwrap();
        }
        for i in 0..8 {
            store.set_persistent(&format!("tn:test:trends:week:{i}"), "[]");
        }
        store.set_max_memory(1);

        let report = optimizer.check().await.unwrap();
        match report.action {
            MemoryAction::Emergency { evicted, .. } => assert_eq!(evicted, 3),
            other => panic!("unexpected action {other:?}"),
        }
        let locks = scan_keys(store.as_ref(), "tn:test:lock:*", 2, None).await.unwrap();
        assert_eq!(locks.len(), 4);
        let trends = scan_keys(store.as_ref(), "tn:test:trends:*", 2, None).await.unwrap();
        assert_eq!(trends.len(), 5);
    }

    #[tokio::test]
    async fn test_overlapping_check_is_skipped() {
        let (optimizer, _store) = setup(1_000_000);
        optimizer.running.store(true, Ordering::SeqCst);
        let report = optimizer.check().await.unwrap();
        assert_eq!(report.action, MemoryAction::Skipped);

        optimizer.running.store(false, Ordering::SeqCst);
        assert_eq!(optimizer.check().await.unwrap().action, MemoryAction::None);
    }
}
