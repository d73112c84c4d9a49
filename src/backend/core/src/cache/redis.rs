//! Namespaced L2 cache over a [`KeyValueStore`].
//!
//! The cache is best-effort: store and serialization failures are counted in
//! `errors` and surface as a miss or a no-op. Only the `try_*` methods
//! propagate them, for callers that route around failures themselves.

use dashmap::DashSet;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::key::{CacheDomain, KeyNamespace};
use crate::config::StampedeSettings;
use crate::error::Result;
use crate::jobs::tasks::BackgroundTasks;
use crate::resilience::DistributedLock;
use crate::store::{self, KeyValueStore};
use crate::telemetry::CacheMetrics;

/// Default batch size for pattern deletes.
pub const DELETE_BATCH_SIZE: usize = 1000;

/// Polling policy for callers that lose the fill lock.
#[derive(Debug, Clone)]
pub struct StampedeConfig {
    /// Cache re-reads before competing for the lock again
    pub poll_attempts: u32,
    pub poll_interval: Duration,
}

impl Default for StampedeConfig {
    fn default() -> Self {
        Self {
            poll_attempts: 10,
            poll_interval: Duration::from_millis(200),
        }
    }
}

impl From<&StampedeSettings> for StampedeConfig {
    fn from(settings: &StampedeSettings) -> Self {
        Self {
            poll_attempts: settings.poll_attempts,
            poll_interval: settings.poll_interval,
        }
    }
}

/// Statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub sets: u64,
    pub deletes: u64,
    /// Hits as a percentage of lookups
    pub hit_rate: f64,
}

impl CacheStats {
    /// Recompute `hit_rate` from hits and misses.
    pub fn calculate_hit_rate(&mut self) {
        let total = self.hits + self.misses;
        self.hit_rate = if total > 0 {
            self.hits as f64 / total as f64 * 100.0
        } else {
            0.0
        };
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
}

/// Redis-backed cache scoped to one namespace. Cheap to clone.
#[derive(Clone)]
pub struct RedisCache {
    store: Arc<dyn KeyValueStore>,
    namespace: String,
    label: String,
    default_ttl: Duration,
    counters: Arc<Counters>,
    lock: Option<DistributedLock>,
    stampede: StampedeConfig,
    pub(crate) tasks: BackgroundTasks,
    pub(crate) revalidating: Arc<DashSet<String>>,
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache")
            .field("store", &self.store.name())
            .field("namespace", &self.namespace)
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl RedisCache {
    /// A cache whose keys all live under `<namespace>:`.
    pub fn new(store: Arc<dyn KeyValueStore>, namespace: impl Into<String>, default_ttl: Duration) -> Self {
        let namespace = namespace.into();
        Self {
            store,
            label: namespace.rsplit(':').next().unwrap_or_default().to_string(),
            namespace,
            default_ttl,
            counters: Arc::new(Counters::default()),
            lock: None,
            stampede: StampedeConfig::default(),
            tasks: BackgroundTasks::new(),
            revalidating: Arc::new(DashSet::new()),
        }
    }

    /// A cache for one domain under the application namespace.
    pub fn for_domain(store: Arc<dyn KeyValueStore>, namespace: &KeyNamespace, domain: CacheDomain, ttl: Duration) -> Self {
        Self::new(store, namespace.domain(domain), ttl)
    }

    /// Enable [`get_or_set_with_lock`](Self::get_or_set_with_lock).
    pub fn with_lock(mut self, lock: DistributedLock) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn with_stampede(mut self, stampede: StampedeConfig) -> Self {
        self.stampede = stampede;
        self
    }

    /// Share a task tracker for background revalidation.
    pub fn with_tasks(mut self, tasks: BackgroundTasks) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// `<namespace>:<key>`
    pub fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    fn record_error(&self, operation: &'static str, key: &str, error: &dyn std::fmt::Display) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        CacheMetrics::record_store_error(operation);
        warn!(namespace = %self.namespace, key, operation, error = %error, "Cache operation failed");
    }

    /// Read and decode, propagating store and decode errors.
    pub async fn try_get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let raw = self.try_get_raw(key).await?;
        self.decode(raw)
    }

    /// The stored string for `key`, without decoding or stats.
    pub async fn try_get_raw(&self, key: &str) -> Result<Option<String>> {
        self.store.get(&self.full_key(key)).await
    }

    /// Decode a value read by [`try_get_raw`](Self::try_get_raw), counting
    /// it as a hit or a miss.
    pub fn decode<T: DeserializeOwned>(&self, raw: Option<String>) -> Result<Option<T>> {
        match raw {
            Some(raw) => {
                let value = serde_json::from_str(&raw)?;
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                CacheMetrics::record_hit("redis", &self.label);
                Ok(Some(value))
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                CacheMetrics::record_miss("redis", &self.label);
                Ok(None)
            }
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.try_get(key).await {
            Ok(value) => value,
            Err(e) => {
                self.record_error("get", key, &e);
                None
            }
        }
    }

    /// Encode and write, propagating failures.
    pub async fn try_set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.store
            .set_ex(&self.full_key(key), &raw, ttl.unwrap_or(self.default_ttl))
            .await?;
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Write `value`. Returns whether the write succeeded.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) -> bool {
        match self.try_set(key, value, ttl).await {
            Ok(()) => true,
            Err(e) => {
                self.record_error("set", key, &e);
                false
            }
        }
    }

    pub async fn try_delete(&self, key: &str) -> Result<bool> {
        let removed = self.store.del(&[self.full_key(key)]).await? > 0;
        if removed {
            self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    pub async fn delete(&self, key: &str) -> bool {
        match self.try_delete(key).await {
            Ok(removed) => removed,
            Err(e) => {
                self.record_error("delete", key, &e);
                false
            }
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        match self.store.exists(&self.full_key(key)).await {
            Ok(exists) => exists,
            Err(e) => {
                self.record_error("exists", key, &e);
                false
            }
        }
    }

    /// Values in the same order as `keys`. A value that fails to decode is
    /// a miss for that key only.
    pub async fn mget<T: DeserializeOwned>(&self, keys: &[String]) -> Vec<Option<T>> {
        let full: Vec<String> = keys.iter().map(|k| self.full_key(k)).collect();
        let raw = match self.store.mget(&full).await {
            Ok(raw) => raw,
            Err(e) => {
                self.record_error("mget", "*", &e);
                return keys.iter().map(|_| None).collect();
            }
        };

        let mut hits = 0;
        let values: Vec<Option<T>> = raw
            .into_iter()
            .zip(keys)
            .map(|(raw, key)| {
                let raw = raw?;
                match serde_json::from_str(&raw) {
                    Ok(value) => {
                        hits += 1;
                        Some(value)
                    }
                    Err(e) => {
                        self.record_error("decode", key, &e);
                        None
                    }
                }
            })
            .collect();

        let misses = (keys.len() - hits) as u64;
        self.counters.hits.fetch_add(hits as u64, Ordering::Relaxed);
        self.counters.misses.fetch_add(misses, Ordering::Relaxed);
        CacheMetrics::record_hits("redis", &self.label, hits as u64, misses);
        values
    }

    /// Write several entries concurrently. Returns how many succeeded.
    pub async fn mset<T: Serialize>(&self, entries: &[(String, T)], ttl: Option<Duration>) -> usize {
        let writes = entries.iter().map(|(key, value)| self.set(key, value, ttl));
        futures::future::join_all(writes)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count()
    }

    /// Delete keys matching a glob relative to the namespace, in batches.
    pub async fn try_delete_by_pattern(&self, pattern: &str, batch_size: Option<usize>) -> Result<u64> {
        let full_pattern = self.full_key(pattern);
        let deleted = store::delete_matching(
            self.store.as_ref(),
            &full_pattern,
            batch_size.unwrap_or(DELETE_BATCH_SIZE),
        )
        .await?;
        self.counters.deletes.fetch_add(deleted, Ordering::Relaxed);
        Ok(deleted)
    }

    /// Best-effort pattern delete. Returns the number of keys removed.
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn delete_by_pattern(&self, pattern: &str, batch_size: Option<usize>) -> u64 {
        match self.try_delete_by_pattern(pattern, batch_size).await {
            Ok(deleted) => {
                debug!(deleted, "Pattern invalidated");
                deleted
            }
            Err(e) => {
                self.record_error("delete_by_pattern", pattern, &e);
                0
            }
        }
    }

    /// [`delete_by_pattern`](Self::delete_by_pattern) with the default batch size.
    pub async fn invalidate_pattern(&self, pattern: &str) -> u64 {
        self.delete_by_pattern(pattern, None).await
    }

    /// Delete every key in the namespace.
    pub async fn clear(&self) -> u64 {
        self.delete_by_pattern("*", None).await
    }

    /// Read-through without stampede protection.
    ///
    /// Concurrent misses for the same key all call `fetcher`; use
    /// [`get_or_set_with_lock`](Self::get_or_set_with_lock) when that matters.
    pub async fn get_or_set<T, F, Fut>(&self, key: &str, fetcher: F, ttl: Option<Duration>) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }
        let value = fetcher().await?;
        self.set(key, &value, ttl).await;
        Ok(value)
    }

    /// Read-through where only one caller across processes runs `fetcher`.
    ///
    /// The lock winner re-checks the cache, fetches and stores. Losers poll
    /// the cache, then wait for the lock, and finally fetch directly if it
    /// never frees up. Lock store failures also fall through to a direct
    /// fetch. Without a configured lock this is [`get_or_set`](Self::get_or_set).
    #[instrument(skip(self, fetcher), fields(namespace = %self.namespace))]
    pub async fn get_or_set_with_lock<T, F, Fut>(&self, key: &str, fetcher: F, ttl: Option<Duration>) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }
        let Some(lock) = self.lock.clone() else {
            return self.fill(key, fetcher, ttl, false).await;
        };
        let lock_name = self.full_key(key);

        match lock.acquire(&lock_name, None).await {
            Ok(Some(token)) => {
                return lock
                    .run_holding(&lock_name, &token, self.fill(key, fetcher, ttl, true))
                    .await;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(key, error = %e, "Lock unavailable, fetching directly");
                CacheMetrics::record_stampede_fallback("lock_error");
                return self.fill(key, fetcher, ttl, false).await;
            }
        }

        for _ in 0..self.stampede.poll_attempts {
            tokio::time::sleep(self.stampede.poll_interval).await;
            if let Some(value) = self.get(key).await {
                return Ok(value);
            }
        }

        match lock.acquire_with_wait(&lock_name, None).await {
            Ok(Some(token)) => {
                lock.run_holding(&lock_name, &token, self.fill(key, fetcher, ttl, true))
                    .await
            }
            Ok(None) => {
                debug!(key, "Lock still held after waiting, fetching directly");
                CacheMetrics::record_stampede_fallback("lock_timeout");
                self.fill(key, fetcher, ttl, false).await
            }
            Err(e) => {
                warn!(key, error = %e, "Lock unavailable, fetching directly");
                CacheMetrics::record_stampede_fallback("lock_error");
                self.fill(key, fetcher, ttl, false).await
            }
        }
    }

    async fn fill<T, F, Fut>(&self, key: &str, fetcher: F, ttl: Option<Duration>, recheck: bool) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if recheck {
            if let Some(value) = self.get(key).await {
                return Ok(value);
            }
        }
        let value = fetcher().await?;
        self.set(key, &value, ttl).await;
        Ok(value)
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            sets: self.counters.sets.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            hit_rate: 0.0,
        };
        stats.calculate_hit_rate();
        stats
    }

    pub fn reset_stats(&self) {
        self.counters.hits.store(0, Ordering::Relaxed);
        self.counters.misses.store(0, Ordering::Relaxed);
        self.counters.errors.store(0, Ordering::Relaxed);
        self.counters.sets.store(0, Ordering::Relaxed);
        self.counters.deletes.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn cache() -> (Arc<MemoryStore>, RedisCache) {
        let store = Arc::new(MemoryStore::new());
        let cache = RedisCache::new(store.clone(), "test:unit:search", Duration::from_secs(60));
        (store, cache)
    }

    #[tokio::test]
    async fn test_set_then_get_round_trips() {
        let (_, cache) = cache();
        let value = json!({"items": [1, 2, 3], "total": 3, "query": "rust"});
        assert!(cache.set("q1", &value, None).await);
        let read: serde_json::Value = cache.get("q1").await.unwrap();
        assert_eq!(read, value);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_keys_are_namespaced() {
        let (store, cache) = cache();
        cache.set("abc", &1, None).await;
        assert!(store.exists("test:unit:search:abc").await.unwrap());
    }

    #[tokio::test]
    async fn test_bad_json_counts_error_and_misses() {
        let (store, cache) = cache();
        store.set_persistent("test:unit:search:broken", "{not json");
        let read: Option<serde_json::Value> = cache.get("broken").await;
        assert!(read.is_none());
        assert_eq!(cache.stats().errors, 1);
    }

    #[tokio::test]
    async fn test_mget_isolates_decode_failures() {
        let (store, cache) = cache();
        cache.set("a", &1, None).await;
        store.set_persistent("test:unit:search:b", "oops");
        let values: Vec<Option<i32>> = cache
            .mget(&["a".to_string(), "b".to_string(), "c".to_string()])
            .await;
        assert_eq!(values, vec![Some(1), None, None]);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.errors, 1);
    }

    #[tokio::test]
    async fn test_delete_by_pattern_stays_in_namespace() {
        let (store, cache) = cache();
        for i in 0..5 {
            cache.set(&format!("page:{i}"), &i, None).await;
        }
        cache.set("other", &0, None).await;
        store.set_persistent("test:unit:stats:page:1", "1");

        assert_eq!(cache.delete_by_pattern("page:*", Some(2)).await, 5);
        assert!(cache.exists("other").await);
        assert!(store.exists("test:unit:stats:page:1").await.unwrap());

        assert_eq!(cache.clear().await, 1);
    }

    #[tokio::test]
    async fn test_get_or_set_calls_fetcher_once_when_cached() {
        let (_, cache) = cache();
        let first: i32 = cache.get_or_set("n", || async { Ok(41) }, None).await.unwrap();
        let second: i32 = cache
            .get_or_set("n", || async { panic!("should be cached") }, None)
            .await
            .unwrap();
        assert_eq!((first, second), (41, 41));
    }

    #[tokio::test]
    async fn test_stats_reset() {
        let (_, cache) = cache();
        let _: Option<i32> = cache.get("missing").await;
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().hit_rate, 0.0);
        cache.reset_stats();
        assert_eq!(cache.stats(), CacheStats::default());
    }
}
