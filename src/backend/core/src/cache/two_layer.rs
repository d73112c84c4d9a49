//! L1 + L2 + database batch loading.
//!
//! [`TwoLayerCacheManager::batch_load`] resolves a batch of keys from the
//! memory cache, then Redis, then one call to the caller's fetcher, and
//! returns values in request order.

use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use super::memory::{MemoryCache, MemoryCacheConfig};
use super::redis::RedisCache;
use crate::error::Result;
use crate::jobs::tasks::BackgroundTasks;
use crate::resilience::CircuitBreaker;
use crate::store::memory::glob_to_regex;
use crate::telemetry::CacheMetrics;

/// Per-batch layer breakdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Keys requested, duplicates included
    pub requested: usize,
    /// Distinct keys looked up
    pub unique: usize,
    pub l1_hits: usize,
    pub l2_hits: usize,
    /// Keys passed to the fetcher
    pub db_requested: usize,
    /// Keys the fetcher returned a value for
    pub db_fetched: usize,
    pub latency: Duration,
}

impl BatchReport {
    pub fn cache_hits(&self) -> usize {
        self.l1_hits + self.l2_hits
    }

    pub fn cache_misses(&self) -> usize {
        self.db_requested
    }
}

/// Running totals over every batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TwoLayerStats {
    pub l1_hits: u64,
    pub l2_hits: u64,
    /// Fetcher invocations
    pub db_queries: u64,
    /// Keys sent to the fetcher
    pub db_keys: u64,
    /// Distinct keys looked up
    pub total_requests: u64,
    pub batch_count: u64,
    pub l2_errors: u64,
    pub l1_hit_rate: f64,
    pub l2_hit_rate: f64,
    /// Share of requests answered by either cache layer
    pub overall_hit_rate: f64,
}

#[derive(Debug, Default)]
struct Counters {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    db_queries: AtomicU64,
    db_keys: AtomicU64,
    total_requests: AtomicU64,
    batch_count: AtomicU64,
    l2_errors: AtomicU64,
}

const GENERATION_SLOTS: usize = 1024;

/// Write generations, striped by key hash.
///
/// `set`, `invalidate` and `invalidate_pattern` bump them; fetched values are
/// only cached if their key's generation is unchanged since the fetch began.
/// Keys sharing a slot can skip each other's write-back, never the reverse.
#[derive(Debug)]
struct Generations {
    epoch: AtomicU64,
    slots: Box<[AtomicU64]>,
}

type Generation = (u64, u64);

impl Default for Generations {
    fn default() -> Self {
        Self {
            epoch: AtomicU64::new(0),
            slots: (0..GENERATION_SLOTS).map(|_| AtomicU64::new(0)).collect(),
        }
    }
}

impl Generations {
    fn slot(&self, key: &str) -> &AtomicU64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.slots[hasher.finish() as usize % self.slots.len()]
    }

    fn current(&self, key: &str) -> Generation {
        (
            self.epoch.load(Ordering::Acquire),
            self.slot(key).load(Ordering::Acquire),
        )
    }

    fn bump(&self, key: &str) {
        self.slot(key).fetch_add(1, Ordering::AcqRel);
    }

    fn bump_all(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }
}

/// Two-tier cache in front of a batch fetcher. Cheap to clone.
#[derive(Clone)]
pub struct TwoLayerCacheManager<V> {
    l1: Arc<MemoryCache<V>>,
    l2: RedisCache,
    breaker: Option<Arc<CircuitBreaker>>,
    tasks: BackgroundTasks,
    l1_ttl: Option<Duration>,
    l2_ttl: Option<Duration>,
    counters: Arc<Counters>,
    generations: Arc<Generations>,
}

impl<V> std::fmt::Debug for TwoLayerCacheManager<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwoLayerCacheManager")
            .field("l2", &self.l2)
            .field("breaker", &self.breaker.as_ref().map(|b| b.state()))
            .finish()
    }
}

impl<V> TwoLayerCacheManager<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(l1_config: MemoryCacheConfig, l2: RedisCache) -> Self {
        Self::with_l1(Arc::new(MemoryCache::new(l1_config)), l2)
    }

    /// Build around an existing memory cache, e.g. one shared between managers.
    pub fn with_l1(l1: Arc<MemoryCache<V>>, l2: RedisCache) -> Self {
        Self {
            l1,
            l2,
            breaker: None,
            tasks: BackgroundTasks::new(),
            l1_ttl: None,
            l2_ttl: None,
            counters: Arc::new(Counters::default()),
            generations: Arc::new(Generations::default()),
        }
    }

    /// Route the L2 pass through `breaker`.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn with_tasks(mut self, tasks: BackgroundTasks) -> Self {
        self.tasks = tasks;
        self
    }

    /// Override per-layer TTLs; `None` keeps each layer's default.
    pub fn with_ttls(mut self, l1_ttl: Option<Duration>, l2_ttl: Option<Duration>) -> Self {
        self.l1_ttl = l1_ttl;
        self.l2_ttl = l2_ttl;
        self
    }

    pub fn l1(&self) -> &MemoryCache<V> {
        &self.l1
    }

    pub fn l2(&self) -> &RedisCache {
        &self.l2
    }

    pub fn tasks(&self) -> &BackgroundTasks {
        &self.tasks
    }

    /// Resolve `keys` through L1, L2 and one `fetcher` call.
    ///
    /// `result[i]` belongs to `keys[i]`; unresolved keys are `None`.
    pub async fn batch_load<F, Fut>(&self, keys: &[String], fetcher: F) -> Result<Vec<Option<V>>>
    where
        F: FnOnce(Vec<String>) -> Fut,
        Fut: Future<Output = Result<HashMap<String, V>>>,
    {
        let (values, _) = self.batch_load_with_report(keys, fetcher).await?;
        Ok(values)
    }

    /// [`batch_load`](Self::batch_load) that also reports where each key was found.
    #[instrument(skip_all, fields(namespace = %self.l2.namespace(), keys = keys.len()))]
    pub async fn batch_load_with_report<F, Fut>(
        &self,
        keys: &[String],
        fetcher: F,
    ) -> Result<(Vec<Option<V>>, BatchReport)>
    where
        F: FnOnce(Vec<String>) -> Fut,
        Fut: Future<Output = Result<HashMap<String, V>>>,
    {
        let started = Instant::now();
        let mut report = BatchReport {
            requested: keys.len(),
            ..Default::default()
        };
        if keys.is_empty() {
            return Ok((Vec::new(), report));
        }

        let mut seen = HashSet::with_capacity(keys.len());
        let unique: Vec<&String> = keys.iter().filter(|k| seen.insert(k.as_str())).collect();
        report.unique = unique.len();
        self.counters.batch_count.fetch_add(1, Ordering::Relaxed);
        self.counters
            .total_requests
            .fetch_add(unique.len() as u64, Ordering::Relaxed);

        let mut resolved: HashMap<String, V> = HashMap::with_capacity(unique.len());

        // L1
        let mut pending: Vec<String> = Vec::new();
        for key in unique {
            match self.l1.get(key) {
                Some(value) => {
                    resolved.insert(key.clone(), value);
                }
                None => pending.push(key.clone()),
            }
        }
        report.l1_hits = resolved.len();
        self.counters
            .l1_hits
            .fetch_add(report.l1_hits as u64, Ordering::Relaxed);

        if pending.is_empty() {
            report.latency = started.elapsed();
            debug!(l1_hits = report.l1_hits, "Batch served from memory");
            return Ok((order(keys, &resolved), report));
        }

        // L2, each key isolated from the others' failures
        let lookups = pending.iter().map(|key| self.l2_get(key));
        let found = join_all(lookups).await;
        let mut missing = Vec::new();
        for (key, value) in pending.into_iter().zip(found) {
            match value {
                Some(value) => {
                    self.l1.set(key.clone(), value.clone(), self.l1_ttl);
                    resolved.insert(key, value);
                    report.l2_hits += 1;
                }
                None => missing.push(key),
            }
        }
        self.counters
            .l2_hits
            .fetch_add(report.l2_hits as u64, Ordering::Relaxed);

        // Database
        if !missing.is_empty() {
            report.db_requested = missing.len();
            self.counters.db_queries.fetch_add(1, Ordering::Relaxed);
            self.counters
                .db_keys
                .fetch_add(missing.len() as u64, Ordering::Relaxed);

            let started_at: HashMap<String, Generation> = missing
                .iter()
                .map(|k| (k.clone(), self.generations.current(k)))
                .collect();
            let fetched = fetcher(missing).await?;
            report.db_fetched = fetched.len();

            let mut write_back = Vec::with_capacity(fetched.len());
            for (key, value) in fetched {
                // A write or invalidation landed mid-fetch; the value may predate it.
                match started_at.get(&key) {
                    Some(generation) if *generation == self.generations.current(&key) => {
                        self.l1.set(key.clone(), value.clone(), self.l1_ttl);
                        write_back.push((key.clone(), value.clone(), *generation));
                    }
                    _ => debug!(key = %key, "Fetched value superseded, not caching"),
                }
                resolved.insert(key, value);
            }
            self.write_back(write_back);
        }

        report.latency = started.elapsed();
        CacheMetrics::record_batch_load(self.l2.namespace(), report.latency, report.db_fetched);
        debug!(
            l1_hits = report.l1_hits,
            l2_hits = report.l2_hits,
            db_requested = report.db_requested,
            db_fetched = report.db_fetched,
            "Batch loaded"
        );
        Ok((order(keys, &resolved), report))
    }

    async fn l2_get(&self, key: &str) -> Option<V> {
        // Only the store round trip counts toward the breaker; an entry that
        // fails to decode is a miss for this key, not a Redis failure.
        let raw = match &self.breaker {
            Some(breaker) => breaker.execute(|| self.l2.try_get_raw(key)).await,
            None => self.l2.try_get_raw(key).await,
        };
        let outcome = raw.and_then(|raw| self.l2.decode::<V>(raw));
        match outcome {
            Ok(value) => value,
            Err(e) => {
                self.counters.l2_errors.fetch_add(1, Ordering::Relaxed);
                debug!(key, error = %e, "L2 lookup failed, treating as miss");
                None
            }
        }
    }

    fn write_back(&self, entries: Vec<(String, V, Generation)>) {
        if entries.is_empty() {
            return;
        }
        let l2 = self.l2.clone();
        let ttl = self.l2_ttl;
        let breaker = self.breaker.clone();
        let generations = Arc::clone(&self.generations);
        self.tasks.spawn("l2_write_back", async move {
            if let Some(breaker) = &breaker {
                if !breaker.can_execute() {
                    debug!(entries = entries.len(), "Skipping L2 write-back, circuit open");
                    return Ok(());
                }
            }
            let (current, superseded): (Vec<_>, Vec<_>) = entries
                .into_iter()
                .partition(|(key, _, generation)| generations.current(key) == *generation);
            if !superseded.is_empty() {
                debug!(skipped = superseded.len(), "Write-back superseded by newer writes");
            }
            let pending: Vec<(String, V)> = current
                .iter()
                .map(|(key, value, _)| (key.clone(), value.clone()))
                .collect();
            let written = l2.mset(&pending, ttl).await;
            if written < pending.len() {
                warn!(written, total = pending.len(), "Partial L2 write-back");
            }
            // A write that raced the mset may have been overwritten; drop the
            // entry so the next read goes to the database.
            for (key, _, generation) in &current {
                if generations.current(key) != *generation {
                    l2.delete(key).await;
                }
            }
            Ok(())
        });
    }

    /// Single-key read through both layers.
    pub async fn get<F, Fut>(&self, key: &str, fetcher: F) -> Result<Option<V>>
    where
        F: FnOnce(Vec<String>) -> Fut,
        Fut: Future<Output = Result<HashMap<String, V>>>,
    {
        let mut values = self.batch_load(&[key.to_string()], fetcher).await?;
        Ok(values.pop().flatten())
    }

    /// Write-through update of both layers after the authoritative write.
    pub async fn set(&self, key: &str, value: V) -> bool {
        self.generations.bump(key);
        self.l1.set(key.to_string(), value.clone(), self.l1_ttl);
        self.l2.set(key, &value, self.l2_ttl).await
    }

    /// Drop `key` from both layers.
    pub async fn invalidate(&self, key: &str) {
        self.generations.bump(key);
        self.l1.delete(key);
        self.l2.delete(key).await;
    }

    /// Drop keys matching a Redis glob from both layers. Returns the number
    /// removed from L2.
    pub async fn invalidate_pattern(&self, pattern: &str) -> Result<u64> {
        let regex = glob_to_regex(pattern)?;
        self.generations.bump_all();
        let l1_removed = self.l1.delete_pattern(&regex);
        let l2_removed = self.l2.delete_by_pattern(pattern, None).await;
        debug!(pattern, l1_removed, l2_removed, "Invalidated pattern");
        Ok(l2_removed)
    }

    pub fn stats(&self) -> TwoLayerStats {
        let c = &self.counters;
        let total = c.total_requests.load(Ordering::Relaxed);
        let l1_hits = c.l1_hits.load(Ordering::Relaxed);
        let l2_hits = c.l2_hits.load(Ordering::Relaxed);
        let percent = |n: u64| if total > 0 { n as f64 / total as f64 * 100.0 } else { 0.0 };
        TwoLayerStats {
            l1_hits,
            l2_hits,
            db_queries: c.db_queries.load(Ordering::Relaxed),
            db_keys: c.db_keys.load(Ordering::Relaxed),
            total_requests: total,
            batch_count: c.batch_count.load(Ordering::Relaxed),
            l2_errors: c.l2_errors.load(Ordering::Relaxed),
            l1_hit_rate: percent(l1_hits),
            l2_hit_rate: percent(l2_hits),
            overall_hit_rate: percent(l1_hits + l2_hits),
        }
    }

    pub fn reset_stats(&self) {
        let c = &self.counters;
        for counter in [
            &c.l1_hits,
            &c.l2_hits,
            &c.db_queries,
            &c.db_keys,
            &c.total_requests,
            &c.batch_count,
            &c.l2_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

fn order<V: Clone>(keys: &[String], resolved: &HashMap<String, V>) -> Vec<Option<V>> {
    keys.iter().map(|k| resolved.get(k).cloned()).collect()
}
