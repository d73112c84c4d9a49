//! Process-local L1 cache: bounded LRU map with per-entry TTL.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::MemoryCacheSettings;
use crate::error::Result;
use crate::telemetry::CacheMetrics;

/// Configuration for [`MemoryCache`].
#[derive(Debug, Clone)]
pub struct MemoryCacheConfig {
    /// Maximum number of entries before LRU eviction
    pub max_size: usize,
    /// TTL used when `set` is given none
    pub default_ttl: Duration,
    /// Period of the background expiry sweep
    pub cleanup_interval: Duration,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            default_ttl: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl From<&MemoryCacheSettings> for MemoryCacheConfig {
    fn from(settings: &MemoryCacheSettings) -> Self {
        Self {
            max_size: settings.max_size.max(1),
            default_ttl: settings.default_ttl,
            cleanup_interval: settings.cleanup_interval,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    data: V,
    expires_at: Instant,
    access_count: u64,
    /// Logical clock value of the last read or write
    last_accessed: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// Statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub sets: u64,
    pub deletes: u64,
    pub size: usize,
    pub max_size: usize,
    /// Hits as a percentage of lookups
    pub hit_rate: f64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
    sets: u64,
    deletes: u64,
}

#[derive(Debug)]
struct State<V> {
    entries: HashMap<String, CacheEntry<V>>,
    clock: u64,
    counters: Counters,
}

impl<V> State<V> {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before - self.entries.len()
    }

    /// Drop the least recently accessed entry.
    fn evict_lru(&mut self) -> Option<String> {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_accessed)
            .map(|(k, _)| k.clone())?;
        self.entries.remove(&victim);
        self.counters.evictions += 1;
        CacheMetrics::record_eviction();
        Some(victim)
    }
}

/// Bounded in-process cache.
///
/// Entries expire lazily on read and are swept every `cleanup_interval` by a
/// timer the cache starts when it is built inside a Tokio runtime. The timer
/// stops on [`destroy`](Self::destroy) or when the cache is dropped.
pub struct MemoryCache<V = serde_json::Value> {
    config: MemoryCacheConfig,
    state: Arc<Mutex<State<V>>>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl<V> std::fmt::Debug for MemoryCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("config", &self.config)
            .field("size", &self.state.lock().entries.len())
            .finish()
    }
}

impl<V> MemoryCache<V>
where
    V: Clone + Send + 'static,
{
    /// Build the cache and, when called inside a Tokio runtime, start its
    /// expiry sweep.
    pub fn new(config: MemoryCacheConfig) -> Self {
        let cache = Self {
            state: Arc::new(Mutex::new(State {
                entries: HashMap::with_capacity(config.max_size.min(4096)),
                clock: 0,
                counters: Counters::default(),
            })),
            config,
            cleanup: Mutex::new(None),
        };
        cache.spawn_cleanup();
        cache
    }

    /// Start the periodic expiry sweep. A no-op when it is already running
    /// or when there is no Tokio runtime to run it on.
    pub fn spawn_cleanup(&self) {
        let mut slot = self.cleanup.lock();
        if slot.is_some() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime, memory cache sweep not started");
            return;
        };
        let weak: Weak<Mutex<State<V>>> = Arc::downgrade(&self.state);
        let period = self.config.cleanup_interval.max(Duration::from_millis(1));
        *slot = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(state) = weak.upgrade() else { break };
                let (removed, size) = {
                    let mut state = state.lock();
                    let removed = state.purge_expired(Instant::now());
                    (removed, state.entries.len())
                };
                CacheMetrics::set_memory_entries(size);
                if removed > 0 {
                    debug!(removed, size, "Memory cache sweep");
                }
            }
        }));
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let tick = state.tick();

        let expired = match state.entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.access_count += 1;
                entry.last_accessed = tick;
                let data = entry.data.clone();
                state.counters.hits += 1;
                return Some(data);
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            state.entries.remove(key);
        }
        state.counters.misses += 1;
        None
    }

    /// Presence check without touching stats or recency.
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        self.state
            .lock()
            .entries
            .get(key)
            .is_some_and(|e| !e.is_expired(now))
    }

    pub fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        let key = key.into();
        let now = Instant::now();
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let mut state = self.state.lock();

        if !state.entries.contains_key(&key) && state.entries.len() >= self.config.max_size {
            if let Some(victim) = state.evict_lru() {
                debug!(key = %victim, "Evicted least recently used entry");
            }
        }

        let tick = state.tick();
        state.entries.insert(
            key,
            CacheEntry {
                data: value,
                expires_at: now + ttl,
                access_count: 0,
                last_accessed: tick,
            },
        );
        state.counters.sets += 1;
    }

    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        let removed = state.entries.remove(key).is_some();
        if removed {
            state.counters.deletes += 1;
        }
        removed
    }

    /// Values in the same order as `keys`.
    pub fn mget<S: AsRef<str>>(&self, keys: &[S]) -> Vec<Option<V>> {
        keys.iter().map(|k| self.get(k.as_ref())).collect()
    }

    pub fn mset(&self, entries: impl IntoIterator<Item = (String, V)>, ttl: Option<Duration>) {
        for (key, value) in entries {
            self.set(key, value, ttl);
        }
    }

    /// Delete every key matching `pattern`. Returns the number removed.
    pub fn delete_pattern(&self, pattern: &regex::Regex) -> usize {
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|k, _| !pattern.is_match(k));
        let removed = before - state.entries.len();
        state.counters.deletes += removed as u64;
        removed
    }

    /// [`delete_pattern`](Self::delete_pattern) from a regex string.
    pub fn delete_matching(&self, pattern: &str) -> Result<usize> {
        let regex = regex::Regex::new(pattern)?;
        Ok(self.delete_pattern(&regex))
    }

    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }

    /// Remove expired entries now. Returns the number removed.
    pub fn cleanup_expired(&self) -> usize {
        self.state.lock().purge_expired(Instant::now())
    }

    /// Number of entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        self.state
            .lock()
            .entries
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// How many times `key` has been read since it was written.
    pub fn access_count(&self, key: &str) -> Option<u64> {
        self.state.lock().entries.get(key).map(|e| e.access_count)
    }

    pub fn stats(&self) -> MemoryCacheStats {
        let state = self.state.lock();
        let c = &state.counters;
        let lookups = c.hits + c.misses;
        MemoryCacheStats {
            hits: c.hits,
            misses: c.misses,
            evictions: c.evictions,
            sets: c.sets,
            deletes: c.deletes,
            size: state.entries.len(),
            max_size: self.config.max_size,
            hit_rate: if lookups > 0 {
                c.hits as f64 / lookups as f64 * 100.0
            } else {
                0.0
            },
        }
    }

    pub fn reset_stats(&self) {
        self.state.lock().counters = Counters::default();
    }

    /// Whether the background sweep is running.
    pub fn sweeping(&self) -> bool {
        self.cleanup.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the sweep timer and drop every entry.
    pub fn destroy(&self) {
        if let Some(handle) = self.cleanup.lock().take() {
            handle.abort();
        }
        self.clear();
    }

    pub fn config(&self) -> &MemoryCacheConfig {
        &self.config
    }
}

impl<V> Drop for MemoryCache<V> {
    fn drop(&mut self) {
        if let Some(handle) = self.cleanup.get_mut().take() {
            handle.abort();
        }
    }
}
