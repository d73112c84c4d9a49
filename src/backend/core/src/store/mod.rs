//! Key-value store abstraction shared by every cache layer.
//!
//! The caches, the distributed lock and the memory optimizer only need a
//! small Redis subset. [`KeyValueStore`] names that subset so the same code
//! runs against [`RedisStore`] in production and [`MemoryStore`] in tests or
//! single-instance deployments.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::error::Result;

/// TTL reply for a key that does not exist.
pub const TTL_MISSING: i64 = -2;
/// TTL reply for a key that exists without an expiry.
pub const TTL_PERSISTENT: i64 = -1;

/// Optional commands a store supports, fixed when the store is built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCapabilities {
    /// Non-blocking delete (`UNLINK`)
    pub unlink: bool,
    /// Compare-and-delete in one atomic step
    pub atomic_compare_delete: bool,
}

/// Memory figures reported by the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryInfo {
    pub used_memory: u64,
    /// Configured `maxmemory`; zero means unlimited
    pub max_memory: u64,
    /// Host memory, used as the ceiling when `max_memory` is zero
    pub total_system_memory: u64,
    pub used_memory_human: Option<String>,
}

impl MemoryInfo {
    /// The ceiling usage is measured against, if one is known.
    pub fn effective_max(&self) -> Option<u64> {
        match (self.max_memory, self.total_system_memory) {
            (0, 0) => None,
            (0, total) => Some(total),
            (max, _) => Some(max),
        }
    }

    /// Usage as a percentage of [`effective_max`](Self::effective_max).
    pub fn usage_percent(&self) -> Option<f64> {
        self.effective_max()
            .map(|max| self.used_memory as f64 / max as f64 * 100.0)
    }
}

/// The store operations the cache core depends on.
///
/// Values are JSON strings; (de)serialization happens in the cache layers.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> StoreCapabilities;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Values in the same order as `keys`.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Set only if absent. Returns whether the key was written.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn del(&self, keys: &[String]) -> Result<u64>;

    /// Non-blocking delete. Stores without the capability fall back to `del`.
    async fn unlink(&self, keys: &[String]) -> Result<u64>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// One `SCAN` step. A returned cursor of zero ends the iteration.
    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)>;

    /// Remaining TTL in seconds, or [`TTL_MISSING`] / [`TTL_PERSISTENT`].
    async fn ttl(&self, key: &str) -> Result<i64>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn ttl_many(&self, keys: &[String]) -> Result<Vec<i64>>;

    async fn expire_many(&self, entries: &[(String, Duration)]) -> Result<()>;

    /// Delete `key` only while it still holds `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool>;

    async fn memory_info(&self) -> Result<MemoryInfo>;

    async fn ping(&self) -> Result<()>;
}

/// Whole seconds for an `EX` argument, never below one.
pub(crate) fn ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}

/// Collect every key matching `pattern`, stopping after `limit` keys.
pub async fn scan_keys(
    store: &dyn KeyValueStore,
    pattern: &str,
    count: usize,
    limit: Option<usize>,
) -> Result<Vec<String>> {
    scan_keys_where(store, pattern, count, limit, |_| true).await
}

/// [`scan_keys`] keeping only keys accepted by `keep`. `limit` counts kept
/// keys, and the walk stops as soon as it is reached.
pub async fn scan_keys_where(
    store: &dyn KeyValueStore,
    pattern: &str,
    count: usize,
    limit: Option<usize>,
    keep: impl Fn(&str) -> bool,
) -> Result<Vec<String>> {
    let mut cursor = 0;
    let mut found = Vec::new();
    loop {
        let (next, keys) = store.scan(cursor, pattern, count).await?;
        found.extend(keys.into_iter().filter(|k| keep(k)));
        if let Some(limit) = limit {
            if found.len() >= limit {
                found.truncate(limit);
                break;
            }
        }
        cursor = next;
        if cursor == 0 {
            break;
        }
    }
    Ok(found)
}

/// Delete every key matching `pattern` in batches of `batch_size`.
///
/// Walks the keyspace with `SCAN` (never `KEYS`) and prefers `UNLINK`
/// when the store supports it. Returns the number of keys removed.
pub async fn delete_matching(
    store: &dyn KeyValueStore,
    pattern: &str,
    batch_size: usize,
) -> Result<u64> {
    let batch_size = batch_size.max(1);
    let use_unlink = store.capabilities().unlink;
    let mut cursor = 0;
    let mut pending: Vec<String> = Vec::with_capacity(batch_size);
    let mut deleted = 0;

    loop {
        let (next, keys) = store.scan(cursor, pattern, batch_size).await?;
        pending.extend(keys);
        while pending.len() >= batch_size {
            let batch: Vec<String> = pending.drain(..batch_size).collect();
            deleted += remove_batch(store, &batch, use_unlink).await?;
        }
        cursor = next;
        if cursor == 0 {
            break;
        }
    }
    if !pending.is_empty() {
        deleted += remove_batch(store, &pending, use_unlink).await?;
    }

    debug!(store = store.name(), pattern, deleted, "Deleted keys by pattern");
    Ok(deleted)
}

async fn remove_batch(store: &dyn KeyValueStore, keys: &[String], use_unlink: bool) -> Result<u64> {
    if use_unlink {
        store.unlink(keys).await
    } else {
        store.del(keys).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_secs_rounds_up() {
        assert_eq!(ttl_secs(Duration::from_millis(1)), 1);
        assert_eq!(ttl_secs(Duration::from_millis(1500)), 2);
        assert_eq!(ttl_secs(Duration::from_secs(30)), 30);
        assert_eq!(ttl_secs(Duration::ZERO), 1);
    }

    #[test]
    fn test_memory_info_usage() {
        let info = MemoryInfo {
            used_memory: 80,
            max_memory: 100,
            total_system_memory: 1000,
            used_memory_human: None,
        };
        assert_eq!(info.usage_percent(), Some(80.0));

        let unlimited = MemoryInfo {
            used_memory: 250,
            max_memory: 0,
            total_system_memory: 1000,
            used_memory_human: None,
        };
        assert_eq!(unlimited.usage_percent(), Some(25.0));
        assert_eq!(MemoryInfo::default().usage_percent(), None);
    }

    #[tokio::test]
    async fn test_delete_matching_in_batches() {
        let store = MemoryStore::new();
        for i in 0..25 {
            store
                .set_ex(&format!("app:search:{i}"), "1", Duration::from_secs(60))
                .await
                .unwrap();
        }
        store.set_ex("app:stats:all", "1", Duration::from_secs(60)).await.unwrap();

        let deleted = delete_matching(&store, "app:search:*", 10).await.unwrap();
        assert_eq!(deleted, 25);
        assert!(store.exists("app:stats:all").await.unwrap());
    }

    #[tokio::test]
    async fn test_scan_keys_respects_limit() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.set_ex(&format!("k:{i}"), "v", Duration::from_secs(60)).await.unwrap();
        }
        let keys = scan_keys(&store, "k:*", 100, Some(3)).await.unwrap();
        assert_eq!(keys.len(), 3);
    }

    #[tokio::test]
    async fn test_scan_keys_walks_every_page() {
        let store = MemoryStore::new();
        for i in 0..12 {
            store.set_persistent(&format!("app:tags:{i}"), "[]");
            store.set_persistent(&format!("app:lock:{i}"), "token");
        }

        let all = scan_keys(&store, "app:tags:*", 2, None).await.unwrap();
        assert_eq!(all.len(), 12);

        let unlocked = scan_keys_where(&store, "app:*", 2, Some(5), |k| !k.starts_with("app:lock:"))
            .await
            .unwrap();
        assert_eq!(unlocked.len(), 5);
        assert!(unlocked.iter().all(|k| k.starts_with("app:tags:")));
    }
}
