//! Stale-while-revalidate reads on top of [`RedisCache`].

use chrono::Utc;
use dashmap::DashSet;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use super::key::short_hash;
use super::redis::RedisCache;
use crate::error::Result;

/// Envelope stored for SWR keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedData<T> {
    pub data: T,
    /// Milliseconds since the Unix epoch at write time
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl<T: Serialize> CachedData<T> {
    /// Wrap `data` stamped with the current time and its content hash.
    pub fn new(data: T) -> Self {
        let etag = serde_json::to_vec(&data).ok().map(short_hash);
        Self {
            data,
            timestamp: Utc::now().timestamp_millis(),
            etag,
        }
    }
}

impl<T> CachedData<T> {
    pub fn age(&self) -> Duration {
        let millis = Utc::now().timestamp_millis().saturating_sub(self.timestamp);
        Duration::from_millis(millis.max(0) as u64)
    }

    pub fn freshness(&self, options: &SwrOptions) -> Freshness {
        let age = self.age();
        if age < options.stale_time {
            Freshness::Fresh
        } else if age < options.ttl {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    /// Servable, but due for a background refresh
    Stale,
    Expired,
}

#[derive(Debug, Clone)]
pub struct SwrOptions {
    /// Age after which an entry is served stale
    pub stale_time: Duration,
    /// Age after which an entry is refetched synchronously; also the store TTL
    pub ttl: Duration,
}

impl SwrOptions {
    pub fn new(stale_time: Duration, ttl: Duration) -> Self {
        Self {
            stale_time: stale_time.min(ttl),
            ttl,
        }
    }
}

impl Default for SwrOptions {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(300))
    }
}

/// Clears a key's in-flight mark when its refresh ends, panics included.
struct InFlight {
    keys: Arc<DashSet<String>>,
    key: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.keys.remove(&self.key);
    }
}

impl RedisCache {
    /// Read `key`, refreshing it from `fetcher` according to its age.
    ///
    /// Fresh entries are returned as is. Stale entries are returned at once
    /// and refetched in the background, at most one refresh per key at a
    /// time in this process. Missing or expired entries are fetched inline.
    #[instrument(skip(self, fetcher, options), fields(namespace = %self.namespace()))]
    pub async fn get_swr<T, F, Fut>(&self, key: &str, fetcher: F, options: SwrOptions) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if let Some(cached) = self.get::<CachedData<T>>(key).await {
            match cached.freshness(&options) {
                Freshness::Fresh => return Ok(cached.data),
                Freshness::Stale => {
                    self.revalidate(key, fetcher, options.ttl);
                    return Ok(cached.data);
                }
                Freshness::Expired => debug!(key, "SWR entry expired"),
            }
        }

        let data = fetcher().await?;
        self.set(key, &CachedData::new(&data), Some(options.ttl)).await;
        Ok(data)
    }

    fn revalidate<T, F, Fut>(&self, key: &str, fetcher: F, ttl: Duration)
    where
        T: Serialize + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let full_key = self.full_key(key);
        if !self.revalidating.insert(full_key.clone()) {
            debug!(key, "Revalidation already in flight");
            return;
        }

        let in_flight = InFlight {
            keys: Arc::clone(&self.revalidating),
            key: full_key,
        };
        let cache = self.clone();
        let key = key.to_string();
        self.tasks.spawn("swr_revalidate", async move {
            let _in_flight = in_flight;
            let data = fetcher().await?;
            cache.try_set(&key, &CachedData::new(data), Some(ttl)).await
        });
    }

    /// Whether a background refresh for `key` is running.
    pub fn is_revalidating(&self, key: &str) -> bool {
        self.revalidating.contains(&self.full_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn cache() -> RedisCache {
        RedisCache::new(Arc::new(MemoryStore::new()), "test:unit:trends", Duration::from_secs(60))
    }

    fn aged(data: i32, age: Duration) -> CachedData<i32> {
        CachedData {
            data,
            timestamp: Utc::now().timestamp_millis() - age.as_millis() as i64,
            etag: None,
        }
    }

    #[test]
    fn test_freshness_boundaries() {
        let options = SwrOptions::new(Duration::from_secs(10), Duration::from_secs(60));
        assert_eq!(aged(1, Duration::from_secs(1)).freshness(&options), Freshness::Fresh);
        assert_eq!(aged(1, Duration::from_secs(30)).freshness(&options), Freshness::Stale);
        assert_eq!(aged(1, Duration::from_secs(61)).freshness(&options), Freshness::Expired);
    }

    #[test]
    fn test_etag_tracks_content() {
        let a = CachedData::new(vec!["rust", "go"]);
        let b = CachedData::new(vec!["rust", "go"]);
        let c = CachedData::new(vec!["zig"]);
        assert_eq!(a.etag, b.etag);
        assert_ne!(a.etag, c.etag);
        assert_eq!(a.etag.as_deref().map(str::len), Some(16));
    }

    #[tokio::test]
    async fn test_fresh_entry_skips_fetcher() {
        let cache = cache();
        let options = SwrOptions::default();
        let first: i32 = cache.get_swr("k", || async { Ok(1) }, options.clone()).await.unwrap();
        let second: i32 = cache.get_swr("k", || async { Ok(2) }, options).await.unwrap();
        assert_eq!((first, second), (1, 1));
    }

    #[tokio::test]
    async fn test_stale_entry_served_then_refreshed() {
        let cache = cache();
        cache.set("k", &aged(1, Duration::from_secs(30)), None).await;
        let options = SwrOptions::new(Duration::from_secs(10), Duration::from_secs(60));

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let value: i32 = cache
            .get_swr(
                "k",
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(2)
                },
                options.clone(),
            )
            .await
            .unwrap();
        assert_eq!(value, 1);

        cache.tasks.flush().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!cache.is_revalidating("k"));

        let refreshed: i32 = cache.get_swr("k", || async { Ok(3) }, options).await.unwrap();
        assert_eq!(refreshed, 2);
    }

    async fn exploding_fetch() -> Result<i32> {
        panic!("upstream exploded")
    }

    #[tokio::test]
    async fn test_panicking_refresh_does_not_block_later_ones() {
        let cache = cache();
        cache.set("k", &aged(1, Duration::from_secs(30)), None).await;
        let options = SwrOptions::new(Duration::from_secs(10), Duration::from_secs(60));

        let value: i32 = cache
            .get_swr("k", exploding_fetch, options.clone())
            .await
            .unwrap();
        assert_eq!(value, 1);
        cache.tasks.flush().await;
        assert!(!cache.is_revalidating("k"));

        let stale: i32 = cache.get_swr("k", || async { Ok(5) }, options.clone()).await.unwrap();
        assert_eq!(stale, 1);
        cache.tasks.flush().await;
        let refreshed: i32 = cache.get_swr("k", || async { Ok(6) }, options).await.unwrap();
        assert_eq!(refreshed, 5);
    }

    #[tokio::test]
    async fn test_expired_entry_fetched_inline() {
        let cache = cache();
        cache.set("k", &aged(1, Duration::from_secs(120)), None).await;
        let options = SwrOptions::new(Duration::from_secs(10), Duration::from_secs(60));
        let value: i32 = cache.get_swr("k", || async { Ok(9) }, options).await.unwrap();
        assert_eq!(value, 9);
    }
}
