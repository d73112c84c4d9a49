//! Fallback-aware cache: Redis behind a circuit breaker, memory as backup.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use super::memory::{MemoryCache, MemoryCacheConfig};
use super::redis::RedisCache;
use crate::error::{CoreError, Result};
use crate::resilience::{CircuitBreaker, CircuitBreakerMetrics, CircuitState};

/// Breaker and fallback status.
#[derive(Debug, Clone, Serialize)]
pub struct ResilientHealth {
    pub healthy: bool,
    pub state: CircuitState,
    pub breaker: CircuitBreakerMetrics,
    pub fallback_entries: usize,
}

enum Found {
    Stored(String),
    Fallback(serde_json::Value),
}

/// [`RedisCache`] that keeps serving from memory while Redis is failing.
#[derive(Debug, Clone)]
pub struct ResilientCache {
    redis: RedisCache,
    breaker: Arc<CircuitBreaker>,
    fallback: Arc<MemoryCache<serde_json::Value>>,
}

impl ResilientCache {
    pub fn new(redis: RedisCache, breaker: Arc<CircuitBreaker>, fallback: MemoryCacheConfig) -> Self {
        Self {
            redis,
            breaker,
            fallback: Arc::new(MemoryCache::new(fallback)),
        }
    }

    pub fn redis(&self) -> &RedisCache {
        &self.redis
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn fallback(&self) -> &MemoryCache<serde_json::Value> {
        &self.fallback
    }

    #[instrument(skip(self), fields(namespace = %self.redis.namespace()))]
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        // Decoding stays outside the breaker: a bad entry is not a Redis outage.
        let found = self
            .breaker
            .execute_with_fallback(
                || async { Ok(self.redis.try_get_raw(key).await?.map(Found::Stored)) },
                || async { Ok(self.fallback.get(key).map(Found::Fallback)) },
            )
            .await
            .ok()
            .flatten()?;
        let decoded = match found {
            Found::Stored(raw) => self.redis.decode(Some(raw)),
            Found::Fallback(value) => serde_json::from_value(value).map(Some).map_err(CoreError::from),
        };
        match decoded {
            Ok(value) => value,
            Err(e) => {
                debug!(key, error = %e, "Cached value has unexpected shape");
                None
            }
        }
    }

    /// Write to Redis, or to the memory fallback when Redis is unavailable.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> bool {
        let Ok(json) = serde_json::to_value(value) else {
            return false;
        };
        let result = self
            .breaker
            .execute_with_fallback(
                || self.redis.try_set(key, &json, ttl),
                || async {
                    self.fallback.set(key.to_string(), json.clone(), ttl);
                    Ok(())
                },
            )
            .await;
        result.is_ok()
    }

    /// Delete from both Redis and the fallback.
    pub async fn delete(&self, key: &str) -> bool {
        let in_memory = self.fallback.delete(key);
        let in_redis = self
            .breaker
            .execute(|| self.redis.try_delete(key))
            .await
            .unwrap_or(false);
        in_memory || in_redis
    }

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

    pub fn health(&self) -> ResilientHealth {
        let breaker = self.breaker.metrics();
        ResilientHealth {
            healthy: breaker.state == CircuitState::Closed,
            state: breaker.state,
            breaker,
            fallback_entries: self.fallback.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::resilience::CircuitBreakerConfig;
    use crate::store::{KeyValueStore, MemoryInfo, MemoryStore, StoreCapabilities};
    use async_trait::async_trait;

    /// Store whose every command fails.
    struct DownStore;

    #[async_trait]
    impl KeyValueStore for DownStore {
        fn name(&self) -> &'static str {
            "down"
        }
        fn capabilities(&self) -> StoreCapabilities {
            StoreCapabilities::default()
        }
        async fn get(&self, _: &str) -> Result<Option<String>> {
            Err(CoreError::internal("connection refused"))
        }
        async fn mget(&self, _: &[String]) -> Result<Vec<Option<String>>> {
            Err(CoreError::internal("connection refused"))
        }
        async fn set_ex(&self, _: &str, _: &str, _: Duration) -> Result<()> {
            Err(CoreError::internal("connection refused"))
        }
        async fn set_nx_ex(&self, _: &str, _: &str, _: Duration) -> Result<bool> {
            Err(CoreError::internal("connection refused"))
        }
        async fn del(&self, _: &[String]) -> Result<u64> {
            Err(CoreError::internal("connection refused"))
        }
        async fn unlink(&self, _: &[String]) -> Result<u64> {
            Err(CoreError::internal("connection refused"))
        }
        async fn exists(&self, _: &str) -> Result<bool> {
            Err(CoreError::internal("connection refused"))
        }
        async fn scan(&self, _: u64, _: &str, _: usize) -> Result<(u64, Vec<String>)> {
            Err(CoreError::internal("connection refused"))
        }
        async fn ttl(&self, _: &str) -> Result<i64> {
            Err(CoreError::internal("connection refused"))
        }
        async fn expire(&self, _: &str, _: Duration) -> Result<bool> {
            Err(CoreError::internal("connection refused"))
        }
        async fn ttl_many(&self, _: &[String]) -> Result<Vec<i64>> {
            Err(CoreError::internal("connection refused"))
        }
        async fn expire_many(&self, _: &[(String, Duration)]) -> Result<()> {
            Err(CoreError::internal("connection refused"))
        }
        async fn delete_if_equals(&self, _: &str, _: &str) -> Result<bool> {
            Err(CoreError::internal("connection refused"))
        }
        async fn memory_info(&self) -> Result<MemoryInfo> {
            Err(CoreError::internal("connection refused"))
        }
        async fn ping(&self) -> Result<()> {
            Err(CoreError::internal("connection refused"))
        }
    }

    fn resilient(store: Arc<dyn KeyValueStore>) -> ResilientCache {
        let breaker = CircuitBreaker::with_config(
            "redis",
            CircuitBreakerConfig {
                threshold: 2,
                timeout: Duration::from_secs(60),
                half_open_requests: 1,
            },
        );
        ResilientCache::new(
            RedisCache::new(store, "test:unit:stats", Duration::from_secs(60)),
            Arc::new(breaker),
            MemoryCacheConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_healthy_redis_is_used() {
        let cache = resilient(Arc::new(MemoryStore::new()));
        assert!(cache.set("k", &vec![1, 2], None).await);
        assert_eq!(cache.get::<Vec<i32>>("k").await, Some(vec![1, 2]));
        assert!(cache.fallback().is_empty());
        assert!(cache.health().healthy);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_a_miss_not_an_outage() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        store
            .set_ex("test:unit:stats:site", "<html>", Duration::from_secs(60))
            .await
            .unwrap();
        let cache = resilient(store);

        for _ in 0..3 {
            assert_eq!(cache.get::<serde_json::Value>("site").await, None);
        }
        assert_eq!(cache.breaker().state(), CircuitState::Closed);
        assert!(cache.health().healthy);
    }

    #[tokio::test]
    async fn test_outage_falls_back_to_memory() {
        let cache = resilient(Arc::new(DownStore));
        assert!(cache.set("k", &"v", None).await);
        assert!(cache.set("k2", &"v2", None).await);
        assert_eq!(cache.breaker().state(), CircuitState::Open);

        assert_eq!(cache.get::<String>("k").await.as_deref(), Some("v"));
        let health = cache.health();
        assert!(!health.healthy);
        assert_eq!(health.fallback_entries, 2);
        assert!(health.breaker.total_rejections >= 1);
    }
}
