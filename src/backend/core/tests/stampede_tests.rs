//! Cache stampede protection and distributed lock behavior under concurrency.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use technews_core::cache::{KeyNamespace, RedisCache, StampedeConfig};
use technews_core::resilience::{DistributedLock, LockConfig};
use technews_core::store::{KeyValueStore, MemoryStore};
use technews_core::{CoreError, ErrorCode};
use tokio_test::{assert_err, assert_ok};

fn namespace() -> KeyNamespace {
    KeyNamespace::new("tn", "test")
}

fn lock(store: Arc<dyn KeyValueStore>, max_wait: Duration) -> DistributedLock {
    DistributedLock::new(
        store,
        namespace(),
        LockConfig {
            ttl: Duration::from_secs(10),
            retry_interval: Duration::from_millis(20),
            max_wait,
        },
    )
}

fn guarded_cache(store: Arc<dyn KeyValueStore>) -> RedisCache {
    RedisCache::new(Arc::clone(&store), "tn:test:stats", Duration::from_secs(60))
        .with_lock(lock(store, Duration::from_secs(5)))
        .with_stampede(StampedeConfig {
            poll_attempts: 20,
            poll_interval: Duration::from_millis(50),
        })
}

#[tokio::test]
async fn test_concurrent_misses_run_fetcher_once() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let cache = guarded_cache(store);
    let calls = Arc::new(AtomicUsize::new(0));

    let requests = (0..10).map(|_| {
        let cache = cache.clone();
        let calls = Arc::clone(&calls);
        tokio::spawn(async move {
            cache
                .get_or_set_with_lock(
                    "overview",
                    || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        Ok(42_u64)
                    },
                    None,
                )
                .await
        })
    });
    let results = futures::future::join_all(requests).await;

    for result in results {
        assert_eq!(result.unwrap().unwrap(), 42);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.get::<u64>("overview").await, Some(42));
}

#[tokio::test]
async fn test_lock_is_released_after_fill() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let cache = guarded_cache(Arc::clone(&store));
    let lock = lock(store, Duration::from_millis(100));

    let value: String = cache
        .get_or_set_with_lock("trends", || async { Ok("rising".to_string()) }, None)
        .await
        .unwrap();

    assert_eq!(value, "rising");
    assert!(!lock.is_locked(&cache.full_key("trends")).await.unwrap());
}

#[tokio::test]
async fn test_fetch_error_releases_lock_and_is_not_cached() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let cache = guarded_cache(Arc::clone(&store));
    let lock = lock(store, Duration::from_millis(100));

    let err = assert_err!(
        cache
            .get_or_set_with_lock::<u64, _, _>(
                "keywords",
                || async { Err(CoreError::database("query timed out")) },
                None,
            )
            .await
    );

    assert_eq!(err.code(), ErrorCode::DatabaseQueryFailed);
    assert!(!lock.is_locked(&cache.full_key("keywords")).await.unwrap());
    assert_eq!(cache.get::<u64>("keywords").await, None);
}

#[tokio::test]
async fn test_loser_fetches_directly_when_lock_never_frees() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let cache = RedisCache::new(Arc::clone(&store), "tn:test:search", Duration::from_secs(60))
        .with_lock(lock(Arc::clone(&store), Duration::from_millis(50)))
        .with_stampede(StampedeConfig {
            poll_attempts: 2,
            poll_interval: Duration::from_millis(10),
        });

    // Someone else holds the fill lock and never writes the value.
    let holder = lock(store, Duration::from_millis(50));
    let token = holder
        .acquire(&cache.full_key("results:rust"), None)
        .await
        .unwrap();
    assert!(token.is_some());

    let value = assert_ok!(
        cache
            .get_or_set_with_lock("results:rust", || async { Ok(7_u32) }, None)
            .await
    );
    assert_eq!(value, 7);
}

#[tokio::test]
async fn test_execute_with_lock_serializes_critical_sections() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let lock = lock(store, Duration::from_secs(5));
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));

    let workers = (0..5).map(|_| {
        let lock = lock.clone();
        let inside = Arc::clone(&inside);
        let max_inside = Arc::clone(&max_inside);
        tokio::spawn(async move {
            lock.execute_with_lock("warming", None, || async move {
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
            .await
        })
    });

    for result in futures::future::join_all(workers).await {
        assert_ok!(result.unwrap());
    }
    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    assert!(!lock.is_locked("warming").await.unwrap());
}

#[tokio::test]
async fn test_foreign_token_cannot_release() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let lock = lock(Arc::clone(&store), Duration::from_millis(50));

    let token = lock.acquire("job", None).await.unwrap().unwrap();
    assert!(!lock.release("job", "0_not-the-owner").await.unwrap());
    assert!(lock.is_locked("job").await.unwrap());
    assert_eq!(store.get("tn:test:lock:job").await.unwrap(), Some(token.clone()));

    assert!(lock.release("job", &token).await.unwrap());
    assert!(!lock.is_locked("job").await.unwrap());
}
