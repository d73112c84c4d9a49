//! Two-layer batch loading against an in-process store.
//!
//! Tests cover:
//! - Layer resolution order (L1, then L2, then one fetcher call)
//! - Result order matching the request, duplicates and unknown keys included
//! - Promotion of L2 hits and write-back of fetched values
//! - Per-key isolation of unreadable L2 entries
//! - Pattern invalidation across both layers

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use technews_core::cache::{MemoryCacheConfig, RedisCache, TwoLayerCacheManager};
use technews_core::jobs::BackgroundTasks;
use technews_core::store::{KeyValueStore, MemoryStore};
use technews_core::CoreError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Item {
    id: String,
    source: String,
}

fn item(id: &str, source: &str) -> Item {
    Item {
        id: id.to_string(),
        source: source.to_string(),
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    tasks: BackgroundTasks,
    manager: TwoLayerCacheManager<Item>,
    calls: Arc<Mutex<Vec<Vec<String>>>>,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let tasks = BackgroundTasks::new();
        let l2 = RedisCache::new(store.clone(), "tn:test:item", Duration::from_secs(300)).with_tasks(tasks.clone());
        let manager = TwoLayerCacheManager::new(MemoryCacheConfig::default(), l2).with_tasks(tasks.clone());
        Self {
            store,
            tasks,
            manager,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fetcher that knows every key except those starting with `unknown`.
    async fn load(&self, keys: &[&str]) -> Vec<Option<Item>> {
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        let calls = Arc::clone(&self.calls);
        self.manager
            .batch_load(&keys, |missing| async move {
                calls.lock().push(missing.clone());
                Ok(missing
                    .into_iter()
                    .filter(|k| !k.starts_with("unknown"))
                    .map(|k| {
                        let value = item(&k, "db");
                        (k, value)
                    })
                    .collect::<HashMap<_, _>>())
            })
            .await
            .unwrap()
    }

    fn fetch_calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().clone()
    }
}

#[tokio::test]
async fn test_each_layer_resolves_its_keys_in_request_order() {
    let h = Harness::new();
    h.manager.l1().set("a1", item("a1", "l1"), None);
    h.manager.l2().try_set("a2", &item("a2", "l2"), None).await.unwrap();

    let values = h.load(&["a1", "a2", "a3"]).await;

    assert_eq!(
        values,
        vec![Some(item("a1", "l1")), Some(item("a2", "l2")), Some(item("a3", "db"))]
    );
    assert_eq!(h.fetch_calls(), vec![vec!["a3".to_string()]]);
    // a2 was promoted into L1
    assert_eq!(h.manager.l1().get("a2"), Some(item("a2", "l2")));

    let stats = h.manager.stats();
    assert_eq!((stats.l1_hits, stats.l2_hits, stats.db_queries), (1, 1, 1));
}

#[tokio::test]
async fn test_all_misses_use_a_single_fetch() {
    let h = Harness::new();
    let keys: Vec<String> = (0..50).map(|i| format!("k{i}")).collect();
    let refs: Vec<&str> = keys.iter().map(String::as_str).collect();

    let values = h.load(&refs).await;

    assert_eq!(values.len(), 50);
    assert!(values.iter().all(Option::is_some));
    let calls = h.fetch_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].len(), 50);
}

#[tokio::test]
async fn test_duplicates_and_unknown_keys_keep_positions() {
    let h = Harness::new();
    let values = h.load(&["x", "unknown-1", "x", "y"]).await;

    assert_eq!(
        values,
        vec![Some(item("x", "db")), None, Some(item("x", "db")), Some(item("y", "db"))]
    );
    // Deduplicated before fetching
    assert_eq!(h.fetch_calls()[0], vec!["x", "unknown-1", "y"]);
}

#[tokio::test]
async fn test_l1_short_circuit_skips_l2_and_fetcher() {
    let h = Harness::new();
    h.manager.l1().set("a", item("a", "l1"), None);
    h.manager.l1().set("b", item("b", "l1"), None);

    let (values, report) = h
        .manager
        .batch_load_with_report(&["a".to_string(), "b".to_string()], |_missing| async {
            Err::<HashMap<String, Item>, _>(CoreError::internal("fetcher must not run"))
        })
        .await
        .unwrap();

    assert_eq!(values.len(), 2);
    assert_eq!(report.l1_hits, 2);
    assert_eq!(report.l2_hits, 0);
    assert_eq!(report.db_requested, 0);
    assert_eq!(h.manager.l2().stats().hits + h.manager.l2().stats().misses, 0);
}

#[tokio::test]
async fn test_fetched_values_are_written_back_to_l2() {
    let h = Harness::new();
    h.load(&["w1", "w2"]).await;
    h.tasks.flush().await;

    assert!(h.store.exists("tn:test:item:w1").await.unwrap());
    let cached: Option<Item> = h.manager.l2().try_get("w2").await.unwrap();
    assert_eq!(cached, Some(item("w2", "db")));

    // A manager with a cold L1 over the same store finds them in L2.
    let cold: TwoLayerCacheManager<Item> = TwoLayerCacheManager::new(MemoryCacheConfig::default(), h.manager.l2().clone());
    let (_, report) = cold
        .batch_load_with_report(&["w1".to_string(), "w2".to_string()], |_missing| async {
            Ok(HashMap::new())
        })
        .await
        .unwrap();
    assert_eq!(report.l2_hits, 2);
}

#[tokio::test]
async fn test_unreadable_l2_entry_only_misses_its_own_key() {
    let h = Harness::new();
    h.manager.l2().try_set("good", &item("good", "l2"), None).await.unwrap();
    h.store
        .set_ex("tn:test:item:bad", "{not json", Duration::from_secs(60))
        .await
        .unwrap();

    let values = h.load(&["good", "bad"]).await;

    assert_eq!(values, vec![Some(item("good", "l2")), Some(item("bad", "db"))]);
    assert_eq!(h.fetch_calls(), vec![vec!["bad".to_string()]]);
    assert_eq!(h.manager.stats().l2_errors, 1);
}

#[tokio::test]
async fn test_fetcher_error_propagates() {
    let h = Harness::new();
    let result = h
        .manager
        .batch_load(&["z".to_string()], |_missing| async {
            Err::<HashMap<String, Item>, _>(CoreError::database("connection reset"))
        })
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_invalidate_pattern_clears_both_layers() {
    let h = Harness::new();
    h.load(&["user:1:a", "user:1:b", "user:2:a"]).await;
    h.tasks.flush().await;

    let removed = h.manager.invalidate_pattern("user:1:*").await.unwrap();

    assert_eq!(removed, 2);
    assert!(!h.manager.l1().has("user:1:a"));
    assert!(h.manager.l1().has("user:2:a"));
    assert!(!h.store.exists("tn:test:item:user:1:b").await.unwrap());
    assert!(h.store.exists("tn:test:item:user:2:a").await.unwrap());
}

#[tokio::test]
async fn test_set_then_get_round_trips() {
    let h = Harness::new();
    let value = item("rt", "write");
    assert!(h.manager.set("rt", value.clone()).await);

    let got = h
        .manager
        .get("rt", |_missing| async { Ok(HashMap::new()) })
        .await
        .unwrap();
    assert_eq!(got, Some(value));
    assert!(h.fetch_calls().is_empty());
}
