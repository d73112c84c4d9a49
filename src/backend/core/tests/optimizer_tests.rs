//! Adaptive batch sizing, alone and driving a DataLoader.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use technews_core::batch::{BatchFn, BatchMetrics, BatchOptimizer, DataLoader, Loaded, OptimizerConfig, QueryKind};
use technews_core::Result;

fn config() -> OptimizerConfig {
    OptimizerConfig {
        min_batch_size: 10,
        max_batch_size: 200,
        initial_batch_size: 200,
        target_p95: Duration::from_millis(100),
        target_p99: Duration::from_millis(200),
        sample_window: 10,
        cooldown: Duration::ZERO,
        step_up: 10,
        step_down: 20,
        min_cache_hit_rate: 0.4,
        max_queue_wait: Duration::from_millis(10),
    }
}

fn sample(latency_ms: u64, hits: usize, misses: usize) -> BatchMetrics {
    BatchMetrics {
        timestamp: Instant::now(),
        batch_size: hits + misses,
        latency: Duration::from_millis(latency_ms),
        queue_wait: Duration::from_millis(1),
        item_count: hits + misses,
        cache_hits: hits,
        cache_misses: misses,
    }
}

fn feed_window(optimizer: &BatchOptimizer, latency_ms: u64, hits: usize, misses: usize) {
    for _ in 0..optimizer.config().sample_window {
        optimizer.record(sample(latency_ms, hits, misses));
    }
}

#[test]
fn test_sustained_slow_batches_converge_to_minimum() {
    let optimizer = BatchOptimizer::new(QueryKind::Article, config());
    let mut sizes = vec![optimizer.batch_size()];

    for _ in 0..10 {
        feed_window(&optimizer, 300, 0, 50);
        sizes.push(optimizer.batch_size());
    }

    let floor = sizes.iter().position(|s| *s == 10).unwrap();
    assert!(floor > 0);
    for pair in sizes[..=floor].windows(2) {
        assert!(pair[1] < pair[0], "sizes should strictly decrease: {sizes:?}");
    }
    assert!(sizes[floor..].iter().all(|s| *s == 10));
}

#[test]
fn test_fast_cache_friendly_batches_converge_to_maximum() {
    let optimizer = BatchOptimizer::new(
        QueryKind::Favorite,
        OptimizerConfig {
            initial_batch_size: 20,
            ..config()
        },
    );

    let mut previous = optimizer.batch_size();
    for _ in 0..20 {
        feed_window(&optimizer, 5, 40, 10);
        let current = optimizer.batch_size();
        assert!(current >= previous);
        previous = current;
    }
    assert_eq!(optimizer.batch_size(), 200);
}

#[test]
fn test_recovery_after_slow_period() {
    let optimizer = BatchOptimizer::new(QueryKind::View, config());
    for _ in 0..5 {
        feed_window(&optimizer, 400, 0, 10);
    }
    let slowest = optimizer.batch_size();

    feed_window(&optimizer, 5, 10, 0);
    assert!(optimizer.batch_size() > slowest);
    assert_eq!(optimizer.stats().last_adjustment.unwrap().from, slowest);
}

/// Sleeps longer than any target so every dispatched chunk counts as slow.
struct SlowIds {
    chunks: Arc<Mutex<Vec<usize>>>,
}

#[async_trait]
impl BatchFn<u32> for SlowIds {
    type Value = u32;

    async fn load(&self, keys: &[u32]) -> Result<Loaded<u32, u32>> {
        self.chunks.lock().push(keys.len());
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(Loaded::uncached(keys.iter().map(|k| (*k, *k)).collect(), keys.len()))
    }
}

#[tokio::test]
async fn test_loader_chunks_shrink_as_optimizer_adapts() {
    let optimizer = Arc::new(BatchOptimizer::new(
        QueryKind::Article,
        OptimizerConfig {
            min_batch_size: 5,
            initial_batch_size: 50,
            target_p95: Duration::from_millis(1),
            target_p99: Duration::from_millis(2),
            sample_window: 1,
            step_down: 10,
            ..config()
        },
    ));
    let chunks = Arc::new(Mutex::new(Vec::new()));
    let loader = DataLoader::new(SlowIds {
        chunks: Arc::clone(&chunks),
    })
    .with_optimizer(Arc::clone(&optimizer));

    let mut next = 0_u32;
    let mut sizes = Vec::new();
    for _ in 0..8 {
        sizes.push(loader.batch_size());
        let keys: Vec<u32> = (next..next + 50).collect();
        next += 50;
        let values = loader.load_many(&keys).await.unwrap();
        assert_eq!(values.len(), 50);
        assert_eq!(values[0], Some(keys[0]));
    }

    assert_eq!(sizes[0], 50);
    assert_eq!(sizes.last(), Some(&5));
    assert_eq!(optimizer.batch_size(), 5);
    assert!(sizes.windows(2).all(|w| w[1] <= w[0]));

    let chunks = chunks.lock().clone();
    assert_eq!(chunks[0], 50);
    assert_eq!(chunks.iter().sum::<usize>(), 400);
    assert!(chunks[chunks.len() - 10..].iter().all(|c| *c <= 5));
}
