//! Per-request batching and memoisation of key lookups.
//!
//! Keys requested within one batch window are collected, deduplicated and
//! handed to a [`BatchFn`] in chunks no larger than the optimizer's current
//! batch size. Each dispatched chunk is reported back to the optimizer.

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, instrument};

use super::optimizer::{BatchMetrics, BatchOptimizer};
use crate::error::{CoreError, ErrorCode, Result};

/// Default time a loader waits to collect keys.
pub const DEFAULT_BATCH_WINDOW: Duration = Duration::from_millis(2);

/// Result of one batch call.
#[derive(Debug, Clone)]
pub struct Loaded<K, V> {
    /// Found values; absent keys resolve to `None`
    pub values: HashMap<K, V>,
    pub cache_hits: usize,
    pub cache_misses: usize,
}

impl<K, V> Loaded<K, V> {
    /// A result that did not go through any cache.
    pub fn uncached(values: HashMap<K, V>, requested: usize) -> Self {
        Self {
            values,
            cache_hits: 0,
            cache_misses: requested,
        }
    }
}

/// Bulk lookup behind a [`DataLoader`].
#[async_trait]
pub trait BatchFn<K>: Send + Sync + 'static {
    type Value: Clone + Send + Sync + 'static;

    async fn load(&self, keys: &[K]) -> Result<Loaded<K, Self::Value>>;
}

type Reply<V> = oneshot::Sender<Result<Option<V>>>;

struct LoaderState<K, V> {
    memo: HashMap<K, Option<V>>,
    pending: Vec<(K, Reply<V>)>,
    /// When the first key of the pending batch arrived
    window_opened: Option<Instant>,
}

/// Batching, memoising loader. Cheap to clone; clones share state.
pub struct DataLoader<K, F: BatchFn<K>> {
    batch_fn: Arc<F>,
    optimizer: Option<Arc<BatchOptimizer>>,
    window: Duration,
    max_batch_size: usize,
    state: Arc<Mutex<LoaderState<K, F::Value>>>,
}

impl<K, F: BatchFn<K>> Clone for DataLoader<K, F> {
    fn clone(&self) -> Self {
        Self {
            batch_fn: Arc::clone(&self.batch_fn),
            optimizer: self.optimizer.clone(),
            window: self.window,
            max_batch_size: self.max_batch_size,
            state: Arc::clone(&self.state),
        }
    }
}

impl<K, F> std::fmt::Debug for DataLoader<K, F>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
    F: BatchFn<K>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DataLoader")
            .field("window", &self.window)
            .field("batch_size", &self.batch_size())
            .field("memoized", &state.memo.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl<K, F> DataLoader<K, F>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
    F: BatchFn<K>,
{
    pub fn new(batch_fn: F) -> Self {
        Self {
            batch_fn: Arc::new(batch_fn),
            optimizer: None,
            window: DEFAULT_BATCH_WINDOW,
            max_batch_size: 100,
            state: Arc::new(Mutex::new(LoaderState {
                memo: HashMap::new(),
                pending: Vec::new(),
                window_opened: None,
            })),
        }
    }

    /// Take the batch size from `optimizer` and report batches to it.
    pub fn with_optimizer(mut self, optimizer: Arc<BatchOptimizer>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Fixed batch size used without an optimizer.
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.max(1);
        self
    }

    /// Chunk size for the next dispatch.
    pub fn batch_size(&self) -> usize {
        self.optimizer
            .as_ref()
            .map_or(self.max_batch_size, |o| o.batch_size())
            .max(1)
    }

    /// Load one key, batched with every other key requested in the window.
    pub async fn load(&self, key: K) -> Result<Option<F::Value>> {
        let rx = {
            let mut state = self.state.lock();
            if let Some(value) = state.memo.get(&key) {
                return Ok(value.clone());
            }
            let (tx, rx) = oneshot::channel();
            state.pending.push((key, tx));
            if state.window_opened.is_none() {
                state.window_opened = Some(Instant::now());
                self.schedule_dispatch();
            }
            rx
        };
        rx.await
            .map_err(|_| CoreError::internal("Batch dispatch dropped before replying"))?
    }

    /// Load several keys; `result[i]` belongs to `keys[i]`.
    pub async fn load_many(&self, keys: &[K]) -> Result<Vec<Option<F::Value>>> {
        join_all(keys.iter().cloned().map(|key| self.load(key)))
            .await
            .into_iter()
            .collect()
    }

    /// Seed the memo, e.g. after a write.
    pub fn prime(&self, key: K, value: F::Value) {
        self.state.lock().memo.insert(key, Some(value));
    }

    /// Forget one memoised key.
    pub fn clear(&self, key: &K) {
        self.state.lock().memo.remove(key);
    }

    pub fn clear_all(&self) {
        self.state.lock().memo.clear();
    }

    fn schedule_dispatch(&self) {
        let loader = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(loader.window).await;
            loader.dispatch().await;
        });
    }

    #[instrument(skip(self))]
    async fn dispatch(&self) {
        let (pending, opened) = {
            let mut state = self.state.lock();
            (std::mem::take(&mut state.pending), state.window_opened.take())
        };
        if pending.is_empty() {
            return;
        }
        let queue_wait = opened.map(|at| at.elapsed()).unwrap_or_default();

        let mut seen = HashSet::with_capacity(pending.len());
        let keys: Vec<K> = pending
            .iter()
            .filter(|(k, _)| seen.insert(k.clone()))
            .map(|(k, _)| k.clone())
            .collect();

        let batch_size = self.batch_size();
        let chunks: Vec<&[K]> = keys.chunks(batch_size).collect();
        debug!(keys = keys.len(), chunks = chunks.len(), batch_size, "Dispatching batch");

        let results = join_all(chunks.iter().map(|chunk| self.run_chunk(chunk, batch_size, queue_wait))).await;

        let mut resolved: HashMap<K, Result<Option<F::Value>>> = HashMap::with_capacity(keys.len());
        {
            let mut state = self.state.lock();
            for (chunk, result) in chunks.iter().zip(results) {
                match result {
                    Ok(mut loaded) => {
                        for key in chunk.iter() {
                            let value = loaded.values.remove(key);
                            state.memo.insert(key.clone(), value.clone());
                            resolved.insert(key.clone(), Ok(value));
                        }
                    }
                    Err(e) => {
                        for key in chunk.iter() {
                            resolved.insert(key.clone(), Err(share_error(&e)));
                        }
                    }
                }
            }
        }

        for (key, reply) in pending {
            let outcome = match resolved.get(&key) {
                Some(Ok(value)) => Ok(value.clone()),
                Some(Err(e)) => Err(share_error(e)),
                None => Ok(None),
            };
            // The caller may have stopped waiting.
            let _ = reply.send(outcome);
        }
    }

    async fn run_chunk(&self, keys: &[K], batch_size: usize, queue_wait: Duration) -> Result<Loaded<K, F::Value>> {
        let started = Instant::now();
        let result = self.batch_fn.load(keys).await;
        if let (Ok(loaded), Some(optimizer)) = (&result, &self.optimizer) {
            optimizer.record(BatchMetrics {
                timestamp: started,
                batch_size,
                latency: started.elapsed(),
                queue_wait,
                item_count: keys.len(),
                cache_hits: loaded.cache_hits,
                cache_misses: loaded.cache_misses,
            });
        }
        result
    }
}

/// Copy of an error for every waiter of a failed chunk.
fn share_error(e: &CoreError) -> CoreError {
    let code = if e.code() == ErrorCode::UnknownError { ErrorCode::InternalError } else { e.code() };
    CoreError::with_internal(code, e.user_message().to_string(), e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::optimizer::{OptimizerConfig, QueryKind};

    #[derive(Default)]
    struct Squares {
        calls: Mutex<Vec<Vec<u32>>>,
    }

    #[async_trait]
    impl BatchFn<u32> for Squares {
        type Value = u64;

        async fn load(&self, keys: &[u32]) -> Result<Loaded<u32, u64>> {
            self.calls.lock().push(keys.to_vec());
            let values = keys
                .iter()
                .filter(|k| **k != 0)
                .map(|k| (*k, u64::from(*k) * u64::from(*k)))
                .collect();
            Ok(Loaded::uncached(values, keys.len()))
        }
    }

    struct Failing;

    #[async_trait]
    impl BatchFn<u32> for Failing {
        type Value = u64;

        async fn load(&self, _keys: &[u32]) -> Result<Loaded<u32, u64>> {
            Err(CoreError::database("boom"))
        }
    }

    #[tokio::test]
    async fn test_load_many_batches_and_orders() {
        let loader = DataLoader::new(Squares::default());
        let values = loader.load_many(&[3, 0, 2, 3]).await.unwrap();
        assert_eq!(values, vec![Some(9), None, Some(4), Some(9)]);

        let calls = loader.batch_fn.calls.lock().clone();
        assert_eq!(calls, vec![vec![3, 0, 2]]);
    }

    #[tokio::test]
    async fn test_concurrent_loads_share_one_batch() {
        let loader = DataLoader::new(Squares::default());
        let (a, b) = tokio::join!(loader.load(5), loader.load(6));
        assert_eq!((a.unwrap(), b.unwrap()), (Some(25), Some(36)));
        assert_eq!(loader.batch_fn.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_memoised_keys_skip_batch_fn() {
        let loader = DataLoader::new(Squares::default());
        loader.load(4).await.unwrap();
        loader.load(4).await.unwrap();
        assert_eq!(loader.batch_fn.calls.lock().len(), 1);

        loader.clear(&4);
        loader.load(4).await.unwrap();
        assert_eq!(loader.batch_fn.calls.lock().len(), 2);

        loader.prime(7, 1);
        assert_eq!(loader.load(7).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_chunks_follow_optimizer_size() {
        let optimizer = Arc::new(BatchOptimizer::new(
            QueryKind::Article,
            OptimizerConfig {
                min_batch_size: 2,
                initial_batch_size: 2,
                ..OptimizerConfig::default()
            },
        ));
        let loader = DataLoader::new(Squares::default()).with_optimizer(optimizer.clone());
        loader.load_many(&[1, 2, 3, 4, 5]).await.unwrap();

        let calls = loader.batch_fn.calls.lock().clone();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|c| c.len() <= 2));
        assert_eq!(optimizer.stats().pending_samples, 3);
    }

    #[tokio::test]
    async fn test_errors_reach_every_waiter() {
        let loader = DataLoader::new(Failing);
        let results = join_all([loader.load(1), loader.load(2)]).await;
        for result in results {
            assert_eq!(result.unwrap_err().code(), ErrorCode::DatabaseQueryFailed);
        }
    }
}
