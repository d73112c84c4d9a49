#![allow(clippy::result_large_err)]
//! # TechNews Core
//!
//! Caching and batch-loading core of the tech news aggregator.
//!
//! ## Architecture
//!
//! - **Store**: `KeyValueStore` over Redis (or an in-process map for tests)
//! - **Cache**: LRU memory cache (L1), JSON Redis cache (L2) with
//!   stale-while-revalidate and lock-guarded fills, the two-layer manager and
//!   the per-domain caches
//! - **Resilience**: circuit breaker and distributed lock
//! - **Batch**: DataLoader-style loaders with adaptive batch sizes
//! - **Jobs**: tracked background writes, cache warmer, memory optimizer
//! - **DB**: repository traits and their Postgres implementation
//! - **Telemetry**: structured logging and Prometheus metrics

pub mod batch;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod resilience;
pub mod store;
pub mod telemetry;

pub use error::{CoreError, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::batch::{
        ArticleLoader, BatchFn, BatchOptimizer, DataLoader, FavoriteLoader, Loaded, LoaderContext,
        LoaderRepositories, OptimizerConfig, OptimizerRegistry, QueryKind, ViewLoader,
    };
    pub use crate::cache::{
        CacheDomain, CachedData, DomainCacheBuilder, DomainCaches, KeyNamespace, MemoryCache,
        MemoryCacheConfig, RedisCache, ResilientCache, SwrOptions, TwoLayerCacheManager,
    };
    pub use crate::config::Settings;
    pub use crate::error::{CoreError, ErrorCode, ErrorContext, Result};
    pub use crate::jobs::{BackgroundTasks, CacheWarmer, MemoryOptimizer, WarmCategory};
    pub use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState, DistributedLock, LockConfig};
    pub use crate::store::{KeyValueStore, MemoryStore, RedisStore};
}
