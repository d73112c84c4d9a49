//! Multi-layer caching for the news API.
//!
//! - **Memory (L1)**: process-local LRU with per-entry TTL
//! - **Redis (L2)**: namespaced, best-effort, shared across processes
//! - **Two-layer manager**: L1 → L2 → one batched database fetch
//! - **Stampede protection**: distributed-lock guarded read-through
//! - **Stale-while-revalidate**: serve old data, refresh in the background
//! - **Resilient cache**: circuit breaker with an in-memory fallback
//! - **Domain caches**: stats, trends, search, tags, filters, article detail
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │              Batch loaders / domain caches                 │
//! ├────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────┐      ┌────────────────────────┐  │
//! │  │ TwoLayerCacheManager │      │ RedisCache (+SWR, lock)│  │
//! │  └─────┬──────────┬─────┘      └───────────┬────────────┘  │
//! │        ▼          ▼                        ▼               │
//! │  ┌───────────┐ ┌────────────────────────────────────────┐  │
//! │  │MemoryCache│ │        KeyValueStore (Redis/memory)    │  │
//! │  └───────────┘ └────────────────────────────────────────┘  │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use technews_core::cache::{KeyNamespace, CacheDomain, RedisCache};
//!
//! let ns = KeyNamespace::new("technews", "production");
//! let search = RedisCache::for_domain(store, &ns, CacheDomain::Search, CacheDomain::Search.default_ttl())
//!     .with_lock(lock);
//!
//! let page = search
//!     .get_or_set_with_lock(&key, || repo.search(&params), None)
//!     .await?;
//!
//! search.invalidate_pattern("results:*").await;
//! ```

pub mod domain;
pub mod key;
pub mod memory;
pub mod redis;
pub mod resilient;
pub mod swr;
pub mod two_layer;

pub use domain::{
    ArticleDetailCache, DomainCacheBuilder, DomainCaches, DomainStats, FiltersCache, SearchCache,
    StatsCache, TagsCache, TrendsCache,
};
pub use key::{hash_params, short_hash, sorted_ids, CacheDomain, KeyNamespace};
pub use memory::{MemoryCache, MemoryCacheConfig, MemoryCacheStats};
pub use redis::{CacheStats, RedisCache, StampedeConfig, DELETE_BATCH_SIZE};
pub use resilient::{ResilientCache, ResilientHealth};
pub use swr::{CachedData, Freshness, SwrOptions};
pub use two_layer::{BatchReport, TwoLayerCacheManager, TwoLayerStats};
