//! Batch loading.
//!
//! Request handlers ask a per-request loader for single keys; the loader
//! collects the keys of one batch window and resolves them through the
//! shared [`TwoLayerCacheManager`](crate::cache::TwoLayerCacheManager).
//! Every dispatched batch is reported to the optimizer of its
//! [`QueryKind`], which retunes the batch size for the next dispatch.
//!
//! ```text
//! handler ──load(k)──► DataLoader ──chunk──► BatchFn ──► L1 / L2 / DB
//!                          ▲                    │
//!                          └── batch_size ◄── BatchOptimizer ◄── BatchMetrics
//! ```

pub mod articles;
pub mod context;
pub mod favorites;
pub mod loader;
pub mod optimizer;
pub mod views;

pub use articles::{ArticleBatch, ArticleLoader};
pub use context::{LoaderContext, LoaderRepositories, LoaderStats};
pub use favorites::{favorite_key, FavoriteBatch, FavoriteLoader};
pub use loader::{BatchFn, DataLoader, Loaded, DEFAULT_BATCH_WINDOW};
pub use optimizer::{
    Adjustment, BatchMetrics, BatchOptimizer, OptimizerConfig, OptimizerRegistry, OptimizerStats,
    QueryKind, WindowSummary,
};
pub use views::{view_key, ViewBatch, ViewLoader};
