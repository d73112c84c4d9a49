//! Database layer.
//!
//! The cache core never queries tables directly: loaders, domain caches and
//! the warmer go through the repository traits, implemented on PostgreSQL
//! with sqlx by [`PgRepositories`].

pub mod models;
pub mod postgres;
pub mod repository;

pub use models::{
    ArticleDetail, ArticleSummary, FavoriteRow, FavoriteStatus, FilterOptions, NamedCount,
    RelatedArticle, SearchPage, SearchParams, SiteStats, SourceInfo, TagCount, TagInfo, ViewRow,
    ViewStatus,
};
pub use postgres::PgRepositories;
pub use repository::{AnalyticsRepository, ArticleRepository, FavoriteRepository, ViewRepository};
