//! Data access consumed by loaders, domain caches and the warmer.
//!
//! The cache core only sees these traits; [`PgRepositories`](super::PgRepositories)
//! implements them on Postgres and tests supply in-memory fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use super::models::{
    ArticleDetail, ArticleSummary, FavoriteRow, FilterOptions, NamedCount, RelatedArticle,
    SearchPage, SearchParams, SiteStats, TagCount, ViewRow,
};
use crate::error::Result;

#[async_trait]
pub trait ArticleRepository: Send + Sync {
    /// Summaries for the given ids; unknown ids are absent from the map.
    async fn find_by_ids(&self, ids: &[String]) -> Result<HashMap<String, ArticleSummary>>;

    async fn find_detail(&self, id: &str) -> Result<Option<ArticleDetail>>;

    /// Articles sharing tags with `id`, best match first.
    async fn find_related(&self, id: &str, tag_ids: &[String], limit: u32) -> Result<Vec<RelatedArticle>>;
}

#[async_trait]
pub trait FavoriteRepository: Send + Sync {
    /// Favorite rows of `user_id` restricted to `article_ids`.
    async fn find_favorites(&self, user_id: &str, article_ids: &[String]) -> Result<Vec<FavoriteRow>>;

    async fn add_favorite(&self, user_id: &str, article_id: &str) -> Result<FavoriteRow>;

    /// Returns whether a row was removed.
    async fn remove_favorite(&self, user_id: &str, article_id: &str) -> Result<bool>;
}

#[async_trait]
pub trait ViewRepository: Send + Sync {
    async fn find_views(&self, user_id: &str, article_ids: &[String]) -> Result<Vec<ViewRow>>;

    async fn record_view(&self, user_id: &str, article_id: &str) -> Result<ViewRow>;

    async fn mark_read(&self, user_id: &str, article_id: &str) -> Result<ViewRow>;
}

#[async_trait]
pub trait AnalyticsRepository: Send + Sync {
    async fn site_stats(&self) -> Result<SiteStats>;

    async fn trending_tags(&self, since: DateTime<Utc>, limit: u32) -> Result<Vec<NamedCount>>;

    async fn trending_keywords(&self, since: DateTime<Utc>, limit: u32) -> Result<Vec<NamedCount>>;

    /// Most frequent recent search queries.
    async fn popular_searches(&self, limit: u32) -> Result<Vec<String>>;

    async fn search(&self, params: &SearchParams) -> Result<SearchPage>;

    async fn list_tags(&self, limit: u32) -> Result<Vec<TagCount>>;

    async fn filter_options(&self) -> Result<FilterOptions>;
}
