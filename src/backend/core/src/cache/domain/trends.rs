use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::cache::redis::RedisCache;
use crate::cache::swr::{CachedData, SwrOptions};
use crate::db::{AnalyticsRepository, NamedCount};
use crate::error::Result;

pub const DEFAULT_TREND_WINDOW: Duration = Duration::from_secs(7 * 24 * 3600);
pub const DEFAULT_TREND_LIMIT: u32 = 20;

/// Trending tags and keywords, served stale-while-revalidate.
#[derive(Debug, Clone)]
pub struct TrendsCache {
    cache: RedisCache,
}

impl TrendsCache {
    pub fn new(cache: RedisCache) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &RedisCache {
        &self.cache
    }

    /// `tags:<window hours>h:<limit>`
    pub fn tags_key(window: Duration, limit: u32) -> String {
        format!("tags:{}h:{}", window.as_secs() / 3600, limit)
    }

    /// `keywords:<window hours>h:<limit>`
    pub fn keywords_key(window: Duration, limit: u32) -> String {
        format!("keywords:{}h:{}", window.as_secs() / 3600, limit)
    }

    /// Entries turn stale at half their TTL.
    fn swr_options(&self) -> SwrOptions {
        let ttl = self.cache.default_ttl();
        SwrOptions::new(ttl / 2, ttl)
    }

    pub async fn trending_tags(
        &self,
        repo: Arc<dyn AnalyticsRepository>,
        window: Duration,
        limit: u32,
    ) -> Result<Vec<NamedCount>> {
        let since = Utc::now() - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(7));
        self.cache
            .get_swr(
                &Self::tags_key(window, limit),
                move || async move { repo.trending_tags(since, limit).await },
                self.swr_options(),
            )
            .await
    }

    pub async fn trending_keywords(
        &self,
        repo: Arc<dyn AnalyticsRepository>,
        window: Duration,
        limit: u32,
    ) -> Result<Vec<NamedCount>> {
        let since = Utc::now() - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(7));
        self.cache
            .get_swr(
                &Self::keywords_key(window, limit),
                move || async move { repo.trending_keywords(since, limit).await },
                self.swr_options(),
            )
            .await
    }

    /// Recompute the default tag window.
    pub async fn refresh_tags(&self, repo: &dyn AnalyticsRepository) -> Result<usize> {
        let since = Utc::now() - chrono::Duration::days(7);
        let tags = repo.trending_tags(since, DEFAULT_TREND_LIMIT).await?;
        let key = Self::tags_key(DEFAULT_TREND_WINDOW, DEFAULT_TREND_LIMIT);
        self.cache.try_set(&key, &CachedData::new(&tags), None).await?;
        info!(tags = tags.len(), "Trending tags refreshed");
        Ok(tags.len())
    }

    /// Recompute the default keyword window.
    pub async fn refresh_keywords(&self, repo: &dyn AnalyticsRepository) -> Result<usize> {
        let since = Utc::now() - chrono::Duration::days(7);
        let keywords = repo.trending_keywords(since, DEFAULT_TREND_LIMIT).await?;
        let key = Self::keywords_key(DEFAULT_TREND_WINDOW, DEFAULT_TREND_LIMIT);
        self.cache.try_set(&key, &CachedData::new(&keywords), None).await?;
        info!(keywords = keywords.len(), "Trending keywords refreshed");
        Ok(keywords.len())
    }

    pub async fn invalidate(&self) -> u64 {
        self.cache.clear().await
    }
}
