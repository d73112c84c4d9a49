use std::time::Duration;
use tracing::info;

use crate::cache::redis::RedisCache;
use crate::db::{AnalyticsRepository, SiteStats};
use crate::error::Result;

/// Upper bound for a configured stats TTL.
pub const MAX_STATS_TTL: Duration = Duration::from_secs(6 * 3600);

const SITE_KEY: &str = "site";

/// Site-wide statistics, recomputed at most hourly by default.
#[derive(Debug, Clone)]
pub struct StatsCache {
    cache: RedisCache,
    ttl: Duration,
}

impl StatsCache {
    pub fn new(cache: RedisCache) -> Self {
        let ttl = cache.default_ttl().min(MAX_STATS_TTL);
        Self { cache, ttl }
    }

    pub fn cache(&self) -> &RedisCache {
        &self.cache
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Set the TTL, clamped to [`MAX_STATS_TTL`]. Returns the applied value.
    pub fn set_ttl(&mut self, ttl: Duration) -> Duration {
        self.ttl = ttl.clamp(Duration::from_secs(1), MAX_STATS_TTL);
        self.ttl
    }

    pub async fn get(&self, repo: &dyn AnalyticsRepository) -> Result<SiteStats> {
        self.cache
            .get_or_set_with_lock(SITE_KEY, || repo.site_stats(), Some(self.ttl))
            .await
    }

    /// Recompute and store, regardless of what is cached.
    pub async fn refresh(&self, repo: &dyn AnalyticsRepository) -> Result<SiteStats> {
        let stats = repo.site_stats().await?;
        self.cache.try_set(SITE_KEY, &stats, Some(self.ttl)).await?;
        info!(total_articles = stats.total_articles, "Stats cache refreshed");
        Ok(stats)
    }

    pub async fn invalidate(&self) -> u64 {
        self.cache.clear().await
    }
}
