use crate::cache::redis::RedisCache;
use crate::db::{AnalyticsRepository, TagCount};
use crate::error::Result;

pub const DEFAULT_TAG_LIMIT: u32 = 100;

/// Tag listings with article counts.
#[derive(Debug, Clone)]
pub struct TagsCache {
    cache: RedisCache,
}

impl TagsCache {
    pub fn new(cache: RedisCache) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &RedisCache {
        &self.cache
    }

    pub fn key(limit: u32) -> String {
        format!("list:{limit}")
    }

    pub async fn list(&self, repo: &dyn AnalyticsRepository, limit: u32) -> Result<Vec<TagCount>> {
        self.cache
            .get_or_set_with_lock(&Self::key(limit), || repo.list_tags(limit), None)
            .await
    }

    pub async fn invalidate(&self) -> u64 {
        self.cache.clear().await
    }
}
