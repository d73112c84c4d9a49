use crate::cache::redis::RedisCache;
use crate::db::{AnalyticsRepository, FilterOptions};
use crate::error::Result;

const OPTIONS_KEY: &str = "options";

/// Source, category and tag choices for the filter sidebar.
#[derive(Debug, Clone)]
pub struct FiltersCache {
    cache: RedisCache,
}

impl FiltersCache {
    pub fn new(cache: RedisCache) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &RedisCache {
        &self.cache
    }

    pub async fn options(&self, repo: &dyn AnalyticsRepository) -> Result<FilterOptions> {
        self.cache
            .get_or_set_with_lock(OPTIONS_KEY, || repo.filter_options(), None)
            .await
    }

    pub async fn invalidate(&self) -> bool {
        self.cache.delete(OPTIONS_KEY).await
    }
}
