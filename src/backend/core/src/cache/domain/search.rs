use tracing::debug;

use crate::cache::key::hash_params;
use crate::cache::redis::RedisCache;
use crate::db::{AnalyticsRepository, SearchPage, SearchParams};
use crate::error::Result;

/// Search result pages keyed by a hash of the normalized parameters.
#[derive(Debug, Clone)]
pub struct SearchCache {
    cache: RedisCache,
}

impl SearchCache {
    pub fn new(cache: RedisCache) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &RedisCache {
        &self.cache
    }

    /// `results:<hash>`; equivalent searches map to the same key.
    pub fn key(params: &SearchParams) -> String {
        format!("results:{}", hash_params(&params.normalized()))
    }

    pub async fn search(&self, repo: &dyn AnalyticsRepository, params: &SearchParams) -> Result<SearchPage> {
        self.cache
            .get_or_set_with_lock(&Self::key(params), || repo.search(params), None)
            .await
    }

    pub async fn get(&self, params: &SearchParams) -> Option<SearchPage> {
        self.cache.get(&Self::key(params)).await
    }

    pub async fn set(&self, params: &SearchParams, page: &SearchPage) -> bool {
        self.cache.set(&Self::key(params), page, None).await
    }

    /// Execute and store, regardless of what is cached.
    pub async fn refresh(&self, repo: &dyn AnalyticsRepository, params: &SearchParams) -> Result<SearchPage> {
        let page = repo.search(params).await?;
        self.cache.try_set(&Self::key(params), &page, None).await?;
        debug!(query = %params.query, total = page.total, "Search cached");
        Ok(page)
    }

    pub async fn invalidate(&self, params: &SearchParams) -> bool {
        self.cache.delete(&Self::key(params)).await
    }

    /// Drop every cached result, e.g. after articles were ingested.
    pub async fn invalidate_all(&self) -> u64 {
        self.cache.invalidate_pattern("results:*").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equivalent_searches_share_key() {
        let a = SearchParams {
            query: "Rust ".into(),
            tags: vec!["b".into(), "a".into()],
            ..SearchParams::query("")
        };
        let b = SearchParams {
            query: "rust".into(),
            tags: vec!["a".into(), "B".into()],
            ..SearchParams::query("")
        };
        assert_eq!(SearchCache::key(&a), SearchCache::key(&b));
        assert_ne!(SearchCache::key(&a), SearchCache::key(&SearchParams::query("go")));
        assert!(SearchCache::key(&a).starts_with("results:"));
    }
}
