//! Domain caches: thin [`RedisCache`] specializations with their own key
//! scheme and TTL.

pub mod article_detail;
pub mod filters;
pub mod search;
pub mod stats;
pub mod tags;
pub mod trends;

pub use article_detail::ArticleDetailCache;
pub use filters::FiltersCache;
pub use search::SearchCache;
pub use stats::{StatsCache, MAX_STATS_TTL};
pub use tags::TagsCache;
pub use trends::TrendsCache;

use serde::Serialize;
use std::sync::Arc;

use super::key::{CacheDomain, KeyNamespace};
use super::redis::{CacheStats, RedisCache, StampedeConfig};
use crate::config::TtlSettings;
use crate::jobs::tasks::BackgroundTasks;
use crate::resilience::DistributedLock;
use crate::store::KeyValueStore;

/// Every domain cache, built once at startup over one shared store.
#[derive(Debug, Clone)]
pub struct DomainCaches {
    pub stats: StatsCache,
    pub trends: TrendsCache,
    pub search: SearchCache,
    pub tags: TagsCache,
    pub filters: FiltersCache,
    pub article_detail: ArticleDetailCache,
}

/// Stats snapshot of one domain cache.
#[derive(Debug, Clone, Serialize)]
pub struct DomainStats {
    pub domain: CacheDomain,
    pub namespace: String,
    #[serde(flatten)]
    pub stats: CacheStats,
}

/// Shared pieces for building domain caches.
#[derive(Clone)]
pub struct DomainCacheBuilder {
    pub store: Arc<dyn KeyValueStore>,
    pub namespace: KeyNamespace,
    pub ttl: TtlSettings,
    pub lock: Option<DistributedLock>,
    pub stampede: StampedeConfig,
    pub tasks: BackgroundTasks,
}

impl std::fmt::Debug for DomainCacheBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainCacheBuilder")
            .field("store", &self.store.name())
            .field("namespace", &self.namespace)
            .field("ttl", &self.ttl)
            .field("lock", &self.lock)
            .field("stampede", &self.stampede)
            .field("tasks", &self.tasks)
            .finish()
    }
}

impl DomainCacheBuilder {
    pub fn new(store: Arc<dyn KeyValueStore>, namespace: KeyNamespace) -> Self {
        Self {
            store,
            namespace,
            ttl: TtlSettings::default(),
            lock: None,
            stampede: StampedeConfig::default(),
            tasks: BackgroundTasks::new(),
        }
    }

    /// A [`RedisCache`] for `domain` with the configured TTL and lock.
    pub fn cache(&self, domain: CacheDomain) -> RedisCache {
        let cache = RedisCache::for_domain(
            Arc::clone(&self.store),
            &self.namespace,
            domain,
            domain.ttl(&self.ttl),
        )
        .with_stampede(self.stampede.clone())
        .with_tasks(self.tasks.clone());
        match &self.lock {
            Some(lock) => cache.with_lock(lock.clone()),
            None => cache,
        }
    }

    pub fn build(&self) -> DomainCaches {
        DomainCaches {
            stats: StatsCache::new(self.cache(CacheDomain::Stats)),
            trends: TrendsCache::new(self.cache(CacheDomain::Trends)),
            search: SearchCache::new(self.cache(CacheDomain::Search)),
            tags: TagsCache::new(self.cache(CacheDomain::Tags)),
            filters: FiltersCache::new(self.cache(CacheDomain::Filters)),
            article_detail: ArticleDetailCache::new(self.cache(CacheDomain::ArticleDetail)),
        }
    }
}

impl DomainCaches {
    pub fn caches(&self) -> [(CacheDomain, &RedisCache); 6] {
        [
            (CacheDomain::Stats, self.stats.cache()),
            (CacheDomain::Trends, self.trends.cache()),
            (CacheDomain::Search, self.search.cache()),
            (CacheDomain::Tags, self.tags.cache()),
            (CacheDomain::Filters, self.filters.cache()),
            (CacheDomain::ArticleDetail, self.article_detail.cache()),
        ]
    }

    pub fn get(&self, domain: CacheDomain) -> Option<&RedisCache> {
        self.caches()
            .into_iter()
            .find(|(d, _)| *d == domain)
            .map(|(_, cache)| cache)
    }

    pub fn stats(&self) -> Vec<DomainStats> {
        self.caches()
            .into_iter()
            .map(|(domain, cache)| DomainStats {
                domain,
                namespace: cache.namespace().to_string(),
                stats: cache.stats(),
            })
            .collect()
    }

    pub fn reset_stats(&self) {
        for (_, cache) in self.caches() {
            cache.reset_stats();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Duration;

    #[test]
    fn test_builder_applies_namespace_and_ttl() {
        let mut builder = DomainCacheBuilder::new(Arc::new(MemoryStore::new()), KeyNamespace::new("tn", "test"));
        builder.ttl.search = Some(Duration::from_secs(42));
        let caches = builder.build();

        assert_eq!(caches.search.cache().namespace(), "tn:test:search");
        assert_eq!(caches.search.cache().default_ttl(), Duration::from_secs(42));
        assert_eq!(caches.stats.ttl(), Duration::from_secs(3600));
        assert_eq!(
            caches.get(CacheDomain::ArticleDetail).map(|c| c.namespace()),
            Some("tn:test:article-detail")
        );
        assert!(caches.get(CacheDomain::Lock).is_none());
    }

    #[test]
    fn test_stats_ttl_is_clamped() {
        let builder = DomainCacheBuilder::new(Arc::new(MemoryStore::new()), KeyNamespace::default());
        let mut stats = builder.build().stats;
        assert_eq!(stats.set_ttl(Duration::from_secs(24 * 3600)), MAX_STATS_TTL);
        assert_eq!(stats.set_ttl(Duration::from_secs(600)), Duration::from_secs(600));
    }
}
