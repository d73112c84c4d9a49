//! Shared loader state, built once at startup.
//!
//! The context owns the long-lived pieces (two-layer managers, optimizers,
//! repositories). Loaders handed out by it are per request: their memo dies
//! with the request while the caches and optimizer history survive.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use super::articles::{ArticleBatch, ArticleLoader};
use super::favorites::FavoriteLoader;
use super::optimizer::{OptimizerRegistry, OptimizerStats, QueryKind};
use super::views::ViewLoader;
use crate::cache::{
    CacheDomain, KeyNamespace, MemoryCacheConfig, RedisCache, TwoLayerCacheManager, TwoLayerStats,
};
use crate::config::Settings;
use crate::db::{
    ArticleRepository, ArticleSummary, FavoriteRepository, FavoriteStatus, ViewRepository, ViewStatus,
};
use crate::jobs::tasks::BackgroundTasks;
use crate::resilience::CircuitBreaker;
use crate::store::KeyValueStore;

/// Database access used by the loaders.
#[derive(Clone)]
pub struct LoaderRepositories {
    pub articles: Arc<dyn ArticleRepository>,
    pub favorites: Arc<dyn FavoriteRepository>,
    pub views: Arc<dyn ViewRepository>,
}

impl LoaderRepositories {
    /// Use one backend for every repository.
    pub fn shared<R>(repo: Arc<R>) -> Self
    where
        R: ArticleRepository + FavoriteRepository + ViewRepository + 'static,
    {
        Self {
            articles: repo.clone(),
            favorites: repo.clone(),
            views: repo,
        }
    }
}

/// Layer stats of the three loader caches.
#[derive(Debug, Clone, Serialize)]
pub struct LoaderStats {
    pub articles: TwoLayerStats,
    pub favorites: TwoLayerStats,
    pub views: TwoLayerStats,
    pub optimizers: Vec<OptimizerStats>,
}

/// Pieces shared by every request's loaders.
#[derive(Clone)]
pub struct LoaderContext {
    articles: TwoLayerCacheManager<ArticleSummary>,
    favorites: TwoLayerCacheManager<FavoriteStatus>,
    views: TwoLayerCacheManager<ViewStatus>,
    optimizers: Arc<OptimizerRegistry>,
    repos: LoaderRepositories,
    window: Duration,
}

impl LoaderContext {
    pub fn new(
        settings: &Settings,
        store: Arc<dyn KeyValueStore>,
        namespace: &KeyNamespace,
        repos: LoaderRepositories,
        tasks: BackgroundTasks,
        breaker: Option<Arc<CircuitBreaker>>,
    ) -> Self {
        let build = Layers {
            l1: MemoryCacheConfig::from(&settings.memory_cache),
            store: &store,
            namespace,
            settings,
            tasks: &tasks,
            breaker: &breaker,
        };
        let articles = build.manager(CacheDomain::Article);
        let favorites = build.manager(CacheDomain::Favorite);
        let views = build.manager(CacheDomain::View);

        Self {
            articles,
            favorites,
            views,
            optimizers: Arc::new(OptimizerRegistry::from(&settings.batch)),
            repos,
            window: settings.batch.window,
        }
    }

    /// Build from already constructed managers, e.g. in tests.
    pub fn from_parts(
        articles: TwoLayerCacheManager<ArticleSummary>,
        favorites: TwoLayerCacheManager<FavoriteStatus>,
        views: TwoLayerCacheManager<ViewStatus>,
        optimizers: Arc<OptimizerRegistry>,
        repos: LoaderRepositories,
        window: Duration,
    ) -> Self {
        Self {
            articles,
            favorites,
            views,
            optimizers,
            repos,
            window,
        }
    }

    pub fn article_loader(&self) -> ArticleLoader {
        ArticleLoader::new(ArticleBatch::new(self.articles.clone(), Arc::clone(&self.repos.articles)))
            .with_optimizer(Arc::clone(self.optimizers.get(QueryKind::Article)))
            .with_window(self.window)
    }

    pub fn favorite_loader(&self, user_id: &str) -> FavoriteLoader {
        FavoriteLoader::new(
            user_id,
            self.favorites.clone(),
            Arc::clone(&self.repos.favorites),
            Arc::clone(self.optimizers.get(QueryKind::Favorite)),
            self.window,
        )
    }

    pub fn view_loader(&self, user_id: &str) -> ViewLoader {
        ViewLoader::new(
            user_id,
            self.views.clone(),
            Arc::clone(&self.repos.views),
            Arc::clone(self.optimizers.get(QueryKind::View)),
            self.window,
        )
    }

    pub fn optimizers(&self) -> &OptimizerRegistry {
        &self.optimizers
    }

    pub fn article_cache(&self) -> &TwoLayerCacheManager<ArticleSummary> {
        &self.articles
    }

    pub fn favorite_cache(&self) -> &TwoLayerCacheManager<FavoriteStatus> {
        &self.favorites
    }

    pub fn view_cache(&self) -> &TwoLayerCacheManager<ViewStatus> {
        &self.views
    }

    pub fn stats(&self) -> LoaderStats {
        LoaderStats {
            articles: self.articles.stats(),
            favorites: self.favorites.stats(),
            views: self.views.stats(),
            optimizers: self.optimizers.stats(),
        }
    }

    /// Drop every cached article summary in both layers.
    pub async fn invalidate_articles(&self) -> u64 {
        self.articles.invalidate_pattern("*").await.unwrap_or(0)
    }
}

struct Layers<'a> {
    l1: MemoryCacheConfig,
    store: &'a Arc<dyn KeyValueStore>,
    namespace: &'a KeyNamespace,
    settings: &'a Settings,
    tasks: &'a BackgroundTasks,
    breaker: &'a Option<Arc<CircuitBreaker>>,
}

impl Layers<'_> {
    fn manager<V>(&self, domain: CacheDomain) -> TwoLayerCacheManager<V>
    where
        V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let l2 = RedisCache::for_domain(
            Arc::clone(self.store),
            self.namespace,
            domain,
            domain.ttl(&self.settings.ttl),
        )
        .with_tasks(self.tasks.clone());
        let manager = TwoLayerCacheManager::new(self.l1.clone(), l2).with_tasks(self.tasks.clone());
        match self.breaker {
            Some(breaker) => manager.with_breaker(Arc::clone(breaker)),
            None => manager,
        }
    }
}

impl std::fmt::Debug for LoaderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderContext")
            .field("articles", &self.articles)
            .field("favorites", &self.favorites)
            .field("views", &self.views)
            .field("window", &self.window)
            .finish()
    }
}
