use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::loader::{BatchFn, DataLoader, Loaded};
use super::optimizer::BatchOptimizer;
use crate::cache::TwoLayerCacheManager;
use crate::db::{FavoriteRepository, FavoriteStatus};
use crate::error::Result;

/// `<user>:<article>`, the two-layer cache key of one status.
pub fn favorite_key(user_id: &str, article_id: &str) -> String {
    format!("{user_id}:{article_id}")
}

/// Favorite status of one user's articles.
///
/// Every requested article resolves to a status; articles without a
/// favorite row are cached as not favorited.
pub struct FavoriteBatch {
    user_id: String,
    manager: TwoLayerCacheManager<FavoriteStatus>,
    repo: Arc<dyn FavoriteRepository>,
}

#[async_trait]
impl BatchFn<String> for FavoriteBatch {
    type Value = FavoriteStatus;

    async fn load(&self, article_ids: &[String]) -> Result<Loaded<String, FavoriteStatus>> {
        let keys: Vec<String> = article_ids.iter().map(|id| favorite_key(&self.user_id, id)).collect();
        let prefix_len = self.user_id.len() + 1;
        let user_id = self.user_id.as_str();
        let repo = &self.repo;

        let (values, report) = self
            .manager
            .batch_load_with_report(&keys, |missing| async move {
                let ids: Vec<String> = missing.iter().map(|k| k[prefix_len..].to_string()).collect();
                let mut found: HashMap<String, FavoriteStatus> = repo
                    .find_favorites(user_id, &ids)
                    .await?
                    .into_iter()
                    .map(|row| (row.article_id.clone(), FavoriteStatus::from(row)))
                    .collect();
                Ok(missing
                    .into_iter()
                    .zip(ids)
                    .map(|(key, id)| {
                        let status = found.remove(&id).unwrap_or_else(|| FavoriteStatus::not_favorited(id));
                        (key, status)
                    })
                    .collect())
            })
            .await?;

        Ok(Loaded {
            values: article_ids
                .iter()
                .cloned()
                .zip(values)
                .filter_map(|(id, v)| v.map(|v| (id, v)))
                .collect(),
            cache_hits: report.cache_hits(),
            cache_misses: report.cache_misses(),
        })
    }
}

/// Per-request favorite loader for one user.
#[derive(Clone)]
pub struct FavoriteLoader {
    user_id: String,
    loader: DataLoader<String, FavoriteBatch>,
    manager: TwoLayerCacheManager<FavoriteStatus>,
    repo: Arc<dyn FavoriteRepository>,
}

impl FavoriteLoader {
    pub fn new(
        user_id: impl Into<String>,
        manager: TwoLayerCacheManager<FavoriteStatus>,
        repo: Arc<dyn FavoriteRepository>,
        optimizer: Arc<BatchOptimizer>,
        window: Duration,
    ) -> Self {
        let user_id = user_id.into();
        let loader = DataLoader::new(FavoriteBatch {
            user_id: user_id.clone(),
            manager: manager.clone(),
            repo: Arc::clone(&repo),
        })
        .with_optimizer(optimizer)
        .with_window(window);
        Self {
            user_id,
            loader,
            manager,
            repo,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub async fn load(&self, article_id: &str) -> Result<FavoriteStatus> {
        let status = self.loader.load(article_id.to_string()).await?;
        Ok(status.unwrap_or_else(|| FavoriteStatus::not_favorited(article_id)))
    }

    /// Statuses in the order of `article_ids`.
    pub async fn load_many(&self, article_ids: &[String]) -> Result<Vec<FavoriteStatus>> {
        let statuses = self.loader.load_many(article_ids).await?;
        Ok(statuses
            .into_iter()
            .zip(article_ids)
            .map(|(status, id)| status.unwrap_or_else(|| FavoriteStatus::not_favorited(id.as_str())))
            .collect())
    }

    /// Write-through after the favorite table changed.
    pub async fn record(&self, status: FavoriteStatus) {
        let key = favorite_key(&self.user_id, &status.article_id);
        self.loader.prime(status.article_id.clone(), status.clone());
        if !self.manager.set(&key, status).await {
            debug!(key, "Favorite status not written to L2");
        }
    }

    /// Favorite an article, then update both cache layers.
    pub async fn add(&self, article_id: &str) -> Result<FavoriteStatus> {
        let row = self.repo.add_favorite(&self.user_id, article_id).await?;
        let status = FavoriteStatus::from(row);
        self.record(status.clone()).await;
        Ok(status)
    }

    /// Unfavorite an article, then update both cache layers.
    pub async fn remove(&self, article_id: &str) -> Result<FavoriteStatus> {
        self.repo.remove_favorite(&self.user_id, article_id).await?;
        let status = FavoriteStatus::not_favorited(article_id);
        self.record(status.clone()).await;
        Ok(status)
    }
}

impl std::fmt::Debug for FavoriteLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FavoriteLoader")
            .field("user_id", &self.user_id)
            .field("loader", &self.loader)
            .finish()
    }
}
