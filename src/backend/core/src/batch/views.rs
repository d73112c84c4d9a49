use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::loader::{BatchFn, DataLoader, Loaded};
use super::optimizer::BatchOptimizer;
use crate::cache::TwoLayerCacheManager;
use crate::db::{ViewRepository, ViewStatus};
use crate::error::Result;

pub fn view_key(user_id: &str, article_id: &str) -> String {
    format!("{user_id}:{article_id}")
}

/// View and read status of one user's articles. Unseen articles are cached
/// as such.
pub struct ViewBatch {
    user_id: String,
    manager: TwoLayerCacheManager<ViewStatus>,
    repo: Arc<dyn ViewRepository>,
}

#[async_trait]
impl BatchFn<String> for ViewBatch {
    type Value = ViewStatus;

    async fn load(&self, article_ids: &[String]) -> Result<Loaded<String, ViewStatus>> {
        let keys: Vec<String> = article_ids.iter().map(|id| view_key(&self.user_id, id)).collect();
        let prefix_len = self.user_id.len() + 1;
        let user_id = self.user_id.as_str();
        let repo = &self.repo;

        let (values, report) = self
            .manager
            .batch_load_with_report(&keys, |missing| async move {
                let ids: Vec<String> = missing.iter().map(|k| k[prefix_len..].to_string()).collect();
                let mut found: HashMap<String, ViewStatus> = repo
                    .find_views(user_id, &ids)
                    .await?
                    .into_iter()
                    .map(|row| (row.article_id.clone(), ViewStatus::from(row)))
                    .collect();
                Ok(missing
                    .into_iter()
                    .zip(ids)
                    .map(|(key, id)| {
                        let status = found.remove(&id).unwrap_or_else(|| ViewStatus::unseen(id));
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

/// Per-request view loader for one user.
#[derive(Clone)]
pub struct ViewLoader {
    user_id: String,
    loader: DataLoader<String, ViewBatch>,
    manager: TwoLayerCacheManager<ViewStatus>,
    repo: Arc<dyn ViewRepository>,
}

impl ViewLoader {
    pub fn new(
        user_id: impl Into<String>,
        manager: TwoLayerCacheManager<ViewStatus>,
        repo: Arc<dyn ViewRepository>,
        optimizer: Arc<BatchOptimizer>,
        window: Duration,
    ) -> Self {
        let user_id = user_id.into();
        let loader = DataLoader::new(ViewBatch {
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

    pub async fn load(&self, article_id: &str) -> Result<ViewStatus> {
        let status = self.loader.load(article_id.to_string()).await?;
        Ok(status.unwrap_or_else(|| ViewStatus::unseen(article_id)))
    }

    pub async fn load_many(&self, article_ids: &[String]) -> Result<Vec<ViewStatus>> {
        let statuses = self.loader.load_many(article_ids).await?;
        Ok(statuses
            .into_iter()
            .zip(article_ids)
            .map(|(status, id)| status.unwrap_or_else(|| ViewStatus::unseen(id.as_str())))
            .collect())
    }

    /// Write-through after the view table changed.
    pub async fn record(&self, status: ViewStatus) {
        let key = view_key(&self.user_id, &status.article_id);
        self.loader.prime(status.article_id.clone(), status.clone());
        if !self.manager.set(&key, status).await {
            debug!(key, "View status not written to L2");
        }
    }

    pub async fn record_view(&self, article_id: &str) -> Result<ViewStatus> {
        let status = ViewStatus::from(self.repo.record_view(&self.user_id, article_id).await?);
        self.record(status.clone()).await;
        Ok(status)
    }

    pub async fn record_read(&self, article_id: &str) -> Result<ViewStatus> {
        let status = ViewStatus::from(self.repo.mark_read(&self.user_id, article_id).await?);
        self.record(status.clone()).await;
        Ok(status)
    }
}

impl std::fmt::Debug for ViewLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewLoader")
            .field("user_id", &self.user_id)
            .field("loader", &self.loader)
            .finish()
    }
}
