use async_trait::async_trait;
use std::sync::Arc;

use super::loader::{BatchFn, DataLoader, Loaded};
use crate::cache::TwoLayerCacheManager;
use crate::db::{ArticleRepository, ArticleSummary};
use crate::error::Result;

/// Article summaries through the shared two-layer cache.
pub struct ArticleBatch {
    manager: TwoLayerCacheManager<ArticleSummary>,
    repo: Arc<dyn ArticleRepository>,
}

impl ArticleBatch {
    pub fn new(manager: TwoLayerCacheManager<ArticleSummary>, repo: Arc<dyn ArticleRepository>) -> Self {
        Self { manager, repo }
    }
}

#[async_trait]
impl BatchFn<String> for ArticleBatch {
    type Value = ArticleSummary;

    async fn load(&self, keys: &[String]) -> Result<Loaded<String, ArticleSummary>> {
        let repo = &self.repo;
        let (values, report) = self
            .manager
            .batch_load_with_report(keys, |missing| async move { repo.find_by_ids(&missing).await })
            .await?;
        Ok(Loaded {
            values: keys
                .iter()
                .cloned()
                .zip(values)
                .filter_map(|(k, v)| v.map(|v| (k, v)))
                .collect(),
            cache_hits: report.cache_hits(),
            cache_misses: report.cache_misses(),
        })
    }
}

pub type ArticleLoader = DataLoader<String, ArticleBatch>;
