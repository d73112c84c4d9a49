use tracing::debug;

use crate::cache::key::{short_hash, sorted_ids};
use crate::cache::redis::RedisCache;
use crate::db::{ArticleDetail, ArticleRepository, RelatedArticle};
use crate::error::{CoreError, ErrorCode, Result};

pub const DEFAULT_RELATED_LIMIT: u32 = 5;

/// Article pages with relations, plus related articles scored by shared tags.
#[derive(Debug, Clone)]
pub struct ArticleDetailCache {
    cache: RedisCache,
}

impl ArticleDetailCache {
    pub fn new(cache: RedisCache) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &RedisCache {
        &self.cache
    }

    pub fn detail_key(id: &str) -> String {
        format!("detail:{id}")
    }

    /// `related:<id>:<hash of sorted tag ids>:<limit>`; retagging an
    /// article changes the key.
    pub fn related_key(id: &str, tag_ids: &[String], limit: u32) -> String {
        format!("related:{id}:{}:{limit}", short_hash(sorted_ids(tag_ids)))
    }

    /// The article with source and tags, or `None` if it does not exist.
    /// Missing articles are not cached.
    pub async fn detail(&self, repo: &dyn ArticleRepository, id: &str) -> Result<Option<ArticleDetail>> {
        let fetch = || async {
            repo.find_detail(id)
                .await?
                .ok_or_else(|| CoreError::not_found(format!("article {id}")))
        };
        match self.cache.get_or_set_with_lock(&Self::detail_key(id), fetch, None).await {
            Ok(detail) => Ok(Some(detail)),
            Err(e) if e.code() == ErrorCode::RecordNotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn related(
        &self,
        repo: &dyn ArticleRepository,
        detail: &ArticleDetail,
        limit: u32,
    ) -> Result<Vec<RelatedArticle>> {
        let id = detail.article.id.as_str();
        let tag_ids = detail.tag_ids();
        if tag_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.cache
            .get_or_set_with_lock(
                &Self::related_key(id, &tag_ids, limit),
                || repo.find_related(id, &tag_ids, limit),
                None,
            )
            .await
    }

    pub async fn detail_with_related(
        &self,
        repo: &dyn ArticleRepository,
        id: &str,
        limit: u32,
    ) -> Result<Option<(ArticleDetail, Vec<RelatedArticle>)>> {
        let Some(detail) = self.detail(repo, id).await? else {
            return Ok(None);
        };
        let related = self.related(repo, &detail, limit).await?;
        Ok(Some((detail, related)))
    }

    /// Drop the article's detail and related entries after an edit.
    pub async fn invalidate_article(&self, id: &str) -> u64 {
        let detail = u64::from(self.cache.delete(&Self::detail_key(id)).await);
        let related = self.cache.invalidate_pattern(&format!("related:{id}:*")).await;
        debug!(id, detail, related, "Article caches invalidated");
        detail + related
    }

    pub async fn invalidate_all(&self) -> u64 {
        self.cache.clear().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ArticleSummary, TagInfo};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn summary(id: &str) -> ArticleSummary {
        ArticleSummary {
            id: id.to_string(),
            title: format!("Title {id}"),
            url: format!("https://news.example/{id}"),
            summary: None,
            source_id: None,
            category: None,
            published_at: None,
            view_count: 0,
        }
    }

    #[derive(Default)]
    struct Articles {
        detail_calls: Mutex<u32>,
        related_calls: Mutex<u32>,
    }

    #[async_trait]
    impl ArticleRepository for Articles {
        async fn find_by_ids(&self, _ids: &[String]) -> Result<HashMap<String, ArticleSummary>> {
            Ok(HashMap::new())
        }

        async fn find_detail(&self, id: &str) -> Result<Option<ArticleDetail>> {
            *self.detail_calls.lock() += 1;
            Ok((id == "a1").then(|| ArticleDetail {
                article: summary(id),
                content: Some("body".into()),
                source: None,
                tags: vec![
                    TagInfo { id: "t1".into(), name: "rust".into() },
                    TagInfo { id: "t2".into(), name: "async".into() },
                ],
            }))
        }

        async fn find_related(&self, _id: &str, tag_ids: &[String], limit: u32) -> Result<Vec<RelatedArticle>> {
            *self.related_calls.lock() += 1;
            assert_eq!(tag_ids.len(), 2);
            Ok(["a2", "a3"]
                .iter()
                .take(limit as usize)
                .map(|id| RelatedArticle { article: summary(id), shared_tags: 1 })
                .collect())
        }
    }

    fn cache() -> ArticleDetailCache {
        ArticleDetailCache::new(RedisCache::new(
            Arc::new(MemoryStore::new()),
            "tn:test:article-detail",
            Duration::from_secs(60),
        ))
    }

    #[tokio::test]
    async fn test_detail_with_related_is_cached() {
        let cache = cache();
        let repo = Articles::default();

        let (detail, related) = cache.detail_with_related(&repo, "a1", 5).await.unwrap().unwrap();
        assert_eq!(detail.article.id, "a1");
        assert_eq!(related.len(), 2);

        cache.detail_with_related(&repo, "a1", 5).await.unwrap();
        assert_eq!(*repo.detail_calls.lock(), 1);
        assert_eq!(*repo.related_calls.lock(), 1);
    }

    #[tokio::test]
    async fn test_missing_article_is_not_cached() {
        let cache = cache();
        let repo = Articles::default();

        assert!(cache.detail_with_related(&repo, "gone", 5).await.unwrap().is_none());
        assert!(cache.detail(&repo, "gone").await.unwrap().is_none());
        assert_eq!(*repo.detail_calls.lock(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_article_drops_detail_and_related() {
        let cache = cache();
        let repo = Articles::default();
        cache.detail_with_related(&repo, "a1", 5).await.unwrap();
        cache.detail_with_related(&repo, "a1", 1).await.unwrap();

        assert_eq!(cache.invalidate_article("a1").await, 3);
        cache.detail_with_related(&repo, "a1", 5).await.unwrap();
        assert_eq!(*repo.detail_calls.lock(), 2);
    }

    #[test]
    fn test_related_key_ignores_tag_order() {
        let a = ArticleDetailCache::related_key("a1", &["t2".into(), "t1".into()], 5);
        let b = ArticleDetailCache::related_key("a1", &["t1".into(), "t2".into(), "t1".into()], 5);
        assert_eq!(a, b);
        assert!(a.starts_with("related:a1:"));
        assert_ne!(a, ArticleDetailCache::related_key("a1", &["t3".into()], 5));
    }
}
