//! Read models served by the caches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Article as shown in lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ArticleSummary {
    pub id: String,
    pub title: String,
    pub url: String,
    pub summary: Option<String>,
    pub source_id: Option<String>,
    pub category: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub view_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SourceInfo {
    pub id: String,
    pub name: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TagInfo {
    pub id: String,
    pub name: String,
}

/// Article page payload with its relations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleDetail {
    pub article: ArticleSummary,
    pub content: Option<String>,
    pub source: Option<SourceInfo>,
    pub tags: Vec<TagInfo>,
}

impl ArticleDetail {
    pub fn tag_ids(&self) -> Vec<String> {
        self.tags.iter().map(|t| t.id.clone()).collect()
    }
}

/// Article ranked by the number of tags it shares with another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedArticle {
    pub article: ArticleSummary,
    pub shared_tags: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FavoriteStatus {
    pub article_id: String,
    pub is_favorited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favorited_at: Option<DateTime<Utc>>,
}

impl FavoriteStatus {
    pub fn not_favorited(article_id: impl Into<String>) -> Self {
        Self {
            article_id: article_id.into(),
            is_favorited: false,
            favorited_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewStatus {
    pub article_id: String,
    pub is_viewed: bool,
    pub is_read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

impl ViewStatus {
    pub fn unseen(article_id: impl Into<String>) -> Self {
        Self {
            article_id: article_id.into(),
            is_viewed: false,
            is_read: false,
            viewed_at: None,
            read_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FavoriteRow {
    pub article_id: String,
    pub created_at: DateTime<Utc>,
}

impl From<FavoriteRow> for FavoriteStatus {
    fn from(row: FavoriteRow) -> Self {
        Self {
            article_id: row.article_id,
            is_favorited: true,
            favorited_at: Some(row.created_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ViewRow {
    pub article_id: String,
    pub viewed_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

impl From<ViewRow> for ViewStatus {
    fn from(row: ViewRow) -> Self {
        Self {
            article_id: row.article_id,
            is_viewed: true,
            is_read: row.read_at.is_some(),
            viewed_at: Some(row.viewed_at),
            read_at: row.read_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct NamedCount {
    pub name: String,
    pub count: i64,
}

/// Site-wide counters for the dashboard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteStats {
    pub total_articles: i64,
    pub total_sources: i64,
    pub total_tags: i64,
    pub articles_today: i64,
    pub by_source: Vec<NamedCount>,
    pub by_category: Vec<NamedCount>,
}

/// Search request; its canonical JSON form is the cache key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    20
}

impl SearchParams {
    pub fn query(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            page: default_page(),
            limit: default_limit(),
            ..Default::default()
        }
    }

    /// Trimmed, lower-cased query with sorted, deduplicated tags, so that
    /// equivalent searches share a cache entry.
    pub fn normalized(&self) -> Self {
        let mut tags: Vec<String> = self.tags.iter().map(|t| t.trim().to_lowercase()).collect();
        tags.sort();
        tags.dedup();
        Self {
            query: self.query.trim().to_lowercase(),
            tags,
            source: self.source.clone(),
            category: self.category.clone(),
            page: self.page.max(1),
            limit: self.limit.clamp(1, 100),
        }
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page.max(1) - 1) * i64::from(self.limit)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchPage {
    pub items: Vec<ArticleSummary>,
    pub total: i64,
    pub page: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterOptions {
    pub sources: Vec<SourceInfo>,
    pub categories: Vec<String>,
    pub tags: Vec<TagInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TagCount {
    pub id: String,
    pub name: String,
    pub article_count: i64,
}
