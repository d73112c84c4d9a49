//! Postgres implementation of the repository traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::models::{
    ArticleDetail, ArticleSummary, FavoriteRow, FilterOptions, NamedCount, RelatedArticle,
    SearchPage, SearchParams, SiteStats, SourceInfo, TagCount, TagInfo, ViewRow,
};
use super::repository::{AnalyticsRepository, ArticleRepository, FavoriteRepository, ViewRepository};
use crate::config::DatabaseSettings;
use crate::error::Result;

/// Queries slower than this are logged at warn.
const SLOW_QUERY_THRESHOLD: Duration = Duration::from_millis(200);

const ARTICLE_COLUMNS: &str =
    "a.id, a.title, a.url, a.summary, a.source_id, a.category, a.published_at, a.view_count";

/// Shared by the search page and count queries.
const SEARCH_FILTER: &str = r#"
    WHERE ($1 = '' OR a.title ILIKE '%' || $1 || '%' OR a.summary ILIKE '%' || $1 || '%')
      AND ($2::text IS NULL OR a.source_id = $2)
      AND ($3::text IS NULL OR a.category = $3)
      AND (cardinality($4::text[]) = 0 OR EXISTS (
            SELECT 1 FROM article_tags at
            JOIN tags t ON t.id = at.tag_id
            WHERE at.article_id = a.id AND lower(t.name) = ANY($4)))
"#;

#[derive(Debug, sqlx::FromRow)]
struct DetailRow {
    #[sqlx(flatten)]
    article: ArticleSummary,
    content: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct RelatedRow {
    #[sqlx(flatten)]
    article: ArticleSummary,
    shared_tags: i64,
}

/// Every repository over one connection pool.
#[derive(Clone)]
pub struct PgRepositories {
    pool: PgPool,
}

impl std::fmt::Debug for PgRepositories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgRepositories")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

impl PgRepositories {
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&settings.url)
            .await?;
        info!(max_connections = settings.max_connections, "Database pool ready");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn timed<T, Fut>(&self, query: &'static str, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let started = Instant::now();
        let result = fut.await;
        let elapsed = started.elapsed();
        metrics::histogram!("technews_db_query_duration_seconds", "query" => query)
            .record(elapsed.as_secs_f64());
        if elapsed > SLOW_QUERY_THRESHOLD {
            warn!(query, elapsed_ms = elapsed.as_millis() as u64, "Slow query");
        }
        Ok(result?)
    }
}

#[async_trait]
impl ArticleRepository for PgRepositories {
    async fn find_by_ids(&self, ids: &[String]) -> Result<HashMap<String, ArticleSummary>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles a WHERE a.id = ANY($1)");
        let rows = self
            .timed(
                "articles_by_ids",
                sqlx::query_as::<_, ArticleSummary>(&sql)
                    .bind(ids)
                    .fetch_all(&self.pool),
            )
            .await?;
        Ok(rows.into_iter().map(|a| (a.id.clone(), a)).collect())
    }

    async fn find_detail(&self, id: &str) -> Result<Option<ArticleDetail>> {
        let sql = format!("SELECT {ARTICLE_COLUMNS}, a.content FROM articles a WHERE a.id = $1");
        let Some(row) = self
            .timed(
                "article_detail",
                sqlx::query_as::<_, DetailRow>(&sql).bind(id).fetch_optional(&self.pool),
            )
            .await?
        else {
            return Ok(None);
        };

        let source = match &row.article.source_id {
            Some(source_id) => {
                self.timed(
                    "article_source",
                    sqlx::query_as::<_, SourceInfo>("SELECT id, name, url FROM sources WHERE id = $1")
                        .bind(source_id)
                        .fetch_optional(&self.pool),
                )
                .await?
            }
            None => None,
        };

        let tags = self
            .timed(
                "article_tags",
                sqlx::query_as::<_, TagInfo>(
                    r#"
                    SELECT t.id, t.name
                    FROM tags t
                    JOIN article_tags at ON at.tag_id = t.id
                    WHERE at.article_id = $1
                    ORDER BY t.name
                    "#,
                )
                .bind(id)
                .fetch_all(&self.pool),
            )
            .await?;

        Ok(Some(ArticleDetail {
            article: row.article,
            content: row.content,
            source,
            tags,
        }))
    }

    async fn find_related(&self, id: &str, tag_ids: &[String], limit: u32) -> Result<Vec<RelatedArticle>> {
        if tag_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            r#"
            SELECT {ARTICLE_COLUMNS}, COUNT(at.tag_id) AS shared_tags
            FROM articles a
            JOIN article_tags at ON at.article_id = a.id
            WHERE at.tag_id = ANY($2) AND a.id <> $1
            GROUP BY a.id
            ORDER BY shared_tags DESC, a.published_at DESC NULLS LAST
            LIMIT $3
            "#
        );
        let rows = self
            .timed(
                "related_articles",
                sqlx::query_as::<_, RelatedRow>(&sql)
                    .bind(id)
                    .bind(tag_ids)
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool),
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| RelatedArticle {
                article: r.article,
                shared_tags: r.shared_tags,
            })
            .collect())
    }
}

#[async_trait]
impl FavoriteRepository for PgRepositories {
    async fn find_favorites(&self, user_id: &str, article_ids: &[String]) -> Result<Vec<FavoriteRow>> {
        self.timed(
            "favorites_by_ids",
            sqlx::query_as::<_, FavoriteRow>(
                "SELECT article_id, created_at FROM favorites WHERE user_id = $1 AND article_id = ANY($2)",
            )
            .bind(user_id)
            .bind(article_ids)
            .fetch_all(&self.pool),
        )
        .await
    }

    async fn add_favorite(&self, user_id: &str, article_id: &str) -> Result<FavoriteRow> {
        self.timed(
            "favorite_add",
            sqlx::query_as::<_, FavoriteRow>(
                r#"
                INSERT INTO favorites (user_id, article_id, created_at)
                VALUES ($1, $2, NOW())
                ON CONFLICT (user_id, article_id) DO UPDATE SET created_at = favorites.created_at
                RETURNING article_id, created_at
                "#,
            )
            .bind(user_id)
            .bind(article_id)
            .fetch_one(&self.pool),
        )
        .await
    }

    async fn remove_favorite(&self, user_id: &str, article_id: &str) -> Result<bool> {
        let result = self
            .timed(
                "favorite_remove",
                sqlx::query("DELETE FROM favorites WHERE user_id = $1 AND article_id = $2")
                    .bind(user_id)
                    .bind(article_id)
                    .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ViewRepository for PgRepositories {
    async fn find_views(&self, user_id: &str, article_ids: &[String]) -> Result<Vec<ViewRow>> {
        self.timed(
            "views_by_ids",
            sqlx::query_as::<_, ViewRow>(
                r#"
                SELECT article_id, viewed_at, read_at
                FROM article_views
                WHERE user_id = $1 AND article_id = ANY($2)
                "#,
            )
            .bind(user_id)
            .bind(article_ids)
            .fetch_all(&self.pool),
        )
        .await
    }

    async fn record_view(&self, user_id: &str, article_id: &str) -> Result<ViewRow> {
        self.timed(
            "view_record",
            sqlx::query_as::<_, ViewRow>(
                r#"
                INSERT INTO article_views (user_id, article_id, viewed_at)
                VALUES ($1, $2, NOW())
                ON CONFLICT (user_id, article_id) DO UPDATE SET viewed_at = NOW()
                RETURNING article_id, viewed_at, read_at
                "#,
            )
            .bind(user_id)
            .bind(article_id)
            .fetch_one(&self.pool),
        )
        .await
    }

    async fn mark_read(&self, user_id: &str, article_id: &str) -> Result<ViewRow> {
        self.timed(
            "view_mark_read",
            sqlx::query_as::<_, ViewRow>(
                r#"
                INSERT INTO article_views (user_id, article_id, viewed_at, read_at)
                VALUES ($1, $2, NOW(), NOW())
                ON CONFLICT (user_id, article_id)
                DO UPDATE SET read_at = COALESCE(article_views.read_at, NOW())
                RETURNING article_id, viewed_at, read_at
                "#,
            )
            .bind(user_id)
            .bind(article_id)
            .fetch_one(&self.pool),
        )
        .await
    }
}

#[async_trait]
impl AnalyticsRepository for PgRepositories {
    async fn site_stats(&self) -> Result<SiteStats> {
        let (total_articles, total_sources, total_tags, articles_today): (i64, i64, i64, i64) = self
            .timed(
                "stats_totals",
                sqlx::query_as(
                    r#"
                    SELECT
                        (SELECT COUNT(*) FROM articles),
                        (SELECT COUNT(*) FROM sources),
                        (SELECT COUNT(*) FROM tags),
                        (SELECT COUNT(*) FROM articles WHERE published_at >= date_trunc('day', NOW()))
                    "#,
                )
                .fetch_one(&self.pool),
            )
            .await?;

        let by_source = self
            .timed(
                "stats_by_source",
                sqlx::query_as::<_, NamedCount>(
                    r#"
                    SELECT s.name AS name, COUNT(a.id) AS count
                    FROM sources s
                    LEFT JOIN articles a ON a.source_id = s.id
                    GROUP BY s.name
                    ORDER BY count DESC
                    "#,
                )
                .fetch_all(&self.pool),
            )
            .await?;

        let by_category = self
            .timed(
                "stats_by_category",
                sqlx::query_as::<_, NamedCount>(
                    r#"
                    SELECT COALESCE(category, 'uncategorized') AS name, COUNT(*) AS count
                    FROM articles
                    GROUP BY 1
                    ORDER BY 2 DESC
                    "#,
                )
                .fetch_all(&self.pool),
            )
            .await?;

        Ok(SiteStats {
            total_articles,
            total_sources,
            total_tags,
            articles_today,
            by_source,
            by_category,
        })
    }

    async fn trending_tags(&self, since: DateTime<Utc>, limit: u32) -> Result<Vec<NamedCount>> {
        self.timed(
            "trending_tags",
            sqlx::query_as::<_, NamedCount>(
                r#"
                SELECT t.name AS name, COUNT(*) AS count
                FROM article_tags at
                JOIN tags t ON t.id = at.tag_id
                JOIN articles a ON a.id = at.article_id
                WHERE a.published_at >= $1
                GROUP BY t.name
                ORDER BY count DESC
                LIMIT $2
                "#,
            )
            .bind(since)
            .bind(i64::from(limit))
            .fetch_all(&self.pool),
        )
        .await
    }

    async fn trending_keywords(&self, since: DateTime<Utc>, limit: u32) -> Result<Vec<NamedCount>> {
        self.timed(
            "trending_keywords",
            sqlx::query_as::<_, NamedCount>(
                r#"
                SELECT k.keyword AS name, COUNT(*) AS count
                FROM article_keywords k
                JOIN articles a ON a.id = k.article_id
                WHERE a.published_at >= $1
                GROUP BY k.keyword
                ORDER BY count DESC
                LIMIT $2
                "#,
            )
            .bind(since)
            .bind(i64::from(limit))
            .fetch_all(&self.pool),
        )
        .await
    }

    async fn popular_searches(&self, limit: u32) -> Result<Vec<String>> {
        self.timed(
            "popular_searches",
            sqlx::query_scalar::<_, String>(
                r#"
                SELECT query
                FROM search_logs
                WHERE created_at >= NOW() - INTERVAL '7 days'
                GROUP BY query
                ORDER BY COUNT(*) DESC
                LIMIT $1
                "#,
            )
            .bind(i64::from(limit))
            .fetch_all(&self.pool),
        )
        .await
    }

    async fn search(&self, params: &SearchParams) -> Result<SearchPage> {
        let params = params.normalized();
        let page_sql = format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles a {SEARCH_FILTER} \
             ORDER BY a.published_at DESC NULLS LAST LIMIT $5 OFFSET $6"
        );
        let count_sql = format!("SELECT COUNT(*) FROM articles a {SEARCH_FILTER}");

        let items = self
            .timed(
                "search_page",
                sqlx::query_as::<_, ArticleSummary>(&page_sql)
                    .bind(&params.query)
                    .bind(&params.source)
                    .bind(&params.category)
                    .bind(&params.tags)
                    .bind(i64::from(params.limit))
                    .bind(params.offset())
                    .fetch_all(&self.pool),
            )
            .await?;

        let total = self
            .timed(
                "search_count",
                sqlx::query_scalar::<_, i64>(&count_sql)
                    .bind(&params.query)
                    .bind(&params.source)
                    .bind(&params.category)
                    .bind(&params.tags)
                    .fetch_one(&self.pool),
            )
            .await?;

        Ok(SearchPage {
            items,
            total,
            page: params.page,
            limit: params.limit,
        })
    }

    async fn list_tags(&self, limit: u32) -> Result<Vec<TagCount>> {
        self.timed(
            "tag_list",
            sqlx::query_as::<_, TagCount>(
                r#"
                SELECT t.id, t.name, COUNT(at.article_id) AS article_count
                FROM tags t
                LEFT JOIN article_tags at ON at.tag_id = t.id
                GROUP BY t.id, t.name
                ORDER BY article_count DESC, t.name
                LIMIT $1
                "#,
            )
            .bind(i64::from(limit))
            .fetch_all(&self.pool),
        )
        .await
    }

    async fn filter_options(&self) -> Result<FilterOptions> {
        let sources = self
            .timed(
                "filter_sources",
                sqlx::query_as::<_, SourceInfo>("SELECT id, name, url FROM sources ORDER BY name")
                    .fetch_all(&self.pool),
            )
            .await?;
        let categories = self
            .timed(
                "filter_categories",
                sqlx::query_scalar::<_, String>(
                    "SELECT DISTINCT category FROM articles WHERE category IS NOT NULL ORDER BY 1",
                )
                .fetch_all(&self.pool),
            )
            .await?;
        let tags = self
            .timed(
                "filter_tags",
                sqlx::query_as::<_, TagInfo>("SELECT id, name FROM tags ORDER BY name")
                    .fetch_all(&self.pool),
            )
            .await?;
        Ok(FilterOptions {
            sources,
            categories,
            tags,
        })
    }
}
