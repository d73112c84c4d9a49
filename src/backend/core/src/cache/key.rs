//! Cache key generation.
//!
//! Every key has the shape `<prefix>:<env>:<domain>:<specific-key>`, so
//! cross-cutting invalidation can match on `SCAN` patterns. Query-shaped
//! keys use a short SHA-256 of the canonical JSON of their parameters.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;

use crate::config::TtlSettings;

// ═══════════════════════════════════════════════════════════════════════════════
// Domains
// ═══════════════════════════════════════════════════════════════════════════════

/// Logical caches sharing one Redis instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheDomain {
    /// Aggregate site statistics (counts per source/category)
    Stats,
    /// Trending tags and keywords
    Trends,
    /// Search result pages
    Search,
    /// Tag listings
    Tags,
    /// Filter option lists
    Filters,
    /// Article detail with relations and related articles
    ArticleDetail,
    /// Article summaries served by the article loader
    Article,
    /// Per-user favorite status
    Favorite,
    /// Per-user view/read status
    View,
    /// Distributed lock records
    Lock,
}

impl CacheDomain {
    pub const ALL: [CacheDomain; 10] = [
        Self::Stats,
        Self::Trends,
        Self::Search,
        Self::Tags,
        Self::Filters,
        Self::ArticleDetail,
        Self::Article,
        Self::Favorite,
        Self::View,
        Self::Lock,
    ];

    /// Key segment for this domain.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Stats => "stats",
            Self::Trends => "trends",
            Self::Search => "search",
            Self::Tags => "tags",
            Self::Filters => "filters",
            Self::ArticleDetail => "article-detail",
            Self::Article => "article",
            Self::Favorite => "favorite",
            Self::View => "view",
            Self::Lock => "lock",
        }
    }

    pub fn default_ttl(&self) -> Duration {
        match self {
            Self::Stats => Duration::from_secs(3600),         // 1 hour
            Self::Trends => Duration::from_secs(1800),        // 30 minutes
            Self::Search => Duration::from_secs(300),         // 5 minutes
            Self::Tags => Duration::from_secs(1800),          // 30 minutes
            Self::Filters => Duration::from_secs(1800),       // 30 minutes
            Self::ArticleDetail => Duration::from_secs(600),  // 10 minutes
            Self::Article => Duration::from_secs(300),        // 5 minutes
            Self::Favorite => Duration::from_secs(300),       // 5 minutes
            Self::View => Duration::from_secs(300),           // 5 minutes
            Self::Lock => Duration::from_secs(30),
        }
    }

    /// TTL after applying configured overrides.
    pub fn ttl(&self, overrides: &TtlSettings) -> Duration {
        let configured = match self {
            Self::Stats => overrides.stats,
            Self::Trends => overrides.trends,
            Self::Search => overrides.search,
            Self::Tags => overrides.tags,
            Self::Filters => overrides.filters,
            Self::ArticleDetail => overrides.article_detail,
            Self::Article => overrides.article,
            Self::Favorite => overrides.favorite,
            Self::View => overrides.view,
            Self::Lock => None,
        };
        configured.unwrap_or_else(|| self.default_ttl())
    }

    /// Parse a domain from its key segment.
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.prefix() == prefix)
    }
}

impl fmt::Display for CacheDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Namespace
// ═══════════════════════════════════════════════════════════════════════════════

/// Application-wide key prefix: `<prefix>:<env>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyNamespace {
    prefix: String,
    environment: String,
}

impl KeyNamespace {
    pub fn new(prefix: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            environment: environment.into(),
        }
    }

    /// `<prefix>:<env>`, the root every application key lives under.
    pub fn root(&self) -> String {
        format!("{}:{}", self.prefix, self.environment)
    }

    /// `<prefix>:<env>:<domain>`
    pub fn domain(&self, domain: CacheDomain) -> String {
        format!("{}:{}:{}", self.prefix, self.environment, domain.prefix())
    }

    /// `<prefix>:<env>:<domain>:<key>`
    pub fn key(&self, domain: CacheDomain, key: &str) -> String {
        format!("{}:{}", self.domain(domain), key)
    }

    /// Glob matching every key of the application.
    pub fn app_pattern(&self) -> String {
        format!("{}:*", self.root())
    }

    /// Glob matching every key of one domain.
    pub fn domain_pattern(&self, domain: CacheDomain) -> String {
        format!("{}:*", self.domain(domain))
    }
}

impl Default for KeyNamespace {
    fn default() -> Self {
        Self::new("technews", "development")
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Key Hashing Utilities
// ═══════════════════════════════════════════════════════════════════════════════

/// Number of hex characters kept from a SHA-256 digest.
pub const HASH_LEN: usize = 16;

/// Truncated SHA-256 hex digest of raw bytes.
pub fn short_hash(bytes: impl AsRef<[u8]>) -> String {
    let digest = Sha256::digest(bytes.as_ref());
    let mut hex = hex::encode(digest);
    hex.truncate(HASH_LEN);
    hex
}

/// Hash query parameters independent of field order.
///
/// Parameters are converted to a JSON value first; `serde_json` maps keep
/// their keys sorted, so `{a, b}` and `{b, a}` hash the same.
pub fn hash_params(params: &impl Serialize) -> String {
    let canonical = serde_json::to_value(params)
        .map(|v| v.to_string())
        .unwrap_or_default();
    short_hash(canonical)
}

/// Join sorted, deduplicated ids, e.g. for composite keys over tag sets.
pub fn sorted_ids<T: Ord + ToString + Clone>(ids: &[T]) -> String {
    let mut ids = ids.to_vec();
    ids.sort();
    ids.dedup();
    ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_namespaced_key() {
        let ns = KeyNamespace::new("technews", "prod");
        assert_eq!(ns.key(CacheDomain::Search, "abc"), "technews:prod:search:abc");
        assert_eq!(ns.domain_pattern(CacheDomain::Stats), "technews:prod:stats:*");
        assert_eq!(ns.app_pattern(), "technews:prod:*");
    }

    #[test]
    fn test_hash_is_sixteen_hex_chars() {
        let hash = hash_params(&json!({"q": "rust"}));
        assert_eq!(hash.len(), HASH_LEN);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hash_ignores_field_order() {
        let mut a = HashMap::new();
        a.insert("query", "rust");
        a.insert("page", "2");
        let b = json!({"page": "2", "query": "rust"});
        assert_eq!(hash_params(&a), hash_params(&b));
        assert_ne!(hash_params(&b), hash_params(&json!({"page": "3", "query": "rust"})));
    }

    #[test]
    fn test_domain_ttl_overrides() {
        let overrides = TtlSettings {
            search: Some(Duration::from_secs(90)),
            ..Default::default()
        };
        assert_eq!(CacheDomain::Search.ttl(&overrides), Duration::from_secs(90));
        assert_eq!(CacheDomain::Stats.ttl(&overrides), Duration::from_secs(3600));
        assert_eq!(CacheDomain::Trends.default_ttl(), Duration::from_secs(1800));
    }

    #[test]
    fn test_domain_prefix_round_trip() {
        for domain in CacheDomain::ALL {
            assert_eq!(CacheDomain::from_prefix(domain.prefix()), Some(domain));
        }
        assert_eq!(CacheDomain::from_prefix("nope"), None);
    }

    #[test]
    fn test_sorted_ids() {
        assert_eq!(sorted_ids(&[3, 1, 2, 1]), "1,2,3");
    }
}
