//! Cache warming.
//!
//! On startup one process (whoever wins the `cache:warming:startup` lock)
//! fills the expensive caches in priority order. Afterwards a periodic loop
//! re-warms each category once its own interval has elapsed.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use super::{shutdown_requested, JobHandle};
use crate::cache::DomainCaches;
use crate::config::WarmerSettings;
use crate::db::{AnalyticsRepository, SearchParams};
use crate::error::{CoreError, Result};
use crate::resilience::DistributedLock;
use crate::telemetry::CacheMetrics;

/// Lock key held while the startup warm runs.
pub const STARTUP_LOCK_KEY: &str = "cache:warming:startup";

/// Shortest allowed period of the warming loop.
pub const MIN_TICK: Duration = Duration::from_secs(600);

const STARTUP_LOCK_TTL: Duration = Duration::from_secs(300);

/// What the warmer can fill, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmCategory {
    Stats,
    Trends,
    Keywords,
    Search,
}

impl WarmCategory {
    pub const ALL: [WarmCategory; 4] = [Self::Stats, Self::Trends, Self::Keywords, Self::Search];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stats => "stats",
            Self::Trends => "trends",
            Self::Keywords => "keywords",
            Self::Search => "search",
        }
    }

    pub fn interval(&self, settings: &WarmerSettings) -> Duration {
        match self {
            Self::Stats => settings.stats_interval,
            Self::Trends => settings.trends_interval,
            Self::Keywords => settings.keywords_interval,
            Self::Search => settings.search_interval,
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for WarmCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WarmCategory {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| CoreError::invalid_input(format!("Unknown warm category: {s}")))
    }
}

/// Result of warming one category.
#[derive(Debug, Clone, Serialize)]
pub struct WarmOutcome {
    pub category: WarmCategory,
    pub success: bool,
    /// Entries written
    pub items: usize,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryStatus {
    pub category: WarmCategory,
    pub runs: u64,
    pub failures: u64,
    pub last_outcome: Option<WarmOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WarmerStatus {
    pub enabled: bool,
    pub categories: Vec<CategoryStatus>,
}

#[derive(Debug, Default)]
struct CategoryState {
    last_run: Option<Instant>,
    runs: u64,
    failures: u64,
    last_outcome: Option<WarmOutcome>,
}

struct Inner {
    caches: DomainCaches,
    repo: Arc<dyn AnalyticsRepository>,
    lock: DistributedLock,
    settings: WarmerSettings,
    state: Mutex<[CategoryState; 4]>,
}

/// Fills the expensive domain caches ahead of traffic. Cheap to clone.
#[derive(Clone)]
pub struct CacheWarmer {
    inner: Arc<Inner>,
}

impl CacheWarmer {
    pub fn new(
        caches: DomainCaches,
        repo: Arc<dyn AnalyticsRepository>,
        lock: DistributedLock,
        settings: WarmerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                caches,
                repo,
                lock,
                settings,
                state: Mutex::new(Default::default()),
            }),
        }
    }

    pub fn settings(&self) -> &WarmerSettings {
        &self.inner.settings
    }

    /// Warm one category. Failures are recorded, never returned.
    #[instrument(skip(self), fields(category = %category))]
    pub async fn warm_category(&self, category: WarmCategory) -> WarmOutcome {
        let started = Instant::now();
        let result = self.fill(category).await;
        let outcome = WarmOutcome {
            category,
            success: result.is_ok(),
            items: *result.as_ref().unwrap_or(&0),
            duration_ms: started.elapsed().as_millis() as u64,
            error: result.as_ref().err().map(|e| e.to_string()),
            finished_at: Utc::now(),
        };

        match &outcome.error {
            None => info!(items = outcome.items, duration_ms = outcome.duration_ms, "Cache warmed"),
            Some(error) => warn!(error = %error, "Cache warming failed"),
        }
        CacheMetrics::record_warm_run(category.as_str(), outcome.success);

        let mut state = self.inner.state.lock();
        let slot = &mut state[category.index()];
        slot.last_run = Some(started);
        slot.runs += 1;
        if !outcome.success {
            slot.failures += 1;
        }
        slot.last_outcome = Some(outcome.clone());
        outcome
    }

    /// Warm every category in priority order; one failure does not stop the rest.
    pub async fn warm_all(&self) -> Vec<WarmOutcome> {
        let mut outcomes = Vec::with_capacity(WarmCategory::ALL.len());
        for category in WarmCategory::ALL {
            outcomes.push(self.warm_category(category).await);
        }
        outcomes
    }

    /// Startup warm, performed by at most one instance at a time.
    ///
    /// Returns `None` when another instance holds the startup lock.
    pub async fn warm_on_startup(&self) -> Result<Option<Vec<WarmOutcome>>> {
        let lock = &self.inner.lock;
        let Some(token) = lock.acquire(STARTUP_LOCK_KEY, Some(STARTUP_LOCK_TTL)).await? else {
            info!("Another instance is warming caches; skipping startup warm");
            return Ok(None);
        };
        info!("Startup cache warming");
        let outcomes = lock
            .run_holding(STARTUP_LOCK_KEY, &token, async { Ok(self.warm_all().await) })
            .await?;
        Ok(Some(outcomes))
    }

    /// Categories whose interval has elapsed since their last run.
    pub fn due(&self) -> Vec<WarmCategory> {
        let state = self.inner.state.lock();
        WarmCategory::ALL
            .into_iter()
            .filter(|c| match state[c.index()].last_run {
                None => true,
                Some(at) => at.elapsed() >= c.interval(&self.inner.settings),
            })
            .collect()
    }

    /// Warm every due category.
    pub async fn run_due(&self) -> Vec<WarmOutcome> {
        let mut outcomes = Vec::new();
        for category in self.due() {
            outcomes.push(self.warm_category(category).await);
        }
        outcomes
    }

    pub fn status(&self) -> WarmerStatus {
        let state = self.inner.state.lock();
        WarmerStatus {
            enabled: self.inner.settings.enabled,
            categories: WarmCategory::ALL
                .into_iter()
                .map(|category| {
                    let slot = &state[category.index()];
                    CategoryStatus {
                        category,
                        runs: slot.runs,
                        failures: slot.failures,
                        last_outcome: slot.last_outcome.clone(),
                    }
                })
                .collect(),
        }
    }

    /// Run the startup warm (if configured) and then the periodic loop
    /// until the handle is shut down.
    pub fn start(&self) -> JobHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let warmer = self.clone();
        let period = self.inner.settings.tick.max(MIN_TICK);

        let task = tokio::spawn(async move {
            info!(tick = ?period, "Cache warmer started");
            if warmer.inner.settings.warm_on_startup {
                tokio::select! {
                    _ = shutdown_requested(&mut shutdown_rx) => return,
                    result = warmer.warm_on_startup() => {
                        if let Err(e) = result {
                            warn!(error = %e, "Startup warming failed");
                        }
                    }
                }
            }

            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown_requested(&mut shutdown_rx) => break,
                    _ = ticker.tick() => {
                        warmer.run_due().await;
                    }
                }
            }
            info!("Cache warmer stopped");
        });

        JobHandle::new("cache_warmer", shutdown_tx, task)
    }

    async fn fill(&self, category: WarmCategory) -> Result<usize> {
        let caches = &self.inner.caches;
        let repo = self.inner.repo.as_ref();
        match category {
            WarmCategory::Stats => caches.stats.refresh(repo).await.map(|_| 1),
            WarmCategory::Trends => caches.trends.refresh_tags(repo).await,
            WarmCategory::Keywords => caches.trends.refresh_keywords(repo).await,
            WarmCategory::Search => {
                let queries = repo.popular_searches(self.inner.settings.popular_search_limit).await?;
                let mut warmed = 0;
                for query in queries {
                    let params = SearchParams::query(query).normalized();
                    match caches.search.refresh(repo, &params).await {
                        Ok(_) => warmed += 1,
                        Err(e) => warn!(query = %params.query, error = %e, "Search warm failed"),
                    }
                }
                Ok(warmed)
            }
        }
    }
}

impl fmt::Debug for CacheWarmer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheWarmer")
            .field("settings", &self.inner.settings)
            .finish()
    }
}
