//! Adaptive batch sizing from observed batch latency.
//!
//! Each query kind feeds its own [`BatchOptimizer`] one [`BatchMetrics`]
//! sample per dispatched batch. When a window of samples is full, the
//! optimizer compares tail latency against its targets and moves the batch
//! size down (too slow) or up (fast, cache-friendly, short queues).

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::telemetry::CacheMetrics;

/// Query kinds with independently tuned batch sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    Article,
    Favorite,
    View,
}

impl QueryKind {
    pub const ALL: [QueryKind; 3] = [Self::Article, Self::Favorite, Self::View];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Article => "article",
            Self::Favorite => "favorite",
            Self::View => "view",
        }
    }

    fn index(&self) -> usize {
        match self {
            Self::Article => 0,
            Self::Favorite => 1,
            Self::View => 2,
        }
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tuning parameters for one [`BatchOptimizer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub initial_batch_size: usize,
    #[serde(with = "humantime_serde")]
    pub target_p95: Duration,
    #[serde(with = "humantime_serde")]
    pub target_p99: Duration,
    /// Samples per evaluation
    pub sample_window: usize,
    /// Minimum time between two adjustments
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
    pub step_up: usize,
    pub step_down: usize,
    /// Cache hit ratio (0..1) required before growing
    pub min_cache_hit_rate: f64,
    /// Average queue wait allowed before growing
    #[serde(with = "humantime_serde")]
    pub max_queue_wait: Duration,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            min_batch_size: 10,
            max_batch_size: 200,
            initial_batch_size: 50,
            target_p95: Duration::from_millis(100),
            target_p99: Duration::from_millis(200),
            sample_window: 100,
            cooldown: Duration::from_secs(5),
            step_up: 10,
            step_down: 20,
            min_cache_hit_rate: 0.4,
            max_queue_wait: Duration::from_millis(10),
        }
    }
}

impl OptimizerConfig {
    /// Article summaries: larger rows, default targets.
    pub fn for_articles() -> Self {
        Self::default()
    }

    /// Favorite status: single-table lookups, tighter targets.
    pub fn for_favorites() -> Self {
        Self {
            initial_batch_size: 100,
            max_batch_size: 500,
            target_p95: Duration::from_millis(50),
            target_p99: Duration::from_millis(100),
            ..Self::default()
        }
    }

    /// View status: like favorites with a little more slack.
    pub fn for_views() -> Self {
        Self {
            initial_batch_size: 100,
            max_batch_size: 500,
            target_p95: Duration::from_millis(75),
            target_p99: Duration::from_millis(150),
            ..Self::default()
        }
    }

    fn clamp(&self, size: i64) -> usize {
        let min = self.min_batch_size.max(1) as i64;
        let max = self.max_batch_size.max(self.min_batch_size.max(1)) as i64;
        size.clamp(min, max) as usize
    }
}

/// One dispatched batch.
#[derive(Debug, Clone)]
pub struct BatchMetrics {
    pub timestamp: Instant,
    /// Batch size limit in effect at dispatch
    pub batch_size: usize,
    pub latency: Duration,
    /// Time the first key waited before dispatch
    pub queue_wait: Duration,
    pub item_count: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
}

/// Window aggregates an adjustment was based on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowSummary {
    pub samples: usize,
    pub p95: Duration,
    pub p99: Duration,
    pub avg_queue_wait: Duration,
    /// 0..1
    pub cache_hit_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Adjustment {
    pub kind: QueryKind,
    pub from: usize,
    pub to: usize,
    pub reason: String,
    pub window: WindowSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimizerStats {
    pub kind: QueryKind,
    pub batch_size: usize,
    pub pending_samples: usize,
    pub adjustments: u64,
    pub last_adjustment: Option<Adjustment>,
}

#[derive(Debug)]
struct OptimizerState {
    batch_size: usize,
    samples: Vec<BatchMetrics>,
    last_adjusted_at: Option<Instant>,
    adjustments: u64,
    last_adjustment: Option<Adjustment>,
}

/// Batch size controller for one [`QueryKind`].
#[derive(Debug)]
pub struct BatchOptimizer {
    kind: QueryKind,
    config: OptimizerConfig,
    state: Mutex<OptimizerState>,
}

impl BatchOptimizer {
    pub fn new(kind: QueryKind, config: OptimizerConfig) -> Self {
        let batch_size = config.clamp(config.initial_batch_size as i64);
        CacheMetrics::set_batch_size(kind.as_str(), batch_size);
        Self {
            kind,
            state: Mutex::new(OptimizerState {
                batch_size,
                samples: Vec::with_capacity(config.sample_window.max(1)),
                last_adjusted_at: None,
                adjustments: 0,
                last_adjustment: None,
            }),
            config,
        }
    }

    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Current batch size limit.
    pub fn batch_size(&self) -> usize {
        self.state.lock().batch_size
    }

    /// Add a sample. Evaluates and clears the window once it is full, and
    /// returns the adjustment if the batch size changed.
    pub fn record(&self, metrics: BatchMetrics) -> Option<Adjustment> {
        let mut state = self.state.lock();
        state.samples.push(metrics);
        if state.samples.len() < self.config.sample_window.max(1) {
            return None;
        }

        let window = summarize(&state.samples);
        state.samples.clear();

        if let Some(at) = state.last_adjusted_at {
            if at.elapsed() < self.config.cooldown {
                debug!(kind = %self.kind, "Batch size adjustment skipped, cooling down");
                return None;
            }
        }

        let current = state.batch_size;
        let (proposed, reason) = self.propose(current, &window);
        if proposed == current {
            return None;
        }

        let adjustment = Adjustment {
            kind: self.kind,
            from: current,
            to: proposed,
            reason,
            window,
        };
        state.batch_size = proposed;
        state.last_adjusted_at = Some(Instant::now());
        state.adjustments += 1;
        state.last_adjustment = Some(adjustment.clone());
        drop(state);

        info!(
            kind = %self.kind,
            from = adjustment.from,
            to = adjustment.to,
            p95_ms = adjustment.window.p95.as_millis() as u64,
            p99_ms = adjustment.window.p99.as_millis() as u64,
            reason = %adjustment.reason,
            "Batch size adjusted"
        );
        CacheMetrics::set_batch_size(self.kind.as_str(), proposed);
        CacheMetrics::record_batch_adjustment(
            self.kind.as_str(),
            if proposed > current { "up" } else { "down" },
        );
        Some(adjustment)
    }

    fn propose(&self, current: usize, window: &WindowSummary) -> (usize, String) {
        let config = &self.config;
        let current_i = current as i64;
        let ms = |d: Duration| d.as_secs_f64() * 1000.0;

        let (stepped, mut reason) = if window.p99 > config.target_p99 {
            (
                current_i - config.step_down as i64,
                format!("p99 {:.1}ms above target {:.1}ms", ms(window.p99), ms(config.target_p99)),
            )
        } else if window.p95 > config.target_p95 {
            (
                current_i - (config.step_down / 2) as i64,
                format!("p95 {:.1}ms above target {:.1}ms", ms(window.p95), ms(config.target_p95)),
            )
        } else if window.p95 < config.target_p95 / 2
            && window.cache_hit_rate > config.min_cache_hit_rate
            && window.avg_queue_wait < config.max_queue_wait
        {
            (
                current_i + config.step_up as i64,
                format!(
                    "p95 {:.1}ms has headroom, hit rate {:.0}%",
                    ms(window.p95),
                    window.cache_hit_rate * 100.0
                ),
            )
        } else {
            (current_i, String::from("within targets"))
        };

        let correction = ((ms(config.target_p95) - ms(window.p95)) * 0.1).floor() as i64;
        if correction != 0 {
            reason.push_str(&format!(", correction {correction:+}"));
        }
        (config.clamp(config.clamp(stepped) as i64 + correction), reason)
    }

    pub fn stats(&self) -> OptimizerStats {
        let state = self.state.lock();
        OptimizerStats {
            kind: self.kind,
            batch_size: state.batch_size,
            pending_samples: state.samples.len(),
            adjustments: state.adjustments,
            last_adjustment: state.last_adjustment.clone(),
        }
    }

    /// Back to the initial size with an empty window.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.batch_size = self.config.clamp(self.config.initial_batch_size as i64);
        state.samples.clear();
        state.last_adjusted_at = None;
        state.adjustments = 0;
        state.last_adjustment = None;
    }
}

fn summarize(samples: &[BatchMetrics]) -> WindowSummary {
    let mut latencies: Vec<Duration> = samples.iter().map(|s| s.latency).collect();
    latencies.sort();

    let total_wait: Duration = samples.iter().map(|s| s.queue_wait).sum();
    let hits: usize = samples.iter().map(|s| s.cache_hits).sum();
    let misses: usize = samples.iter().map(|s| s.cache_misses).sum();
    let lookups = hits + misses;

    WindowSummary {
        samples: samples.len(),
        p95: percentile(&latencies, 0.95),
        p99: percentile(&latencies, 0.99),
        avg_queue_wait: total_wait / samples.len().max(1) as u32,
        cache_hit_rate: if lookups > 0 { hits as f64 / lookups as f64 } else { 0.0 },
    }
}

/// Nearest-rank percentile of sorted values.
fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// One optimizer per [`QueryKind`].
#[derive(Debug)]
pub struct OptimizerRegistry {
    optimizers: [Arc<BatchOptimizer>; 3],
}

impl OptimizerRegistry {
    pub fn new(article: OptimizerConfig, favorite: OptimizerConfig, view: OptimizerConfig) -> Self {
        Self {
            optimizers: [
                Arc::new(BatchOptimizer::new(QueryKind::Article, article)),
                Arc::new(BatchOptimizer::new(QueryKind::Favorite, favorite)),
                Arc::new(BatchOptimizer::new(QueryKind::View, view)),
            ],
        }
    }

    pub fn get(&self, kind: QueryKind) -> &Arc<BatchOptimizer> {
        &self.optimizers[kind.index()]
    }

    pub fn stats(&self) -> Vec<OptimizerStats> {
        self.optimizers.iter().map(|o| o.stats()).collect()
    }

    pub fn reset(&self) {
        for optimizer in &self.optimizers {
            optimizer.reset();
        }
    }
}

impl Default for OptimizerRegistry {
    fn default() -> Self {
        Self::new(
            OptimizerConfig::for_articles(),
            OptimizerConfig::for_favorites(),
            OptimizerConfig::for_views(),
        )
    }
}

impl From<&crate::config::BatchSettings> for OptimizerRegistry {
    fn from(settings: &crate::config::BatchSettings) -> Self {
        Self::new(
            settings.article.clone(),
            settings.favorite.clone(),
            settings.view.clone(),
        )
    }
}
