//! Tracked fire-and-forget work.
//!
//! Cache promotion and write-back must not add latency to the caller, but
//! their failures still need to be seen. Everything goes through
//! [`BackgroundTasks::spawn`], which logs and counts errors in one place and
//! lets shutdown (and tests) wait for outstanding writes with
//! [`BackgroundTasks::flush`].

use metrics::counter;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;
use tracing::{warn, Instrument};

use crate::error::Result;

/// Spawner for tracked background futures. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct BackgroundTasks {
    tracker: TaskTracker,
    spawned: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    flushing: Arc<Mutex<()>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fut` on the runtime without awaiting it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<F>(&self, label: &'static str, fut: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.spawned.fetch_add(1, Ordering::Relaxed);
        let failed = Arc::clone(&self.failed);
        let span = tracing::debug_span!("background", task = label);
        self.tracker.spawn(
            async move {
                if let Err(e) = fut.await {
                    failed.fetch_add(1, Ordering::Relaxed);
                    counter!("technews_background_failures_total", "task" => label).increment(1);
                    warn!(task = label, error = %e, "Background task failed");
                }
            }
            .instrument(span),
        );
    }

    /// Wait until every task spawned so far has finished.
    ///
    /// Concurrent callers take turns; the tracker is reopened before the
    /// next one closes it.
    pub async fn flush(&self) {
        let _turn = self.flushing.lock().await;
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Number of tasks still running.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}
