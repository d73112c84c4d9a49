//! Out-of-band work: tracked fire-and-forget writes, the cache warmer and
//! the Redis memory optimizer.
//!
//! ```text
//! ┌──────────────────┐   ┌──────────────────┐   ┌──────────────────┐
//! │ BackgroundTasks  │   │   CacheWarmer    │   │ MemoryOptimizer  │
//! │ (L2 write-back,  │   │ (startup lock,   │   │ (INFO memory,    │
//! │  revalidation)   │   │  per-category    │   │  TTL shrink,     │
//! │                  │   │  intervals)      │   │  eviction)       │
//! └──────────────────┘   └────────┬─────────┘   └────────┬─────────┘
//!                                 └──────── JobHandle ───┘
//! ```

pub mod memory;
pub mod tasks;
pub mod warmer;

pub use memory::{MemoryAction, MemoryLevel, MemoryOptimizer, MemoryReport};
pub use tasks::BackgroundTasks;
pub use warmer::{CacheWarmer, CategoryStatus, WarmCategory, WarmOutcome, WarmerStatus};

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Handle for controlling a periodic background loop.
#[derive(Debug)]
pub struct JobHandle {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl JobHandle {
    pub(crate) fn new(name: &'static str, shutdown: watch::Sender<bool>, task: JoinHandle<()>) -> Self {
        Self { name, shutdown, task }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signal the loop to stop after its current iteration.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal shutdown and wait for the loop to exit.
    pub async fn stop(self) {
        self.shutdown();
        if let Err(e) = self.task.await {
            tracing::warn!(job = self.name, error = %e, "Background loop ended abnormally");
        }
    }
}

/// Wait until `rx` reports shutdown or its sender is gone.
pub(crate) async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
