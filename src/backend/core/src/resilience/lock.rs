//! Redis-based distributed lock (`SET key token NX EX ttl`).
//!
//! A lock record is `<prefix>:<env>:lock:<key>` holding an opaque
//! `timestamp_random` token. Release only deletes the record while it still
//! holds the caller's token, so a holder whose TTL lapsed cannot remove a
//! lock someone else has since acquired. The store performs that check
//! atomically when it can; otherwise it is a read followed by a delete,
//! which is safe as long as only the token holder deletes within the TTL.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::key::{CacheDomain, KeyNamespace};
use crate::config::LockSettings;
use crate::error::{CoreError, Result};
use crate::store::KeyValueStore;
use crate::telemetry::CacheMetrics;

/// Timings for [`DistributedLock`].
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Expiry of a lock record; the safety net against crashed holders
    pub ttl: Duration,
    /// Poll period of [`DistributedLock::acquire_with_wait`]
    pub retry_interval: Duration,
    /// Upper bound on waiting for a held lock
    pub max_wait: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            retry_interval: Duration::from_millis(50),
            max_wait: Duration::from_secs(5),
        }
    }
}

impl From<&LockSettings> for LockConfig {
    fn from(settings: &LockSettings) -> Self {
        Self {
            ttl: settings.ttl,
            retry_interval: settings.retry_interval,
            max_wait: settings.max_wait,
        }
    }
}

/// Mutual exclusion across processes sharing one store.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn KeyValueStore>,
    namespace: KeyNamespace,
    config: LockConfig,
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("store", &self.store.name())
            .field("namespace", &self.namespace)
            .field("config", &self.config)
            .finish()
    }
}

/// A fresh `timestamp_random` token.
pub fn generate_token() -> String {
    format!(
        "{}_{}",
        chrono::Utc::now().timestamp_millis(),
        uuid::Uuid::new_v4().simple()
    )
}

impl DistributedLock {
    pub fn new(store: Arc<dyn KeyValueStore>, namespace: KeyNamespace, config: LockConfig) -> Self {
        Self {
            store,
            namespace,
            config,
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Full store key of the lock record for `key`.
    pub fn lock_key(&self, key: &str) -> String {
        self.namespace.key(CacheDomain::Lock, key)
    }

    /// Single non-blocking attempt. Returns the token when acquired.
    pub async fn acquire(&self, key: &str, ttl: Option<Duration>) -> Result<Option<String>> {
        let token = generate_token();
        let ttl = ttl.unwrap_or(self.config.ttl);
        if self.store.set_nx_ex(&self.lock_key(key), &token, ttl).await? {
            CacheMetrics::record_lock_acquired();
            debug!(key, "Lock acquired");
            Ok(Some(token))
        } else {
            CacheMetrics::record_lock_contended();
            Ok(None)
        }
    }

    /// Poll every `retry_interval` until acquired or `max_wait` elapses.
    pub async fn acquire_with_wait(&self, key: &str, ttl: Option<Duration>) -> Result<Option<String>> {
        self.acquire_within(key, ttl, self.config.max_wait).await
    }

    /// [`acquire_with_wait`](Self::acquire_with_wait) with an explicit bound.
    pub async fn acquire_within(
        &self,
        key: &str,
        ttl: Option<Duration>,
        max_wait: Duration,
    ) -> Result<Option<String>> {
        let deadline = Instant::now() + max_wait;
        loop {
            if let Some(token) = self.acquire(key, ttl).await? {
                return Ok(Some(token));
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(key, ?max_wait, "Gave up waiting for lock");
                return Ok(None);
            }
            tokio::time::sleep(self.config.retry_interval.min(deadline - now)).await;
        }
    }

    /// Release `key` if it still holds `token`.
    pub async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let released = self.store.delete_if_equals(&self.lock_key(key), token).await?;
        if !released {
            debug!(key, "Lock not released: token mismatch or expired");
        }
        Ok(released)
    }

    pub async fn is_locked(&self, key: &str) -> Result<bool> {
        self.store.exists(&self.lock_key(key)).await
    }

    /// Run `f` while holding the lock, releasing it on every exit path,
    /// including panics.
    ///
    /// Fails with `LockNotAcquired` if the lock stays held for `max_wait`.
    pub async fn execute_with_lock<T, F, Fut>(&self, key: &str, ttl: Option<Duration>, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let token = self
            .acquire_with_wait(key, ttl)
            .await?
            .ok_or_else(|| CoreError::lock_not_acquired(key))?;
        self.run_holding(key, &token, f()).await
    }

    /// Await `fut` for an already acquired lock, then release it whether
    /// `fut` returned or panicked.
    pub async fn run_holding<T, Fut>(&self, key: &str, token: &str, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let outcome = AssertUnwindSafe(fut).catch_unwind().await;

        if let Err(e) = self.release(key, token).await {
            warn!(key, error = %e, "Failed to release lock");
        }

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}
