//! In-process store backed by a `DashMap`.
//!
//! Emulates the Redis subset closely enough for the cache layers: lazy
//! per-key expiry, glob `MATCH` patterns and integer TTL replies. `SCAN`
//! pages through keys in hash order, examining `count` keys per call; as in
//! Redis, a key present for the whole scan is returned even if others are
//! deleted between pages.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::{KeyValueStore, MemoryInfo, StoreCapabilities, TTL_MISSING, TTL_PERSISTENT};
use crate::error::{CoreError, ErrorCode, Result};

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Where `key` sits in scan order. Never 0, which is the start cursor.
fn scan_position(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() >> 1) + 1
}

/// `DashMap`-backed [`KeyValueStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
    max_memory: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `max_memory` as the configured ceiling in [`memory_info`](KeyValueStore::memory_info).
    pub fn with_max_memory(max_memory: u64) -> Self {
        Self {
            entries: DashMap::new(),
            max_memory: AtomicU64::new(max_memory),
        }
    }

    pub fn set_max_memory(&self, max_memory: u64) {
        self.max_memory.store(max_memory, Ordering::Relaxed);
    }

    /// Store a key without expiry, like a plain `SET`.
    pub fn set_persistent(&self, key: &str, value: &str) {
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: None,
            },
        );
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, v| v.is_expired(now));
        }
        None
    }

    fn remaining_ttl(&self, key: &str) -> i64 {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if entry.is_expired(now) => TTL_MISSING,
            Some(entry) => match entry.expires_at {
                Some(at) => {
                    let left = at.saturating_duration_since(now);
                    (left.as_secs() + u64::from(left.subsec_nanos() > 0)) as i64
                }
                None => TTL_PERSISTENT,
            },
            None => TTL_MISSING,
        }
    }

    fn apply_expire(&self, key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(now + ttl);
                true
            }
            _ => false,
        }
    }
}

/// Translate a Redis glob (`*`, `?`, `[...]`, `\x`) into an anchored regex.
pub fn glob_to_regex(pattern: &str) -> Result<regex::Regex> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                out.push('[');
                let mut closed = false;
                let mut first = true;
                for c in chars.by_ref() {
                    match c {
                        ']' => {
                            closed = true;
                            break;
                        }
                        '^' if first => out.push('^'),
                        '\\' | '[' | '&' | '~' => {
                            out.push('\\');
                            out.push(c);
                        }
                        c => out.push(c),
                    }
                    first = false;
                }
                if !closed {
                    return Err(CoreError::new(
                        ErrorCode::InvalidPattern,
                        format!("Unterminated character class in pattern '{pattern}'"),
                    ));
                }
                out.push(']');
            }
            '\\' => {
                if let Some(escaped) = chars.next() {
                    out.push_str(&regex::escape(&escaped.to_string()));
                }
            }
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    Ok(regex::Regex::new(&out)?)
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            unlink: true,
            atomic_compare_delete: true,
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.live_value(key))
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        Ok(keys.iter().map(|k| self.live_value(k)).collect())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let fresh = StoredValue {
            value: value.to_string(),
            expires_at: Some(now + ttl),
        };
        let mut written = false;
        self.entries
            .entry(key.to_string())
            .and_modify(|existing| {
                if existing.is_expired(now) {
                    *existing = fresh.clone();
                    written = true;
                }
            })
            .or_insert_with(|| {
                written = true;
                fresh.clone()
            });
        Ok(written)
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        let now = Instant::now();
        Ok(keys
            .iter()
            .filter_map(|k| self.entries.remove(k))
            .filter(|(_, v)| !v.is_expired(now))
            .count() as u64)
    }

    async fn unlink(&self, keys: &[String]) -> Result<u64> {
        self.del(keys).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.live_value(key).is_some())
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
        let matcher = glob_to_regex(pattern)?;
        let now = Instant::now();
        let mut remaining: Vec<(u64, String)> = self
            .entries
            .iter()
            .filter(|e| !e.is_expired(now))
            .map(|e| (scan_position(e.key()), e.key().clone()))
            .filter(|(position, _)| *position >= cursor)
            .collect();
        remaining.sort_unstable();

        let count = count.max(1);
        let next = remaining.get(count).map_or(0, |(position, _)| *position);
        let keys = remaining
            .into_iter()
            .take(count)
            .map(|(_, key)| key)
            .filter(|key| matcher.is_match(key))
            .collect();
        Ok((next, keys))
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        Ok(self.remaining_ttl(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        Ok(self.apply_expire(key, ttl))
    }

    async fn ttl_many(&self, keys: &[String]) -> Result<Vec<i64>> {
        Ok(keys.iter().map(|k| self.remaining_ttl(k)).collect())
    }

    async fn expire_many(&self, entries: &[(String, Duration)]) -> Result<()> {
        for (key, ttl) in entries {
            self.apply_expire(key, *ttl);
        }
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove_if(key, |_, v| !v.is_expired(now) && v.value == expected)
            .is_some())
    }

    async fn memory_info(&self) -> Result<MemoryInfo> {
        let used: usize = self
            .entries
            .iter()
            .map(|e| e.key().len() + e.value().value.len())
            .sum();
        Ok(MemoryInfo {
            used_memory: used as u64,
            max_memory: self.max_memory.load(Ordering::Relaxed),
            total_system_memory: 0,
            used_memory_human: Some(format!("{used}B")),
        })
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
