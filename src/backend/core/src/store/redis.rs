//! Redis-backed store over one shared `ConnectionManager`.

use async_trait::async_trait;
use ::redis::aio::ConnectionManager;
use ::redis::{RedisResult, Value};
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

use super::{ttl_secs, KeyValueStore, MemoryInfo, StoreCapabilities};
use crate::error::{CoreError, ErrorCode, ErrorContext, Result};

/// Deletes KEYS[1] only if it still holds ARGV[1].
const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Redis [`KeyValueStore`].
///
/// The connection manager multiplexes every caller over one connection and
/// reconnects on its own, so clones of the store share a single socket.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    capabilities: StoreCapabilities,
    command_timeout: Duration,
    compare_and_delete: ::redis::Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("capabilities", &self.capabilities)
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

impl RedisStore {
    /// Connect, verify with `PING` and probe optional commands.
    pub async fn connect(url: &str, command_timeout: Duration) -> Result<Self> {
        let client = ::redis::Client::open(url)
            .context(ErrorCode::CacheConnectionFailed, "Failed to create Redis client")?;

        let conn = tokio::time::timeout(command_timeout * 5, ConnectionManager::new(client))
            .await?
            .context(ErrorCode::CacheConnectionFailed, "Failed to connect to Redis")?;

        let mut store = Self {
            conn,
            capabilities: StoreCapabilities::default(),
            command_timeout,
            compare_and_delete: ::redis::Script::new(COMPARE_AND_DELETE),
        };
        store.ping().await?;
        store.capabilities = store.probe_capabilities().await;

        info!(
            unlink = store.capabilities.unlink,
            atomic_compare_delete = store.capabilities.atomic_compare_delete,
            "Redis store connected"
        );
        Ok(store)
    }

    async fn probe_capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            unlink: self.command_known("UNLINK").await,
            atomic_compare_delete: self.command_known("EVAL").await,
        }
    }

    /// `COMMAND INFO <name>` answers with a nil entry for unknown commands.
    async fn command_known(&self, name: &str) -> bool {
        let mut conn = self.conn.clone();
        let reply: Result<Value> = self
            .run(::redis::cmd("COMMAND").arg("INFO").arg(name).query_async(&mut conn))
            .await;
        match reply {
            Ok(Value::Bulk(items)) => matches!(items.first(), Some(v) if *v != Value::Nil),
            Ok(_) => false,
            Err(e) => {
                warn!(command = name, error = %e, "Capability probe failed, assuming unsupported");
                false
            }
        }
    }

    /// Bound a Redis call by the command timeout.
    async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        tokio::time::timeout(self.command_timeout, fut).await?.map_err(CoreError::from)
    }

    async fn config_maxmemory(&self) -> Option<u64> {
        let mut conn = self.conn.clone();
        let reply: Result<Vec<String>> = self
            .run(::redis::cmd("CONFIG").arg("GET").arg("maxmemory").query_async(&mut conn))
            .await;
        // Managed Redis often disables CONFIG; INFO is the fallback.
        reply.ok()?.get(1)?.parse().ok()
    }
}

/// Pull the fields we need out of an `INFO memory` reply.
pub(crate) fn parse_memory_info(info: &str) -> MemoryInfo {
    let mut parsed = MemoryInfo::default();
    for line in info.lines() {
        let Some((field, value)) = line.trim().split_once(':') else {
            continue;
        };
        match field {
            "used_memory" => parsed.used_memory = value.parse().unwrap_or(0),
            "maxmemory" => parsed.max_memory = value.parse().unwrap_or(0),
            "total_system_memory" => parsed.total_system_memory = value.parse().unwrap_or(0),
            "used_memory_human" => parsed.used_memory_human = Some(value.to_string()),
            _ => {}
        }
    }
    parsed
}

#[async_trait]
impl KeyValueStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn capabilities(&self) -> StoreCapabilities {
        self.capabilities
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        self.run(::redis::cmd("GET").arg(key).query_async(&mut conn)).await
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        self.run(::redis::cmd("MGET").arg(keys).query_async(&mut conn)).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        self.run(
            ::redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl_secs(ttl))
                .query_async(&mut conn),
        )
        .await
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = self
            .run(
                ::redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl_secs(ttl))
                    .query_async(&mut conn),
            )
            .await?;
        Ok(reply.is_some())
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        self.run(::redis::cmd("DEL").arg(keys).query_async(&mut conn)).await
    }

    async fn unlink(&self, keys: &[String]) -> Result<u64> {
        if !self.capabilities.unlink {
            return self.del(keys).await;
        }
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        self.run(::redis::cmd("UNLINK").arg(keys).query_async(&mut conn)).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let count: u64 = self
            .run(::redis::cmd("EXISTS").arg(key).query_async(&mut conn))
            .await?;
        Ok(count > 0)
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
        let mut conn = self.conn.clone();
        self.run(
            ::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(count)
                .query_async(&mut conn),
        )
        .await
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        self.run(::redis::cmd("TTL").arg(key).query_async(&mut conn)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let updated: i64 = self
            .run(
                ::redis::cmd("EXPIRE")
                    .arg(key)
                    .arg(ttl_secs(ttl))
                    .query_async(&mut conn),
            )
            .await?;
        Ok(updated > 0)
    }

    async fn ttl_many(&self, keys: &[String]) -> Result<Vec<i64>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = ::redis::pipe();
        for key in keys {
            pipe.cmd("TTL").arg(key);
        }
        let mut conn = self.conn.clone();
        self.run(pipe.query_async(&mut conn)).await
    }

    async fn expire_many(&self, entries: &[(String, Duration)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut pipe = ::redis::pipe();
        for (key, ttl) in entries {
            pipe.cmd("EXPIRE").arg(key).arg(ttl_secs(*ttl)).ignore();
        }
        let mut conn = self.conn.clone();
        self.run(pipe.query_async(&mut conn)).await
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        if self.capabilities.atomic_compare_delete {
            let deleted: i64 = self
                .run(
                    self.compare_and_delete
                        .key(key)
                        .arg(expected)
                        .invoke_async(&mut conn),
                )
                .await?;
            return Ok(deleted > 0);
        }

        // Read-then-delete. Only the token holder deletes within the TTL window.
        let current: Option<String> = self
            .run(::redis::cmd("GET").arg(key).query_async(&mut conn))
            .await?;
        if current.as_deref() != Some(expected) {
            return Ok(false);
        }
        let deleted: u64 = self
            .run(::redis::cmd("DEL").arg(key).query_async(&mut conn))
            .await?;
        Ok(deleted > 0)
    }

    async fn memory_info(&self) -> Result<MemoryInfo> {
        let mut conn = self.conn.clone();
        let info: String = self
            .run(::redis::cmd("INFO").arg("memory").query_async(&mut conn))
            .await?;
        let mut parsed = parse_memory_info(&info);
        if let Some(max) = self.config_maxmemory().await {
            parsed.max_memory = max;
        }
        Ok(parsed)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = self.run(::redis::cmd("PING").query_async(&mut conn)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_info() {
        let info = "# Memory\r\nused_memory:1048576\r\nused_memory_human:1.00M\r\n\
                    total_system_memory:8589934592\r\nmaxmemory:2097152\r\nmaxmemory_policy:allkeys-lru\r\n";
        let parsed = parse_memory_info(info);
        assert_eq!(parsed.used_memory, 1_048_576);
        assert_eq!(parsed.max_memory, 2_097_152);
        assert_eq!(parsed.total_system_memory, 8_589_934_592);
        assert_eq!(parsed.used_memory_human.as_deref(), Some("1.00M"));
        assert_eq!(parsed.usage_percent(), Some(50.0));
    }

    #[test]
    fn test_parse_memory_info_without_limit() {
        let parsed = parse_memory_info("used_memory:100\nmaxmemory:0\ntotal_system_memory:1000\n");
        assert_eq!(parsed.effective_max(), Some(1000));
    }
}
