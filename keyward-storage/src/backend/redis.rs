//! Redis-backed [`KvBackend`].
//!
//! Uses a multiplexed `ConnectionManager`, which reconnects on its own and is
//! cheap to clone per call. Every operation is a single raw command except
//! the lease release, which runs a small compare-and-delete Lua script so the
//! check and the delete happen atomically on the server.

use std::collections::HashSet;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{Client, RedisError, Script};
use async_trait::async_trait;
use keyward_core::{BackendError, BackendResult};

use super::{KeyTtl, KvBackend};

const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Redis-backed cache backend.
///
/// # Example
///
/// ```ignore
/// let backend = RedisBackend::connect("redis://127.0.0.1:6379").await?;
/// let cache = RefreshCache::new(Arc::new(backend), "products", config)?;
/// ```
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    compare_and_delete: Script,
}

impl RedisBackend {
    /// Connect to the server at `url`.
    pub async fn connect(url: &str) -> BackendResult<Self> {
        let client = Client::open(url).map_err(|e| map_err("connect", e))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| map_err("connect", e))?;
        Ok(Self::from_manager(conn))
    }

    /// Wrap an existing connection manager.
    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self {
            conn,
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
        }
    }
}

fn map_err(operation: &str, e: RedisError) -> BackendError {
    BackendError::unavailable(operation, e)
}

fn millis(d: Duration) -> u64 {
    // PX 0 is rejected by the server.
    (d.as_millis() as u64).max(1)
}

#[async_trait]
impl KvBackend for RedisBackend {
    async fn set(
        &self,
        key: &str,
        value: String,
        expiration: Option<Duration>,
    ) -> BackendResult<()> {
        let mut conn = self.conn.clone();
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(expiration) = expiration {
            cmd.arg("PX").arg(millis(expiration));
        }
        let _: () = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| map_err("SET", e))?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        expiration: Duration,
    ) -> BackendResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(expiration))
            .query_async(&mut conn)
            .await
            .map_err(|e| map_err("SET NX", e))?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        let mut conn = self.conn.clone();
        ::redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_err("GET", e))
    }

    async fn get_many(&self, keys: &[String]) -> BackendResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        ::redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_err("MGET", e))
    }

    async fn delete(&self, keys: &[String]) -> BackendResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        ::redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_err("DEL", e))
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> BackendResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_err("EVALSHA", e))?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, expiration: Duration) -> BackendResult<bool> {
        let mut conn = self.conn.clone();
        let updated: i64 = ::redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(expiration))
            .query_async(&mut conn)
            .await
            .map_err(|e| map_err("PEXPIRE", e))?;
        Ok(updated == 1)
    }

    async fn ttl(&self, key: &str) -> BackendResult<KeyTtl> {
        let mut conn = self.conn.clone();
        let ms: i64 = ::redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_err("PTTL", e))?;
        Ok(match ms {
            -2 => KeyTtl::Missing,
            -1 => KeyTtl::Persistent,
            ms => KeyTtl::Expiring(Duration::from_millis(ms.max(0) as u64)),
        })
    }

    async fn exists(&self, key: &str) -> BackendResult<bool> {
        let mut conn = self.conn.clone();
        let count: i64 = ::redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_err("EXISTS", e))?;
        Ok(count > 0)
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> BackendResult<(u64, Vec<String>)> {
        let mut conn = self.conn.clone();
        ::redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_err("SCAN", e))
    }

    async fn set_add(&self, key: &str, member: &str) -> BackendResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = ::redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_err("SADD", e))?;
        Ok(())
    }

    async fn set_contains(&self, key: &str, member: &str) -> BackendResult<bool> {
        let mut conn = self.conn.clone();
        let found: i64 = ::redis::cmd("SISMEMBER")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_err("SISMEMBER", e))?;
        Ok(found == 1)
    }

    async fn set_members(&self, key: &str) -> BackendResult<HashSet<String>> {
        let mut conn = self.conn.clone();
        ::redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_err("SMEMBERS", e))
    }

    async fn set_remove(&self, key: &str, member: &str) -> BackendResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = ::redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_err("SREM", e))?;
        Ok(())
    }
}
