//! Key-value backend adapters.
//!
//! [`KvBackend`] is a thin pass-through over the handful of remote-store
//! primitives the cache needs. Adapters own no coordination logic: the
//! validity flag, the rebuild lease and the refresh orchestrator are all
//! built on top of this trait.
//!
//! Values are opaque strings (the cache stores JSON text in them). Sets are
//! unordered collections of strings living under their own key.

pub mod memory;
#[cfg(feature = "redis-backend")]
pub mod redis;

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use keyward_core::BackendResult;

pub use memory::InMemoryBackend;
#[cfg(feature = "redis-backend")]
pub use self::redis::RedisBackend;

/// Value written under presence-only keys (flags, the validity marker).
pub const FLAG_VALUE: &str = "1";

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist.
    Missing,
    /// The key exists and never expires.
    Persistent,
    /// The key exists and expires after the given duration.
    Expiring(Duration),
}

/// Remote key-value store operations.
///
/// Implementations must be safe for concurrent use: the cache shares one
/// backend between any number of readers and the refresh task.
#[async_trait]
pub trait KvBackend: Send + Sync + 'static {
    /// SET, optionally with an expiration.
    async fn set(&self, key: &str, value: String, expiration: Option<Duration>)
        -> BackendResult<()>;

    /// Atomic SET-if-not-exists with a mandatory expiration.
    ///
    /// Returns `true` if this call created the key.
    async fn set_if_absent(&self, key: &str, value: String, expiration: Duration)
        -> BackendResult<bool>;

    /// GET. `None` if the key does not exist.
    async fn get(&self, key: &str) -> BackendResult<Option<String>>;

    /// MGET. One slot per requested key, in request order.
    async fn get_many(&self, keys: &[String]) -> BackendResult<Vec<Option<String>>>;

    /// DEL. Returns the number of keys removed.
    async fn delete(&self, keys: &[String]) -> BackendResult<u64>;

    /// Atomically delete `key` only if it currently holds `expected`.
    ///
    /// Returns `true` if the key was removed.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> BackendResult<bool>;

    /// Reset the expiration of an existing key. Returns `false` if the key is missing.
    async fn expire(&self, key: &str, expiration: Duration) -> BackendResult<bool>;

    /// Remaining lifetime of a key.
    async fn ttl(&self, key: &str) -> BackendResult<KeyTtl>;

    /// EXISTS.
    async fn exists(&self, key: &str) -> BackendResult<bool>;

    /// One SCAN step.
    ///
    /// Returns the next cursor and a batch of matching keys. A returned
    /// cursor of `0` means the iteration is complete. `count` is a hint.
    async fn scan(&self, cursor: u64, pattern: &str, count: usize)
        -> BackendResult<(u64, Vec<String>)>;

    /// SADD.
    async fn set_add(&self, key: &str, member: &str) -> BackendResult<()>;

    /// SISMEMBER.
    async fn set_contains(&self, key: &str, member: &str) -> BackendResult<bool>;

    /// SMEMBERS.
    async fn set_members(&self, key: &str) -> BackendResult<HashSet<String>>;

    /// SREM.
    async fn set_remove(&self, key: &str, member: &str) -> BackendResult<()>;
}

/// Delete every key matching `pattern`, one SCAN batch at a time.
///
/// Keys for which `keep` returns `true` are left in place. Returns the number
/// of keys removed.
pub async fn delete_matching<B, F>(
    backend: &B,
    pattern: &str,
    batch_size: usize,
    keep: F,
) -> BackendResult<u64>
where
    B: KvBackend + ?Sized,
    F: Fn(&str) -> bool,
{
    let mut cursor = 0u64;
    let mut removed = 0u64;
    loop {
        let (next, keys) = backend.scan(cursor, pattern, batch_size).await?;
        let doomed: Vec<String> = keys.into_iter().filter(|k| !keep(k)).collect();
        if !doomed.is_empty() {
            removed += backend.delete(&doomed).await?;
        }
        if next == 0 {
            break;
        }
        cursor = next;
    }
    Ok(removed)
}
