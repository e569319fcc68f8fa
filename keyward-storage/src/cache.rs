//! RefreshCache - the caller-facing handle for one cache scope.
//!
//! Combines the backend, the key namer, the validity flag, the rebuild mutex
//! and the refresh orchestrator behind a cheaply cloneable handle. Reads of
//! cached payloads are gated on the validity flag and fail with
//! [`CacheError::Invalid`] while a rebuild is in flight or after one failed.
//! Writes, set operations and flag operations are plain passthroughs.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use keyward_core::{CacheConfig, CacheError, CacheResult, Keyspace};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::backend::{KeyTtl, KvBackend, FLAG_VALUE};
use crate::lease::RebuildMutex;
use crate::refresh::{RefreshCallbacks, RefreshCoordinator};
use crate::validity::ValidityFlag;

/// Handle to one cache scope.
///
/// Clones share all state, including the refresh coordinator, so a clone can
/// be handed to refresh callbacks or to other tasks freely.
pub struct RefreshCache<B: KvBackend> {
    pub(crate) inner: Arc<CacheInner<B>>,
}

pub(crate) struct CacheInner<B: KvBackend> {
    pub(crate) backend: Arc<B>,
    pub(crate) keyspace: Keyspace,
    pub(crate) config: CacheConfig,
    pub(crate) validity: ValidityFlag<B>,
    pub(crate) mutex: RebuildMutex<B>,
    pub(crate) callbacks: RwLock<RefreshCallbacks<B>>,
    pub(crate) coordinator: RefreshCoordinator,
}

impl<B: KvBackend> Clone for RefreshCache<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: KvBackend> fmt::Debug for RefreshCache<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshCache")
            .field("scope", &self.inner.keyspace.scope().as_str())
            .field("mode", &self.inner.config.mode)
            .finish_non_exhaustive()
    }
}

impl<B: KvBackend> RefreshCache<B> {
    /// Create a cache handle for `scope`.
    ///
    /// The cache starts invalid: nothing can be read until a refresh succeeds
    /// or [`RefreshCache::set_valid`] is called.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the scope name is unusable or the
    /// config fails [`CacheConfig::validate`].
    pub fn new(backend: Arc<B>, scope: impl Into<String>, config: CacheConfig) -> CacheResult<Self> {
        config.validate()?;
        let keyspace = Keyspace::new(scope)?;
        let validity = ValidityFlag::for_mode(Arc::clone(&backend), &keyspace, &config);
        let mutex = RebuildMutex::for_mode(Arc::clone(&backend), &keyspace, &config);

        Ok(Self {
            inner: Arc::new(CacheInner {
                backend,
                keyspace,
                config,
                validity,
                mutex,
                callbacks: RwLock::new(RefreshCallbacks::new()),
                coordinator: RefreshCoordinator::new(),
            }),
        })
    }

    /// Install the init and fill callbacks used by every subsequent refresh.
    pub fn register_callbacks(&self, callbacks: RefreshCallbacks<B>) {
        match self.inner.callbacks.write() {
            Ok(mut slot) => *slot = callbacks,
            Err(poisoned) => *poisoned.into_inner() = callbacks,
        }
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.inner.keyspace
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.inner.backend
    }

    pub(crate) fn scope(&self) -> &str {
        self.inner.keyspace.scope().as_str()
    }

    fn backend_err(&self, err: keyward_core::BackendError) -> CacheError {
        CacheError::backend(self.scope(), err)
    }

    // ========================================================================
    // VALIDITY
    // ========================================================================

    /// Whether cached payloads may currently be read.
    pub async fn is_valid(&self) -> bool {
        self.inner.validity.is_valid().await
    }

    pub async fn set_valid(&self) -> CacheResult<()> {
        self.inner.validity.set_valid().await
    }

    pub async fn set_invalid(&self) -> CacheResult<()> {
        self.inner.validity.set_invalid().await
    }

    async fn ensure_valid(&self) -> CacheResult<()> {
        if self.is_valid().await {
            Ok(())
        } else {
            Err(CacheError::Invalid {
                scope: self.scope().to_string(),
            })
        }
    }

    fn resolve_expiration(&self, expiration: Option<Duration>) -> CacheResult<Duration> {
        expiration
            .or(self.inner.config.default_expiration)
            .ok_or_else(|| {
                error!(scope = %self.scope(), "No expiration given and no default configured");
                CacheError::missing_config("default_expiration")
            })
    }

    // ========================================================================
    // PAYLOADS
    // ========================================================================

    /// Store a payload as JSON without expiration.
    pub async fn store<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> CacheResult<()> {
        let encoded = encode(key, value)?;
        self.inner
            .backend
            .set(key, encoded, None)
            .await
            .map_err(|e| self.backend_err(e))
    }

    /// Store a payload that expires after `expiration`, or the configured default.
    pub async fn store_with_expiration<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        expiration: Option<Duration>,
    ) -> CacheResult<()> {
        let expiration = self.resolve_expiration(expiration)?;
        let encoded = encode(key, value)?;
        self.inner
            .backend
            .set(key, encoded, Some(expiration))
            .await
            .map_err(|e| self.backend_err(e))
    }

    /// Read a payload.
    ///
    /// # Errors
    ///
    /// - [`CacheError::Invalid`] if the cache is not valid, whether or not the key exists.
    /// - [`CacheError::ItemNotFound`] if the key is absent.
    pub async fn read<T: DeserializeOwned>(&self, key: &str) -> CacheResult<T> {
        self.ensure_valid().await?;
        let raw = self
            .inner
            .backend
            .get(key)
            .await
            .map_err(|e| self.backend_err(e))?
            .ok_or_else(|| CacheError::ItemNotFound {
                key: key.to_string(),
            })?;
        decode(key, &raw)
    }

    /// Read a payload and slide its expiration forward.
    ///
    /// Keys without an expiration keep none. A failed expiration update is
    /// logged and does not fail the read.
    pub async fn read_with_expiration<T: DeserializeOwned>(
        &self,
        key: &str,
        expiration: Option<Duration>,
    ) -> CacheResult<T> {
        let expiration = self.resolve_expiration(expiration)?;
        let value = self.read(key).await?;

        match self.inner.backend.ttl(key).await {
            Ok(KeyTtl::Expiring(_)) => {
                if let Err(e) = self.inner.backend.expire(key, expiration).await {
                    warn!(scope = %self.scope(), key = %key, error = %e, "Failed to update expiration");
                }
            }
            Ok(KeyTtl::Persistent) | Ok(KeyTtl::Missing) => {
                warn!(scope = %self.scope(), key = %key, "Key has no expiration to update");
            }
            Err(e) => {
                warn!(scope = %self.scope(), key = %key, error = %e, "Failed to get expiration");
            }
        }
        Ok(value)
    }

    /// Read several payloads at once, skipping absent keys.
    ///
    /// Results keep the order of `keys`. The first undecodable payload fails
    /// the whole call.
    pub async fn read_group<T: DeserializeOwned>(&self, keys: &[String]) -> CacheResult<Vec<T>> {
        self.ensure_valid().await?;
        let raw = self
            .inner
            .backend
            .get_many(keys)
            .await
            .map_err(|e| self.backend_err(e))?;

        let mut values = Vec::with_capacity(raw.len());
        for (key, slot) in keys.iter().zip(raw) {
            match slot {
                Some(raw) => values.push(decode(key, &raw)?),
                None => debug!(scope = %self.scope(), key = %key, "Item not found in cache"),
            }
        }
        Ok(values)
    }

    /// Delete a key. Returns `true` if it existed.
    pub async fn delete(&self, key: &str) -> CacheResult<bool> {
        let removed = self
            .inner
            .backend
            .delete(&[key.to_string()])
            .await
            .map_err(|e| self.backend_err(e))?;
        Ok(removed > 0)
    }

    // ========================================================================
    // SETS
    // ========================================================================

    pub async fn add_to_set(&self, key: &str, item: &str) -> CacheResult<()> {
        self.inner
            .backend
            .set_add(key, item)
            .await
            .map_err(|e| self.backend_err(e))
    }

    pub async fn is_in_set(&self, key: &str, item: &str) -> CacheResult<bool> {
        self.inner
            .backend
            .set_contains(key, item)
            .await
            .map_err(|e| self.backend_err(e))
    }

    pub async fn set_members(&self, key: &str) -> CacheResult<HashSet<String>> {
        self.inner
            .backend
            .set_members(key)
            .await
            .map_err(|e| self.backend_err(e))
    }

    pub async fn remove_from_set(&self, key: &str, item: &str) -> CacheResult<()> {
        self.inner
            .backend
            .set_remove(key, item)
            .await
            .map_err(|e| self.backend_err(e))
    }

    // ========================================================================
    // FLAGS
    // ========================================================================

    pub async fn set_flag(&self, key: &str) -> CacheResult<()> {
        self.inner
            .backend
            .set(key, FLAG_VALUE.to_string(), None)
            .await
            .map_err(|e| self.backend_err(e))
    }

    pub async fn set_flag_with_expiration(
        &self,
        key: &str,
        expiration: Option<Duration>,
    ) -> CacheResult<()> {
        let expiration = self.resolve_expiration(expiration)?;
        self.inner
            .backend
            .set(key, FLAG_VALUE.to_string(), Some(expiration))
            .await
            .map_err(|e| self.backend_err(e))
    }

    /// Whether a flag is set.
    pub async fn get_flag(&self, key: &str) -> CacheResult<bool> {
        self.inner
            .backend
            .exists(key)
            .await
            .map_err(|e| self.backend_err(e))
    }

    pub async fn delete_flag(&self, key: &str) -> CacheResult<()> {
        self.delete(key).await.map(|_| ())
    }
}

fn encode<T: Serialize + ?Sized>(key: &str, value: &T) -> CacheResult<String> {
    serde_json::to_string(value).map_err(|e| CacheError::Serialization {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> CacheResult<T> {
    serde_json::from_str(raw).map_err(|e| {
        error!(key = %key, error = %e, "Failed to decode cached payload");
        CacheError::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        }
    })
}

// =============================================================================
// TESTS
// =============================================================================
