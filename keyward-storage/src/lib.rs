//! Keyward Storage - Backends and Refresh Coordination
//!
//! Everything that talks to a key-value backend: the [`KvBackend`] adapter
//! trait with in-memory and (feature `redis-backend`) Redis implementations,
//! the validity flag, the rebuild mutex, the refresh orchestrator, and the
//! [`RefreshCache`] handle callers work with.
//!
//! ```ignore
//! let backend = Arc::new(InMemoryBackend::new());
//! let cache = RefreshCache::new(backend, "products", CacheConfig::from_env())?;
//! cache.register_callbacks(RefreshCallbacks::new().on_fill(|cache| async move {
//!     let products = load_products().await.map_err(|e| CacheError::callback(RefreshStage::Fill, e))?;
//!     cache.store(&cache.keyspace().key_for_all(), &products).await
//! }));
//! cache.request_refresh(false);
//! ```

pub mod backend;
pub mod cache;
pub mod lease;
pub mod refresh;
pub mod validity;

pub use backend::{delete_matching, InMemoryBackend, KeyTtl, KvBackend};
#[cfg(feature = "redis-backend")]
pub use backend::RedisBackend;
pub use cache::RefreshCache;
pub use lease::{RebuildLease, RebuildMutex};
pub use refresh::{RefreshCallbacks, RefreshFn, RefreshReport, RefreshState};
pub use validity::ValidityFlag;

// Re-export the core types callers need alongside the cache handle
pub use keyward_core::{
    CacheConfig, CacheError, CacheMode, CacheResult, ErrorKind, Keyspace, PageQuery, RefreshStage,
    RetryPolicy,
};
