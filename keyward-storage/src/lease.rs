//! Rebuild mutex.
//!
//! At most one refresh of a scope runs at a time. Acquisition never blocks:
//! a caller that loses the race gets [`RefreshError::MutexUnavailable`] and
//! decides for itself what to do about it.
//!
//! Single-instance mode uses an in-process `tokio::sync::Mutex`. Multi-server
//! mode uses an atomic SET NX PX on a system key, stamped with a unique
//! holder token. The lease expires after the configured duration, so a holder
//! that dies mid-refresh cannot block the scope forever, and release only
//! deletes the key while it still carries the holder's token.

use std::sync::Arc;
use std::time::Duration;

use keyward_core::{
    new_holder_token, CacheConfig, CacheError, CacheMode, CacheResult, Keyspace, RefreshError,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::backend::KvBackend;

/// Proof of holding the rebuild mutex.
///
/// Dropping a local lease unlocks it. Dropping a distributed lease does
/// nothing: it stays held until [`RebuildMutex::release`] or expiry.
#[derive(Debug)]
pub enum RebuildLease {
    Local(OwnedMutexGuard<()>),
    Distributed { token: String },
}

impl RebuildLease {
    /// Holder token of a distributed lease.
    pub fn token(&self) -> Option<&str> {
        match self {
            RebuildLease::Local(_) => None,
            RebuildLease::Distributed { token } => Some(token),
        }
    }
}

/// Rebuild mutex for one cache scope.
pub enum RebuildMutex<B: KvBackend> {
    Local {
        lock: Arc<Mutex<()>>,
        scope: String,
    },
    Distributed {
        backend: Arc<B>,
        key: String,
        scope: String,
        lease_duration: Option<Duration>,
    },
}

impl<B: KvBackend> RebuildMutex<B> {
    pub fn for_mode(backend: Arc<B>, keyspace: &Keyspace, config: &CacheConfig) -> Self {
        match config.mode {
            CacheMode::SingleInstance => RebuildMutex::Local {
                lock: Arc::new(Mutex::new(())),
                scope: keyspace.scope().to_string(),
            },
            CacheMode::MultiServer => RebuildMutex::Distributed {
                backend,
                key: keyspace.key_for_system(&config.lease_flag_name),
                scope: keyspace.scope().to_string(),
                lease_duration: config.lease_duration,
            },
        }
    }

    /// Try to take the mutex without waiting.
    ///
    /// # Errors
    ///
    /// - [`RefreshError::MutexUnavailable`] if another holder has it.
    /// - Missing configuration if a distributed lease has no duration.
    /// - Backend errors from the SET NX call.
    pub async fn try_acquire(&self) -> CacheResult<RebuildLease> {
        match self {
            RebuildMutex::Local { lock, scope } => lock
                .clone()
                .try_lock_owned()
                .map(RebuildLease::Local)
                .map_err(|_| {
                    CacheError::from(RefreshError::MutexUnavailable {
                        scope: scope.clone(),
                    })
                }),
            RebuildMutex::Distributed {
                backend,
                key,
                scope,
                lease_duration,
            } => {
                let duration =
                    lease_duration.ok_or_else(|| CacheError::missing_config("lease_duration"))?;
                let token = new_holder_token();
                let acquired = backend
                    .set_if_absent(key, token.clone(), duration)
                    .await
                    .map_err(|e| CacheError::backend(scope.as_str(), e))?;
                if acquired {
                    debug!(scope = %scope, token = %token, "Rebuild lease acquired");
                    Ok(RebuildLease::Distributed { token })
                } else {
                    Err(CacheError::from(RefreshError::MutexUnavailable {
                        scope: scope.clone(),
                    }))
                }
            }
        }
    }

    /// Give the mutex back.
    ///
    /// A distributed lease that already expired and was taken by another
    /// holder is left alone; that case is logged.
    pub async fn release(&self, lease: RebuildLease) -> CacheResult<()> {
        match (self, lease) {
            (RebuildMutex::Local { .. }, RebuildLease::Local(guard)) => {
                drop(guard);
                Ok(())
            }
            (
                RebuildMutex::Distributed {
                    backend,
                    key,
                    scope,
                    ..
                },
                RebuildLease::Distributed { token },
            ) => {
                let removed = backend
                    .delete_if_equals(key, &token)
                    .await
                    .map_err(|e| CacheError::backend(scope.as_str(), e))?;
                if removed {
                    debug!(scope = %scope, token = %token, "Rebuild lease released");
                } else {
                    warn!(
                        scope = %scope,
                        token = %token,
                        "Rebuild lease expired before release"
                    );
                }
                Ok(())
            }
            (_, lease) => {
                warn!(lease = ?lease, "Released a lease of the wrong kind, ignoring");
                Ok(())
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
