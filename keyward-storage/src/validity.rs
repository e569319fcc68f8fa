//! Cache validity flag.
//!
//! Readers consult the flag before every read; the refresh orchestrator
//! clears it before touching data and sets it once a rebuild succeeds.
//!
//! In single-instance mode the flag is a process-local atomic. In
//! multi-server mode it is the presence of a system key in the shared
//! backend, written without expiration so it never lapses on its own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use keyward_core::{CacheConfig, CacheError, CacheMode, CacheResult, Keyspace};
use tracing::{debug, error};

use crate::backend::{KvBackend, FLAG_VALUE};

/// Validity flag for one cache scope.
pub enum ValidityFlag<B: KvBackend> {
    Local {
        valid: AtomicBool,
        scope: String,
    },
    Shared {
        backend: Arc<B>,
        key: String,
        scope: String,
    },
}

impl<B: KvBackend> ValidityFlag<B> {
    /// Build the flag for the configured mode. A fresh local flag starts invalid.
    pub fn for_mode(backend: Arc<B>, keyspace: &Keyspace, config: &CacheConfig) -> Self {
        match config.mode {
            CacheMode::SingleInstance => ValidityFlag::Local {
                valid: AtomicBool::new(false),
                scope: keyspace.scope().to_string(),
            },
            CacheMode::MultiServer => ValidityFlag::Shared {
                backend,
                key: keyspace.key_for_system(&config.validity_flag_name),
                scope: keyspace.scope().to_string(),
            },
        }
    }

    /// Whether reads are currently permitted.
    ///
    /// A backend failure while checking the shared flag is logged and
    /// reported as invalid, so callers fall back to the source of truth.
    pub async fn is_valid(&self) -> bool {
        match self {
            ValidityFlag::Local { valid, .. } => valid.load(Ordering::Acquire),
            ValidityFlag::Shared {
                backend,
                key,
                scope,
            } => match backend.exists(key).await {
                Ok(present) => present,
                Err(e) => {
                    error!(scope = %scope, error = %e, "Failed to check cache validity flag");
                    false
                }
            },
        }
    }

    pub async fn set_valid(&self) -> CacheResult<()> {
        match self {
            ValidityFlag::Local { valid, .. } => valid.store(true, Ordering::Release),
            ValidityFlag::Shared {
                backend,
                key,
                scope,
            } => backend
                .set(key, FLAG_VALUE.to_string(), None)
                .await
                .map_err(|e| CacheError::backend(scope.as_str(), e))?,
        }
        debug!(scope = %self.scope(), "Cache marked valid");
        Ok(())
    }

    pub async fn set_invalid(&self) -> CacheResult<()> {
        match self {
            ValidityFlag::Local { valid, .. } => valid.store(false, Ordering::Release),
            ValidityFlag::Shared {
                backend,
                key,
                scope,
            } => {
                backend
                    .delete(std::slice::from_ref(key))
                    .await
                    .map_err(|e| CacheError::backend(scope.as_str(), e))?;
            }
        }
        debug!(scope = %self.scope(), "Cache marked invalid");
        Ok(())
    }

    fn scope(&self) -> &str {
        match self {
            ValidityFlag::Local { scope, .. } | ValidityFlag::Shared { scope, .. } => scope,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
