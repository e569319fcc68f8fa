//! Error types for keyward operations

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Backend adapter errors.
///
/// Absence of a key is reported as [`BackendError::NotFound`] so callers can
/// branch on it without treating it as a hard failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("Key not found: {key}")]
    NotFound { key: String },

    #[error("Backend unavailable during {operation}: {reason}")]
    Unavailable { operation: String, reason: String },

    #[error("Operation against a key holding the wrong kind of value: {key}")]
    WrongType { key: String },

    #[error("Backend lock poisoned")]
    LockPoisoned,
}

impl BackendError {
    /// Build an [`BackendError::Unavailable`] from any displayable cause.
    pub fn unavailable(operation: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Unavailable {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for backend adapter calls.
pub type BackendResult<T> = Result<T, BackendError>;

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Steps of a single refresh attempt, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshStage {
    Invalidate,
    Purge,
    Init,
    Fill,
    Validate,
}

impl RefreshStage {
    /// All stages in execution order.
    pub const ORDER: [RefreshStage; 5] = [
        RefreshStage::Invalidate,
        RefreshStage::Purge,
        RefreshStage::Init,
        RefreshStage::Fill,
        RefreshStage::Validate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshStage::Invalidate => "invalidate",
            RefreshStage::Purge => "purge",
            RefreshStage::Init => "init",
            RefreshStage::Fill => "fill",
            RefreshStage::Validate => "validate",
        }
    }
}

impl fmt::Display for RefreshStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Refresh coordination errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RefreshError {
    /// Someone else holds the rebuild lock or lease.
    #[error("Refresh already running for scope {scope}")]
    MutexUnavailable { scope: String },

    #[error("Refresh {stage} callback failed: {reason}")]
    CallbackFailed { stage: RefreshStage, reason: String },

    #[error("Refresh failed after {attempts} attempts, last error: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<CacheError>,
    },
}

/// Coarse classification of every [`CacheError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Reads attempted while the dataset is being rebuilt or a rebuild failed.
    CacheInvalid,
    /// The key is absent. A normal outcome.
    ItemNotFound,
    /// A required setting was never supplied.
    ConfigurationMissing,
    /// The remote store call failed.
    BackendUnavailable,
    /// Another holder is already refreshing.
    MutexUnavailable,
    /// A payload could not be encoded or decoded.
    Serialization,
    /// A refresh sequence failed.
    RefreshFailed,
}

/// Master error type for all keyward errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache {scope} is invalid")]
    Invalid { scope: String },

    #[error("Item not found in cache: {key}")]
    ItemNotFound { key: String },

    #[error("Cache {scope}: {source}")]
    Backend { scope: String, source: BackendError },

    #[error("Serialization error for {key}: {reason}")]
    Serialization { key: String, reason: String },

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Refresh error: {0}")]
    Refresh(#[from] RefreshError),
}

impl CacheError {
    /// Wrap a backend error with scope context.
    ///
    /// `NotFound` becomes [`CacheError::ItemNotFound`]; everything else keeps
    /// the backend error as its source.
    pub fn backend(scope: impl Into<String>, err: BackendError) -> Self {
        match err {
            BackendError::NotFound { key } => CacheError::ItemNotFound { key },
            other => CacheError::Backend {
                scope: scope.into(),
                source: other,
            },
        }
    }

    /// Build a [`RefreshError::CallbackFailed`] from any displayable cause.
    ///
    /// Intended for init and fill callbacks reporting source-of-truth failures.
    pub fn callback(stage: RefreshStage, reason: impl fmt::Display) -> Self {
        CacheError::Refresh(RefreshError::CallbackFailed {
            stage,
            reason: reason.to_string(),
        })
    }

    pub fn missing_config(field: impl Into<String>) -> Self {
        CacheError::Config(ConfigError::MissingRequired {
            field: field.into(),
        })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CacheError::Invalid { .. } => ErrorKind::CacheInvalid,
            CacheError::ItemNotFound { .. } => ErrorKind::ItemNotFound,
            CacheError::Backend { .. } => ErrorKind::BackendUnavailable,
            CacheError::Serialization { .. } => ErrorKind::Serialization,
            CacheError::Config(_) => ErrorKind::ConfigurationMissing,
            CacheError::Refresh(RefreshError::MutexUnavailable { .. }) => {
                ErrorKind::MutexUnavailable
            }
            CacheError::Refresh(_) => ErrorKind::RefreshFailed,
        }
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, CacheError::Invalid { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::ItemNotFound { .. })
    }
}

/// Result type alias for keyward operations.
pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// TESTS
// =============================================================================
