//! Keyward Core - Shared Types
//!
//! Pure data structures and pure functions used by every other keyward crate.
//! Nothing in here performs I/O: backends, validity flags, leases and the
//! refresh orchestrator live in `keyward-storage`.

pub mod config;
pub mod error;
pub mod identity;
pub mod keyspace;
pub mod page;

pub use config::{CacheConfig, CacheMode, CacheModeParseError, RetryPolicy};
pub use error::{
    BackendError, BackendResult, CacheError, CacheResult, ConfigError, ErrorKind, RefreshError,
    RefreshStage,
};
pub use identity::{new_holder_token, uuid_key_segment, ScopeName};
pub use keyspace::{escape_segment, Keyspace, SYSTEM_CATEGORY};
pub use page::{total_pages, PageQuery, MAX_SAFE_PAGE_SIZE, STANDARD_PAGE_SIZES};
