//! Keyward Test Utilities
//!
//! Centralized test infrastructure for the keyward workspace:
//! - Proptest generators for scopes, key segments, page queries and payloads
//! - A scripted fill callback that fails on demand and tracks concurrency
//! - Test fixtures for common configurations
//! - Custom assertions for keyward error outcomes

// Re-export the types every test needs
pub use keyward_core::{
    CacheConfig, CacheError, CacheMode, CacheResult, ErrorKind, Keyspace, PageQuery, RefreshStage,
    RetryPolicy,
};
pub use keyward_storage::{
    InMemoryBackend, KvBackend, RefreshCache, RefreshCallbacks, RefreshReport, RefreshState,
};

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// TRACING
// ============================================================================

static TRACING: Once = Once::new();

/// Install a test subscriber once per process. Honors `RUST_LOG`, defaulting to `warn`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// SCRIPTED FILL
// ============================================================================

/// Fill callback with scripted failures and concurrency tracking.
///
/// Each call counts itself, tracks how many fills are running at once, waits
/// for the configured delay, then either fails (while failures remain) or
/// stores its entries through the cache handle it was given.
#[derive(Debug, Clone, Default)]
pub struct ScriptedFill {
    state: Arc<ScriptState>,
    delay: Option<Duration>,
    entries: Arc<Vec<(String, serde_json::Value)>>,
}

#[derive(Debug, Default)]
struct ScriptState {
    failures_remaining: AtomicU32,
    calls: AtomicU32,
    active: AtomicU32,
    max_active: AtomicU32,
}

impl ScriptedFill {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `n` calls.
    pub fn failing(self, n: u32) -> Self {
        self.state.failures_remaining.store(n, Ordering::SeqCst);
        self
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Store these entries on every successful call.
    pub fn with_entries(mut self, entries: Vec<(String, serde_json::Value)>) -> Self {
        self.entries = Arc::new(entries);
        self
    }

    /// Total calls so far, failed ones included.
    pub fn calls(&self) -> u32 {
        self.state.calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls ever in flight at once.
    pub fn max_concurrent(&self) -> u32 {
        self.state.max_active.load(Ordering::SeqCst)
    }

    /// Callbacks that run this script as the fill step.
    pub fn callbacks<B: KvBackend>(&self) -> RefreshCallbacks<B> {
        let script = self.clone();
        RefreshCallbacks::new().on_fill(move |cache| {
            let script = script.clone();
            async move { script.run(cache).await }
        })
    }

    async fn run<B: KvBackend>(&self, cache: RefreshCache<B>) -> CacheResult<()> {
        let state = &self.state;
        state.calls.fetch_add(1, Ordering::SeqCst);
        let now_active = state.active.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_active.fetch_max(now_active, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let failing = state
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        let result = if failing {
            Err(CacheError::callback(RefreshStage::Fill, "scripted failure"))
        } else {
            let mut outcome = Ok(());
            for (key, value) in self.entries.iter() {
                if let Err(e) = cache.store(key, value).await {
                    outcome = Err(e);
                    break;
                }
            }
            outcome
        };

        state.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for keyward inputs.

    use super::*;
    use proptest::prelude::*;

    /// Generate a random UUID.
    pub fn arb_uuid() -> impl Strategy<Value = Uuid> {
        any::<[u8; 16]>().prop_map(Uuid::from_bytes)
    }

    /// Generate a valid scope name.
    pub fn arb_scope_name() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_.-]{0,15}"
    }

    /// Generate arbitrary key text, separators and escape characters included.
    pub fn arb_segment() -> impl Strategy<Value = String> {
        prop_oneof![
            "[a-zA-Z0-9_]{0,8}",
            "[a-z:|%]{0,8}",
            Just(String::new()),
            Just("ALL".to_string()),
            Just("SYS".to_string()),
        ]
    }

    pub fn arb_page_query() -> impl Strategy<Value = PageQuery> {
        (
            prop_oneof![Just(0i64), Just(25), Just(50), Just(100), -5i64..500],
            -5i64..1000,
            prop_oneof![Just("asc".to_string()), Just("desc".to_string()), arb_segment()],
            arb_segment(),
        )
            .prop_map(|(page_size, page, direction, sort)| {
                PageQuery::new(page_size, page).sorted_by(sort, direction)
            })
    }

    /// Generate a JSON payload. Numbers are integers so text round-trips exactly.
    pub fn arb_json_payload() -> impl Strategy<Value = serde_json::Value> {
        let leaf = prop_oneof![
            Just(serde_json::Value::Null),
            any::<bool>().prop_map(serde_json::Value::from),
            any::<i64>().prop_map(serde_json::Value::from),
            ".{0,12}".prop_map(serde_json::Value::from),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(serde_json::Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| serde_json::Value::Object(m.into_iter().collect())),
            ]
        })
    }

    pub fn arb_product() -> impl Strategy<Value = Product> {
        (arb_uuid(), ".{0,16}", any::<u32>(), prop::collection::vec("[a-z]{1,5}", 0..3))
            .prop_map(|(id, name, stock, tags)| Product {
                id,
                name,
                stock,
                tags,
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

/// Sample cached entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub stock: u32,
    pub tags: Vec<String>,
}

pub mod fixtures {
    //! Pre-built test fixtures for common testing scenarios.

    use super::*;

    /// Single-instance config with a 1ms retry base so failures retry quickly.
    pub fn fast_config() -> CacheConfig {
        CacheConfig::new().with_retry(RetryPolicy::new(3, Duration::from_millis(1), 2))
    }

    /// Multi-server variant of [`fast_config`].
    pub fn multi_server_config(lease: Duration) -> CacheConfig {
        fast_config().multi_server(lease)
    }

    pub fn product(name: &str, stock: u32) -> Product {
        Product {
            id: Uuid::now_v7(),
            name: name.to_string(),
            stock,
            tags: vec!["fixture".to_string()],
        }
    }

    /// Cache over a fresh in-memory backend.
    pub fn memory_cache(
        scope: &str,
        config: CacheConfig,
    ) -> (Arc<InMemoryBackend>, RefreshCache<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::new());
        let cache = RefreshCache::new(Arc::clone(&backend), scope, config)
            .expect("fixture config is valid");
        (backend, cache)
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Custom assertion functions for keyward outcomes.

    use super::*;

    /// Assert that a CacheResult failed with the given kind.
    #[track_caller]
    pub fn assert_kind<T: std::fmt::Debug>(result: &CacheResult<T>, kind: ErrorKind) {
        match result {
            Err(e) => assert_eq!(e.kind(), kind, "Wrong error kind: {:?}", e),
            Ok(v) => panic!("Expected {:?} error, got Ok({:?})", kind, v),
        }
    }

    /// Assert that a read was refused because the cache is invalid.
    #[track_caller]
    pub fn assert_invalid<T: std::fmt::Debug>(result: &CacheResult<T>) {
        assert_kind(result, ErrorKind::CacheInvalid);
    }

    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &CacheResult<T>) {
        assert_kind(result, ErrorKind::ItemNotFound);
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fast_config_is_valid() {
        assert!(fixtures::fast_config().validate().is_ok());
        assert!(fixtures::multi_server_config(Duration::from_millis(50))
            .validate()
            .is_ok());
    }

    #[tokio::test]
    async fn test_scripted_fill_fails_then_stores() {
        let (_, cache) = fixtures::memory_cache("script", fixtures::fast_config());
        let script = ScriptedFill::new()
            .failing(1)
            .with_entries(vec![("script:ALL".to_string(), serde_json::json!([1, 2]))]);

        assert!(script.run(cache.clone()).await.is_err());
        assert!(script.run(cache.clone()).await.is_ok());
        assert_eq!(script.calls(), 2);
        assert_eq!(script.max_concurrent(), 1);

        cache.set_valid().await.unwrap();
        let stored: Vec<u32> = cache.read("script:ALL").await.unwrap();
        assert_eq!(stored, vec![1, 2]);
    }

    proptest! {
        #[test]
        fn prop_generated_scope_names_are_accepted(scope in generators::arb_scope_name()) {
            prop_assert!(Keyspace::new(scope).is_ok());
        }
    }
}
