//! Refresh coordination scenarios: single-flight, retry, force coalescing,
//! lease expiry and multi-server sharing, all against the in-memory backend.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use keyward_core::{BackendError, BackendResult};
use keyward_storage::{
    CacheConfig, CacheMode, ErrorKind, InMemoryBackend, KeyTtl, KvBackend, RebuildMutex,
    RefreshCache, RefreshStage, RefreshState, RetryPolicy,
};
use keyward_test_utils::{fixtures, init_tracing, ScriptedFill};

/// Poll `cond` every millisecond for up to a second.
async fn wait_until(cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(1);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// What to do on a given call of a lease operation.
#[derive(Debug, Clone, Copy)]
enum Step {
    Lag(Duration),
    Fail,
}

/// In-memory backend that delays or fails chosen lease calls, numbered from 1
/// in the order they reach the backend.
struct SteppedBackend {
    inner: InMemoryBackend,
    acquire_calls: AtomicU32,
    release_calls: AtomicU32,
    acquire_steps: HashMap<u32, Step>,
    release_steps: HashMap<u32, Step>,
}

impl SteppedBackend {
    fn new() -> Self {
        Self {
            inner: InMemoryBackend::new(),
            acquire_calls: AtomicU32::new(0),
            release_calls: AtomicU32::new(0),
            acquire_steps: HashMap::new(),
            release_steps: HashMap::new(),
        }
    }

    fn on_acquire(mut self, call: u32, step: Step) -> Self {
        self.acquire_steps.insert(call, step);
        self
    }

    fn on_release(mut self, call: u32, step: Step) -> Self {
        self.release_steps.insert(call, step);
        self
    }
}

async fn apply_step(step: Option<&Step>, operation: &str) -> BackendResult<()> {
    match step {
        Some(Step::Lag(wait)) => {
            tokio::time::sleep(*wait).await;
            Ok(())
        }
        Some(Step::Fail) => Err(BackendError::unavailable(operation, "injected failure")),
        None => Ok(()),
    }
}

#[async_trait]
impl KvBackend for SteppedBackend {
    async fn set(
        &self,
        key: &str,
        value: String,
        expiration: Option<Duration>,
    ) -> BackendResult<()> {
        self.inner.set(key, value, expiration).await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        expiration: Duration,
    ) -> BackendResult<bool> {
        let call = self.acquire_calls.fetch_add(1, Ordering::SeqCst) + 1;
        apply_step(self.acquire_steps.get(&call), "SET NX").await?;
        self.inner.set_if_absent(key, value, expiration).await
    }

    async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        self.inner.get(key).await
    }

    async fn get_many(&self, keys: &[String]) -> BackendResult<Vec<Option<String>>> {
        self.inner.get_many(keys).await
    }

    async fn delete(&self, keys: &[String]) -> BackendResult<u64> {
        self.inner.delete(keys).await
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> BackendResult<bool> {
        let call = self.release_calls.fetch_add(1, Ordering::SeqCst) + 1;
        apply_step(self.release_steps.get(&call), "DEL IF EQ").await?;
        self.inner.delete_if_equals(key, expected).await
    }

    async fn expire(&self, key: &str, expiration: Duration) -> BackendResult<bool> {
        self.inner.expire(key, expiration).await
    }

    async fn ttl(&self, key: &str) -> BackendResult<KeyTtl> {
        self.inner.ttl(key).await
    }

    async fn exists(&self, key: &str) -> BackendResult<bool> {
        self.inner.exists(key).await
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> BackendResult<(u64, Vec<String>)> {
        self.inner.scan(cursor, pattern, count).await
    }

    async fn set_add(&self, key: &str, member: &str) -> BackendResult<()> {
        self.inner.set_add(key, member).await
    }

    async fn set_contains(&self, key: &str, member: &str) -> BackendResult<bool> {
        self.inner.set_contains(key, member).await
    }

    async fn set_members(&self, key: &str) -> BackendResult<HashSet<String>> {
        self.inner.set_members(key).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> BackendResult<()> {
        self.inner.set_remove(key, member).await
    }
}

/// Start a refresh with a 60ms fill, send one forced request while it fills,
/// and wait for both tasks. Acquire call 1 is the running pass, 2 and 3 are
/// the forced request's attempts, 4 is the running pass's re-acquire.
async fn forced_request_during_handoff(
    backend: SteppedBackend,
) -> (ScriptedFill, RefreshCache<SteppedBackend>) {
    let config = fixtures::multi_server_config(Duration::from_secs(5));
    let cache = RefreshCache::new(Arc::new(backend), "handoff", config).unwrap();
    let script = ScriptedFill::new().with_delay(Duration::from_millis(60));
    cache.register_callbacks(script.callbacks());

    let running = cache.request_refresh(false);
    wait_until(|| script.calls() == 1).await;
    let forced = cache.request_refresh(true);

    running.await.unwrap();
    forced.await.unwrap();
    (script, cache)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_forced_request_won_back_by_its_own_retry_still_runs() {
    init_tracing();
    // The forced retry lands after the running pass released and took the
    // request on; the running pass's re-acquire then loses to it.
    let backend = SteppedBackend::new()
        .on_acquire(3, Step::Lag(Duration::from_millis(90)))
        .on_acquire(4, Step::Lag(Duration::from_millis(60)))
        .on_release(2, Step::Lag(Duration::from_millis(50)));

    let (script, cache) = forced_request_during_handoff(backend).await;

    assert_eq!(script.calls(), 2);
    assert_eq!(script.max_concurrent(), 1);
    assert!(cache.is_valid().await);
    assert_eq!(cache.refresh_state(), RefreshState::Idle);
    assert!(!cache.backend().exists("handoff:SYS:MUTEX_LOCK").await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_forced_request_taken_over_by_running_pass_runs_once() {
    init_tracing();
    // The running pass re-acquires first; the forced retry finds it held.
    let backend = SteppedBackend::new().on_acquire(3, Step::Lag(Duration::from_millis(90)));

    let (script, cache) = forced_request_during_handoff(backend).await;

    assert_eq!(script.calls(), 2);
    assert_eq!(script.max_concurrent(), 1);
    assert!(cache.is_valid().await);
    assert_eq!(cache.refresh_state(), RefreshState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_forced_reacquire_backend_failure_returns_to_idle() {
    init_tracing();
    let backend = SteppedBackend::new()
        .on_acquire(3, Step::Fail)
        .on_acquire(4, Step::Fail);

    let (script, cache) = forced_request_during_handoff(backend).await;

    assert_eq!(script.calls(), 1);
    assert!(cache.is_valid().await);
    assert_eq!(cache.refresh_state(), RefreshState::Idle);

    // The lease was released, so the next request runs normally.
    cache.request_refresh(false).await.unwrap();
    assert_eq!(script.calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_run_one_refresh_at_a_time() {
    init_tracing();
    let (_, cache) = fixtures::memory_cache("single_flight", fixtures::fast_config());
    let script = ScriptedFill::new().with_delay(Duration::from_millis(20));
    cache.register_callbacks(script.callbacks());

    let handles: Vec<_> = (0..16).map(|i| cache.request_refresh(i % 2 == 0)).collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(script.max_concurrent(), 1);
    assert!(script.calls() >= 1);
    assert!(cache.is_valid().await);
    assert_eq!(cache.refresh_state(), RefreshState::Idle);
}

#[tokio::test]
async fn test_successful_refresh_marks_valid_and_stores_data() {
    init_tracing();
    let (backend, cache) = fixtures::memory_cache("products", fixtures::fast_config());
    let key = cache.keyspace().key_for_all();
    let script = ScriptedFill::new().with_entries(vec![(key.clone(), serde_json::json!(["a", "b"]))]);
    cache.register_callbacks(script.callbacks());
    assert!(!cache.is_valid().await);

    cache.request_refresh(false).await.unwrap();

    assert!(cache.is_valid().await);
    let values: Vec<String> = cache.read(&key).await.unwrap();
    assert_eq!(values, vec!["a", "b"]);
    assert_eq!(backend.live_keys(), vec![key]);

    let report = cache.last_refresh().unwrap();
    assert!(report.succeeded);
    assert_eq!(report.attempts, 1);
}

#[tokio::test]
async fn test_retry_backs_off_then_succeeds() {
    init_tracing();
    let config =
        CacheConfig::new().with_retry(RetryPolicy::new(3, Duration::from_millis(10), 2));
    let (_, cache) = fixtures::memory_cache("retrying", config);
    let script = ScriptedFill::new().failing(2);
    cache.register_callbacks(script.callbacks());

    let started = Instant::now();
    cache.request_refresh(false).await.unwrap();
    let elapsed = started.elapsed();

    // 10 * 2^0 + 10 * 2^1
    assert!(elapsed >= Duration::from_millis(30), "elapsed {:?}", elapsed);
    assert_eq!(script.calls(), 3);
    assert!(cache.is_valid().await);

    let report = cache.last_refresh().unwrap();
    assert!(report.succeeded);
    assert_eq!(report.attempts, 3);
}

#[tokio::test]
async fn test_exhausted_retries_end_invalid() {
    init_tracing();
    let (_, cache) = fixtures::memory_cache("failing", fixtures::fast_config());
    cache.set_valid().await.unwrap();
    let script = ScriptedFill::new().failing(10);
    cache.register_callbacks(script.callbacks());

    cache.request_refresh(false).await.unwrap();

    assert_eq!(script.calls(), 3);
    assert!(!cache.is_valid().await);
    let err = cache
        .read::<u32>(&cache.keyspace().key_for_all())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CacheInvalid);
    assert!(!cache.last_refresh().unwrap().succeeded);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_overlapping_forced_requests_coalesce_into_one_pass() {
    init_tracing();
    let (_, cache) = fixtures::memory_cache("coalesce", fixtures::fast_config());
    let script = ScriptedFill::new().with_delay(Duration::from_millis(50));
    cache.register_callbacks(script.callbacks());

    let running = cache.request_refresh(false);
    wait_until(|| script.calls() == 1).await;

    cache.request_refresh(true).await.unwrap();
    cache.request_refresh(true).await.unwrap();
    running.await.unwrap();

    assert_eq!(script.calls(), 2);
    assert!(cache.is_valid().await);
    assert_eq!(cache.refresh_state(), RefreshState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unforced_request_during_refresh_is_dropped() {
    init_tracing();
    let (_, cache) = fixtures::memory_cache("dropped", fixtures::fast_config());
    let script = ScriptedFill::new().with_delay(Duration::from_millis(40));
    cache.register_callbacks(script.callbacks());

    let running = cache.request_refresh(false);
    wait_until(|| script.calls() == 1).await;
    assert_eq!(
        cache.refresh_state(),
        RefreshState::Running(RefreshStage::Fill)
    );

    cache.request_refresh(false).await.unwrap();
    running.await.unwrap();

    assert_eq!(script.calls(), 1);
}

#[tokio::test]
async fn test_purge_keeps_system_keys_and_other_scopes() {
    init_tracing();
    let (backend, cache) = fixtures::memory_cache("products", fixtures::fast_config());
    for key in [
        "products:ALL",
        "products:ONE:abc",
        "products:PAGE:25|0|asc|name",
        "products:SYS:custom",
        "productsX:ALL",
        "orders:ALL",
    ] {
        backend.set(key, "1".to_string(), None).await.unwrap();
    }

    cache.request_refresh(false).await.unwrap();

    assert_eq!(
        backend.live_keys(),
        vec!["orders:ALL", "products:SYS:custom", "productsX:ALL"]
    );
}

#[tokio::test]
async fn test_purge_walks_many_scan_batches() {
    init_tracing();
    let config = fixtures::fast_config().with_scan_batch_size(7);
    let (backend, cache) = fixtures::memory_cache("bulk", config);
    for i in 0..100 {
        backend
            .set(&format!("bulk:ONE:{}", i), "1".to_string(), None)
            .await
            .unwrap();
    }

    cache.request_refresh(false).await.unwrap();
    assert!(backend.is_empty());
}

#[tokio::test]
async fn test_purge_failure_is_retried() {
    init_tracing();
    let (backend, cache) = fixtures::memory_cache("flaky", fixtures::fast_config());
    let script = ScriptedFill::new();
    cache.register_callbacks(script.callbacks());
    backend.set_unavailable(true);

    cache.request_refresh(false).await.unwrap();

    // Single-instance validity is local, so only the purge hit the backend.
    assert_eq!(script.calls(), 0);
    assert!(!cache.is_valid().await);

    backend.set_unavailable(false);
    cache.request_refresh(false).await.unwrap();
    assert_eq!(script.calls(), 1);
    assert!(cache.is_valid().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_multi_server_caches_share_lease_and_validity() {
    init_tracing();
    let backend = Arc::new(InMemoryBackend::new());
    let config = fixtures::multi_server_config(Duration::from_secs(5));
    let a = RefreshCache::new(backend.clone(), "shared", config.clone()).unwrap();
    let b = RefreshCache::new(backend.clone(), "shared", config).unwrap();

    let script_a = ScriptedFill::new()
        .with_delay(Duration::from_millis(40))
        .with_entries(vec![("shared:ALL".to_string(), serde_json::json!(7))]);
    let script_b = ScriptedFill::new();
    a.register_callbacks(script_a.callbacks());
    b.register_callbacks(script_b.callbacks());

    let running = a.request_refresh(false);
    wait_until(|| script_a.calls() == 1).await;
    assert!(!b.is_valid().await);

    // B sees A's lease in the shared backend and stands down.
    b.request_refresh(false).await.unwrap();
    running.await.unwrap();

    assert_eq!(script_b.calls(), 0);
    assert!(b.is_valid().await);
    assert_eq!(b.read::<u32>("shared:ALL").await.unwrap(), 7);
    assert!(!backend.exists("shared:SYS:MUTEX_LOCK").await.unwrap());

    b.set_invalid().await.unwrap();
    assert!(!a.is_valid().await);
}

#[tokio::test]
async fn test_multi_server_without_lease_never_starts() {
    init_tracing();
    let config = fixtures::fast_config().with_mode(CacheMode::MultiServer);
    let (backend, cache) = fixtures::memory_cache("unleased", config);
    let script = ScriptedFill::new();
    cache.register_callbacks(script.callbacks());

    cache.request_refresh(true).await.unwrap();

    assert_eq!(script.calls(), 0);
    assert!(!cache.is_valid().await);
    assert!(backend.is_empty());
    assert_eq!(cache.refresh_state(), RefreshState::Idle);
}

#[tokio::test]
async fn test_unreleased_lease_expires() {
    init_tracing();
    let backend = Arc::new(InMemoryBackend::new());
    let keyspace = keyward_storage::Keyspace::new("leased").unwrap();
    let config = CacheConfig::new().multi_server(Duration::from_millis(50));
    let first = RebuildMutex::for_mode(backend.clone(), &keyspace, &config);
    let second = RebuildMutex::for_mode(backend.clone(), &keyspace, &config);

    let _abandoned = first.try_acquire().await.unwrap();
    let busy = second.try_acquire().await.unwrap_err();
    assert_eq!(busy.kind(), ErrorKind::MutexUnavailable);

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(second.try_acquire().await.is_ok());
}
