//! Refresh orchestration.
//!
//! A refresh rebuilds one scope from its source of truth:
//!
//! 1. mark the cache invalid
//! 2. purge every key of the scope except its system keys
//! 3. run the init callback, if any
//! 4. run the fill callback
//! 5. mark the cache valid
//!
//! The whole sequence is retried as one unit with exponential backoff and
//! jitter. It runs on a spawned task while holding the rebuild mutex, so at
//! most one refresh per scope is active at a time. Requests that arrive while
//! a refresh is running are dropped, except forced ones, which coalesce into
//! a single follow-up pass.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use keyward_core::{CacheError, CacheResult, RefreshError, RefreshStage};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::{delete_matching, KvBackend};
use crate::cache::RefreshCache;
use crate::lease::RebuildLease;

// ============================================================================
// CALLBACKS
// ============================================================================

/// A refresh callback. Receives a handle to the cache being rebuilt.
pub type RefreshFn<B> =
    Arc<dyn Fn(RefreshCache<B>) -> BoxFuture<'static, CacheResult<()>> + Send + Sync>;

/// Init and fill callbacks for a scope.
///
/// Fill is expected; a refresh without one still runs and ends with an
/// empty, valid cache, and logs an error.
pub struct RefreshCallbacks<B: KvBackend> {
    init: Option<RefreshFn<B>>,
    fill: Option<RefreshFn<B>>,
}

impl<B: KvBackend> Clone for RefreshCallbacks<B> {
    fn clone(&self) -> Self {
        Self {
            init: self.init.clone(),
            fill: self.fill.clone(),
        }
    }
}

impl<B: KvBackend> Default for RefreshCallbacks<B> {
    fn default() -> Self {
        Self {
            init: None,
            fill: None,
        }
    }
}

impl<B: KvBackend> RefreshCallbacks<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the callback that runs after the purge and before the fill.
    pub fn on_init<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(RefreshCache<B>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CacheResult<()>> + Send + 'static,
    {
        self.init = Some(Arc::new(move |cache| f(cache).boxed()));
        self
    }

    /// Set the callback that repopulates the scope.
    pub fn on_fill<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(RefreshCache<B>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CacheResult<()>> + Send + 'static,
    {
        self.fill = Some(Arc::new(move |cache| f(cache).boxed()));
        self
    }

    pub fn has_fill(&self) -> bool {
        self.fill.is_some()
    }
}

// ============================================================================
// STATE
// ============================================================================

/// Where the refresh state machine currently is, as seen by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefreshState {
    Idle,
    Acquiring,
    Running(RefreshStage),
    Releasing,
}

impl RefreshState {
    pub fn is_idle(&self) -> bool {
        matches!(self, RefreshState::Idle)
    }
}

/// Outcome of the most recent refresh sequence run by this process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Attempts made, including the successful one.
    pub attempts: u32,
    pub succeeded: bool,
}

/// Per-scope refresh bookkeeping shared by every clone of a cache handle.
pub(crate) struct RefreshCoordinator {
    force_pending: AtomicBool,
    state: watch::Sender<RefreshState>,
    last_report: Mutex<Option<RefreshReport>>,
}

impl RefreshCoordinator {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(RefreshState::Idle);
        Self {
            force_pending: AtomicBool::new(false),
            state,
            last_report: Mutex::new(None),
        }
    }

    fn publish(&self, state: RefreshState) {
        self.state.send_replace(state);
    }

    /// Move from `from` to `to` only if nobody else moved the state since.
    /// Returns whether this call made the move.
    fn transition(&self, from: RefreshState, to: RefreshState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    fn record(&self, report: RefreshReport) {
        match self.last_report.lock() {
            Ok(mut slot) => *slot = Some(report),
            Err(poisoned) => *poisoned.into_inner() = Some(report),
        }
    }
}

// ============================================================================
// ORCHESTRATION
// ============================================================================

impl<B: KvBackend> RefreshCache<B> {
    /// Ask for the scope to be rebuilt.
    ///
    /// Returns at once; the refresh runs on a spawned task and its outcome is
    /// visible only through [`RefreshCache::is_valid`], the refresh state and
    /// the logs. If another refresh holds the rebuild mutex the request is
    /// dropped, unless `force_update` is set, in which case exactly one more
    /// pass runs after the current one however many forced requests arrive.
    ///
    /// The returned handle completes when this request's task is done,
    /// including any coalesced follow-up pass it ran. Must be called from
    /// within a Tokio runtime.
    pub fn request_refresh(&self, force_update: bool) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move { cache.handle_request(force_update).await })
    }

    /// Current refresh state.
    pub fn refresh_state(&self) -> RefreshState {
        *self.inner.coordinator.state.borrow()
    }

    /// Watch the refresh state machine.
    pub fn subscribe_refresh_state(&self) -> watch::Receiver<RefreshState> {
        self.inner.coordinator.state.subscribe()
    }

    /// Report of the last refresh sequence this process finished.
    pub fn last_refresh(&self) -> Option<RefreshReport> {
        match self.inner.coordinator.last_report.lock() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn handle_request(&self, force_update: bool) {
        let coordinator = &self.inner.coordinator;
        let marked = coordinator.transition(RefreshState::Idle, RefreshState::Acquiring);

        match self.inner.mutex.try_acquire().await {
            Ok(lease) => {
                // A force request parked by a run that just finished is
                // satisfied by this pass.
                coordinator.force_pending.store(false, Ordering::SeqCst);
                self.run_refresh_loop(lease).await;
            }
            Err(CacheError::Refresh(RefreshError::MutexUnavailable { .. })) => {
                if marked {
                    coordinator.transition(RefreshState::Acquiring, RefreshState::Idle);
                }
                if force_update {
                    coordinator.force_pending.store(true, Ordering::SeqCst);
                    info!(scope = %self.scope(), "Refresh already running, but force update requested");
                    self.retry_parked_force().await;
                } else {
                    info!(scope = %self.scope(), "Refresh already running, skipping new request");
                }
            }
            Err(e) => {
                if marked {
                    coordinator.transition(RefreshState::Acquiring, RefreshState::Idle);
                }
                error!(scope = %self.scope(), error = %e, "Refresh could not start");
            }
        }
    }

    /// The running pass may have checked the pending flag and released the
    /// mutex between our failed acquire and our store. Try once more so the
    /// parked request is not stranded.
    ///
    /// Winning the mutex here always runs a pass. Whoever else took the
    /// parked request on cannot hold the mutex now, so its own re-acquire
    /// fails and this pass is the only follow-up.
    async fn retry_parked_force(&self) {
        let coordinator = &self.inner.coordinator;
        match self.inner.mutex.try_acquire().await {
            Ok(lease) => {
                coordinator.force_pending.store(false, Ordering::SeqCst);
                info!(scope = %self.scope(), "Processing forced re-refresh request");
                self.run_refresh_loop(lease).await;
            }
            Err(CacheError::Refresh(RefreshError::MutexUnavailable { .. })) => {}
            Err(e) => {
                error!(scope = %self.scope(), error = %e, "Forced refresh could not start");
            }
        }
    }

    async fn run_refresh_loop(&self, mut lease: RebuildLease) {
        let coordinator = &self.inner.coordinator;
        loop {
            self.run_with_retry().await;

            coordinator.publish(RefreshState::Releasing);
            if let Err(e) = self.inner.mutex.release(lease).await {
                error!(scope = %self.scope(), error = %e, "Failed to release rebuild mutex");
            }

            if !coordinator.force_pending.swap(false, Ordering::SeqCst) {
                coordinator.transition(RefreshState::Releasing, RefreshState::Idle);
                return;
            }

            info!(scope = %self.scope(), "Processing forced re-refresh request");
            coordinator.transition(RefreshState::Releasing, RefreshState::Acquiring);
            match self.inner.mutex.try_acquire().await {
                Ok(next) => lease = next,
                Err(CacheError::Refresh(RefreshError::MutexUnavailable { .. })) => {
                    // Another holder took the mutex in between; its pass
                    // covers the forced request.
                    debug!(scope = %self.scope(), "Forced re-refresh taken over by another holder");
                    coordinator.transition(RefreshState::Acquiring, RefreshState::Idle);
                    return;
                }
                Err(e) => {
                    error!(scope = %self.scope(), error = %e, "Forced re-refresh could not start");
                    coordinator.transition(RefreshState::Acquiring, RefreshState::Idle);
                    return;
                }
            }
        }
    }

    /// Run the refresh sequence under the retry policy and record the outcome.
    async fn run_with_retry(&self) {
        let policy = &self.inner.config.retry;
        let started_at = Utc::now();
        let mut attempt = 0u32;

        let outcome = loop {
            match self.refresh_once().await {
                Ok(()) => break Ok(()),
                Err(e) => {
                    attempt += 1;
                    if attempt >= policy.attempts {
                        break Err(e);
                    }
                    let wait = policy.delay_for(attempt - 1, sample_jitter(policy.base_wait));
                    warn!(
                        scope = %self.scope(),
                        attempt = attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "Refresh attempt failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        };

        let (attempts, succeeded) = match outcome {
            Ok(()) => {
                info!(scope = %self.scope(), attempts = attempt + 1, "Refresh succeeded");
                (attempt + 1, true)
            }
            Err(last) => {
                let err = RefreshError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(last),
                };
                error!(scope = %self.scope(), error = %err, "Refresh failed");
                (attempt, false)
            }
        };

        self.inner.coordinator.record(RefreshReport {
            started_at,
            finished_at: Utc::now(),
            attempts,
            succeeded,
        });
    }

    /// One pass of invalidate, purge, init, fill, validate.
    async fn refresh_once(&self) -> CacheResult<()> {
        let coordinator = &self.inner.coordinator;
        let callbacks = match self.inner.callbacks.read() {
            Ok(callbacks) => callbacks.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        coordinator.publish(RefreshState::Running(RefreshStage::Invalidate));
        self.set_invalid().await?;

        coordinator.publish(RefreshState::Running(RefreshStage::Purge));
        self.purge().await.inspect_err(|e| {
            warn!(scope = %self.scope(), error = %e, "Refresh purge failed");
        })?;

        if let Some(init) = callbacks.init {
            coordinator.publish(RefreshState::Running(RefreshStage::Init));
            init(self.clone()).await.inspect_err(|e| {
                warn!(scope = %self.scope(), error = %e, "Refresh init callback failed");
            })?;
        }

        coordinator.publish(RefreshState::Running(RefreshStage::Fill));
        match callbacks.fill {
            Some(fill) => fill(self.clone()).await.inspect_err(|e| {
                warn!(scope = %self.scope(), error = %e, "Refresh fill callback failed");
            })?,
            None => error!(scope = %self.scope(), "Refresh called with no fill callback registered"),
        }

        coordinator.publish(RefreshState::Running(RefreshStage::Validate));
        self.set_valid().await
    }

    /// Delete every key of the scope except its system keys.
    async fn purge(&self) -> CacheResult<u64> {
        let keyspace = &self.inner.keyspace;
        let removed = delete_matching(
            self.inner.backend.as_ref(),
            &keyspace.scan_pattern(),
            self.inner.config.scan_batch_size,
            |key| keyspace.is_system_key(key),
        )
        .await
        .map_err(|e| CacheError::backend(self.scope(), e))?;
        debug!(scope = %self.scope(), removed = removed, "Purged cache entries");
        Ok(removed)
    }
}

/// Uniform jitter in `[0, base)`.
fn sample_jitter(base: Duration) -> Duration {
    let nanos = base.as_nanos().min(u64::MAX as u128) as u64;
    if nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rand::rng().random_range(0..nanos))
}

// =============================================================================
// TESTS
// =============================================================================
