//! Configuration types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{CacheResult, ConfigError};

// ============================================================================
// CACHE MODE
// ============================================================================

/// Where validity and rebuild-lock state lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CacheMode {
    /// Validity and lock are process-local. Only correct with one process per scope.
    #[default]
    SingleInstance,
    /// Validity and lock are presence flags in the shared backend.
    MultiServer,
}

impl CacheMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheMode::SingleInstance => "single",
            CacheMode::MultiServer => "multi",
        }
    }

    pub fn is_multi_server(&self) -> bool {
        matches!(self, CacheMode::MultiServer)
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheMode {
    type Err = CacheModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "single" | "single_instance" | "singleinstance" => Ok(CacheMode::SingleInstance),
            "multi" | "multi_server" | "multiserver" => Ok(CacheMode::MultiServer),
            _ => Err(CacheModeParseError(s.to_string())),
        }
    }
}

/// Error when parsing an invalid cache mode string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheModeParseError(pub String);

impl fmt::Display for CacheModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid cache mode: {}", self.0)
    }
}

impl std::error::Error for CacheModeParseError {}

// ============================================================================
// RETRY POLICY
// ============================================================================

/// Bounded retry with exponential backoff and additive jitter.
///
/// The wait after failed attempt `i` (0-based) is
/// `base_wait * exponent^i + jitter`, with jitter drawn from `[0, base_wait)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_wait: Duration,
    pub exponent: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_wait: Duration::from_millis(100),
            exponent: 2,
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_wait: Duration, exponent: u32) -> Self {
        Self {
            attempts,
            base_wait,
            exponent,
        }
    }

    /// Deterministic part of the wait after failed attempt `attempt`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = self.exponent.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_wait.saturating_mul(factor)
    }

    /// Full wait after failed attempt `attempt`, given a sampled jitter.
    pub fn delay_for(&self, attempt: u32, jitter: Duration) -> Duration {
        self.backoff_for(attempt).saturating_add(jitter)
    }

    /// Minimum total time spent waiting across `failures` consecutive failures.
    pub fn minimum_total_wait(&self, failures: u32) -> Duration {
        (0..failures).fold(Duration::ZERO, |acc, i| {
            acc.saturating_add(self.backoff_for(i))
        })
    }
}

// ============================================================================
// CACHE CONFIG
// ============================================================================

/// Configuration for one cache scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Retry policy for the whole refresh sequence.
    pub retry: RetryPolicy,
    /// Expiration applied by `*_with_expiration` calls that pass none.
    pub default_expiration: Option<Duration>,
    pub mode: CacheMode,
    /// Rebuild lease lifetime. Required in multi-server mode.
    pub lease_duration: Option<Duration>,
    /// COUNT hint for each SCAN round-trip during a purge.
    pub scan_batch_size: usize,
    /// System key name of the validity flag.
    pub validity_flag_name: String,
    /// System key name of the rebuild lease.
    pub lease_flag_name: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            default_expiration: None,
            mode: CacheMode::SingleInstance,
            lease_duration: None,
            scan_batch_size: 50,
            validity_flag_name: "CACHE_VALID".to_string(),
            lease_flag_name: "MUTEX_LOCK".to_string(),
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the default expiration.
    pub fn with_default_expiration(mut self, expiration: Duration) -> Self {
        self.default_expiration = Some(expiration);
        self
    }

    /// Set the coordination mode.
    pub fn with_mode(mut self, mode: CacheMode) -> Self {
        self.mode = mode;
        self
    }

    /// Switch to multi-server mode with the given lease duration.
    pub fn multi_server(mut self, lease_duration: Duration) -> Self {
        self.mode = CacheMode::MultiServer;
        self.lease_duration = Some(lease_duration);
        self
    }

    /// Set the lease duration.
    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = Some(lease_duration);
        self
    }

    /// Set the purge SCAN batch size.
    pub fn with_scan_batch_size(mut self, size: usize) -> Self {
        self.scan_batch_size = size;
        self
    }

    /// Rename the system flags, e.g. to share a scope with a legacy deployment.
    pub fn with_flag_names(
        mut self,
        validity_flag_name: impl Into<String>,
        lease_flag_name: impl Into<String>,
    ) -> Self {
        self.validity_flag_name = validity_flag_name.into();
        self.lease_flag_name = lease_flag_name.into();
        self
    }

    /// Create a CacheConfig from environment variables.
    ///
    /// Environment variables:
    /// - `KEYWARD_REFRESH_RETRY_ATTEMPTS`: attempts per refresh (default: 3)
    /// - `KEYWARD_REFRESH_RETRY_WAIT_MS`: base backoff in ms (default: 100)
    /// - `KEYWARD_REFRESH_RETRY_EXPONENT`: backoff growth factor (default: 2)
    /// - `KEYWARD_DEFAULT_EXPIRATION_SECS`: default entry expiration (default: none)
    /// - `KEYWARD_MODE`: "single" or "multi" (default: single)
    /// - `KEYWARD_LEASE_DURATION_MS`: rebuild lease lifetime (default: none)
    /// - `KEYWARD_SCAN_BATCH_SIZE`: purge SCAN COUNT (default: 50)
    ///
    /// Unset or unparseable values fall back to the defaults; call
    /// [`CacheConfig::validate`] on the result.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let attempts = env_parse("KEYWARD_REFRESH_RETRY_ATTEMPTS").unwrap_or(defaults.retry.attempts);

        let base_wait = env_parse("KEYWARD_REFRESH_RETRY_WAIT_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry.base_wait);

        let exponent = env_parse("KEYWARD_REFRESH_RETRY_EXPONENT").unwrap_or(defaults.retry.exponent);

        let default_expiration =
            env_parse("KEYWARD_DEFAULT_EXPIRATION_SECS").map(Duration::from_secs);

        let mode = std::env::var("KEYWARD_MODE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.mode);

        let lease_duration = env_parse("KEYWARD_LEASE_DURATION_MS").map(Duration::from_millis);

        let scan_batch_size =
            env_parse("KEYWARD_SCAN_BATCH_SIZE").unwrap_or(defaults.scan_batch_size);

        Self {
            retry: RetryPolicy::new(attempts, base_wait, exponent),
            default_expiration,
            mode,
            lease_duration,
            scan_batch_size,
            ..defaults
        }
    }

    /// Validate the configuration.
    ///
    /// A missing lease duration is not rejected here: multi-server lease
    /// acquisition reports it as missing configuration when it is attempted.
    pub fn validate(&self) -> CacheResult<()> {
        if self.retry.attempts == 0 {
            return Err(invalid("retry.attempts", self.retry.attempts, "must be at least 1"));
        }
        if self.retry.base_wait.is_zero() {
            return Err(invalid(
                "retry.base_wait",
                format!("{:?}", self.retry.base_wait),
                "must be positive",
            ));
        }
        if self.retry.exponent == 0 {
            return Err(invalid("retry.exponent", self.retry.exponent, "must be at least 1"));
        }
        if self.scan_batch_size == 0 {
            return Err(invalid("scan_batch_size", self.scan_batch_size, "must be positive"));
        }
        if let Some(lease) = self.lease_duration {
            if lease.is_zero() {
                return Err(invalid("lease_duration", format!("{:?}", lease), "must be positive"));
            }
        }
        if let Some(expiration) = self.default_expiration {
            if expiration.is_zero() {
                return Err(invalid(
                    "default_expiration",
                    format!("{:?}", expiration),
                    "must be positive",
                ));
            }
        }
        if self.validity_flag_name.is_empty() || self.lease_flag_name.is_empty() {
            return Err(invalid("flag names", "", "must not be empty"));
        }
        if self.validity_flag_name == self.lease_flag_name {
            return Err(invalid(
                "flag names",
                &self.lease_flag_name,
                "validity flag and lease flag must differ",
            ));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn invalid(field: &str, value: impl fmt::Display, reason: &str) -> crate::error::CacheError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CacheConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let zero_attempts =
            CacheConfig::new().with_retry(RetryPolicy::new(0, Duration::from_millis(10), 2));
        assert!(zero_attempts.validate().is_err());

        let zero_wait = CacheConfig::new().with_retry(RetryPolicy::new(3, Duration::ZERO, 2));
        assert!(zero_wait.validate().is_err());

        let zero_exponent =
            CacheConfig::new().with_retry(RetryPolicy::new(3, Duration::from_millis(10), 0));
        assert!(zero_exponent.validate().is_err());

        let zero_batch = CacheConfig::new().with_scan_batch_size(0);
        assert!(zero_batch.validate().is_err());

        let zero_lease = CacheConfig::new().multi_server(Duration::ZERO);
        assert!(zero_lease.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_shared_flag_names() {
        let config = CacheConfig::new().with_flag_names("SAME", "SAME");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_multi_server_without_lease_passes_validation() {
        let config = CacheConfig::new().with_mode(CacheMode::MultiServer);
        assert!(config.validate().is_ok());
        assert!(config.lease_duration.is_none());
    }

    #[test]
    fn test_backoff_grows_exponentially() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10), 2);
        assert_eq!(policy.backoff_for(0), Duration::from_millis(10));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(20));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(40));
        assert_eq!(
            policy.delay_for(1, Duration::from_millis(3)),
            Duration::from_millis(23)
        );
        assert_eq!(policy.minimum_total_wait(2), Duration::from_millis(30));
    }

    #[test]
    fn test_backoff_saturates() {
        let policy = RetryPolicy::new(100, Duration::from_secs(1), 10);
        assert!(policy.backoff_for(64) >= policy.backoff_for(9));
    }

    #[test]
    fn test_cache_mode_parse() {
        assert_eq!("single".parse::<CacheMode>(), Ok(CacheMode::SingleInstance));
        assert_eq!("MULTI".parse::<CacheMode>(), Ok(CacheMode::MultiServer));
        assert_eq!("multi_server".parse::<CacheMode>(), Ok(CacheMode::MultiServer));
        assert!("cluster".parse::<CacheMode>().is_err());
        assert_eq!(CacheMode::MultiServer.to_string(), "multi");
    }

    #[test]
    fn test_from_env_reads_overrides() {
        std::env::set_var("KEYWARD_REFRESH_RETRY_ATTEMPTS", "5");
        std::env::set_var("KEYWARD_REFRESH_RETRY_WAIT_MS", "20");
        std::env::set_var("KEYWARD_MODE", "multi");
        std::env::set_var("KEYWARD_LEASE_DURATION_MS", "1500");
        std::env::set_var("KEYWARD_SCAN_BATCH_SIZE", "not-a-number");

        let config = CacheConfig::from_env();

        std::env::remove_var("KEYWARD_REFRESH_RETRY_ATTEMPTS");
        std::env::remove_var("KEYWARD_REFRESH_RETRY_WAIT_MS");
        std::env::remove_var("KEYWARD_MODE");
        std::env::remove_var("KEYWARD_LEASE_DURATION_MS");
        std::env::remove_var("KEYWARD_SCAN_BATCH_SIZE");

        assert_eq!(config.retry.attempts, 5);
        assert_eq!(config.retry.base_wait, Duration::from_millis(20));
        assert_eq!(config.retry.exponent, 2);
        assert_eq!(config.mode, CacheMode::MultiServer);
        assert_eq!(config.lease_duration, Some(Duration::from_millis(1500)));
        assert_eq!(config.scan_batch_size, 50);
        assert!(config.validate().is_ok());
    }
}
