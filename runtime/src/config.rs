//! Engine configuration.
//!
//! Built with `with_*` methods on top of [`Default`], or loaded from `SEQUENT_*`
//! environment variables with [`EngineConfig::from_env`]:
//!
//! | Variable | Field | Unit |
//! |----------|-------|------|
//! | `SEQUENT_PROCESSOR_NAME` | `processor_name` | string |
//! | `SEQUENT_MAILBOX_INACTIVE_TIMEOUT_MS` | `mailbox_inactive_timeout` | ms |
//! | `SEQUENT_SCAN_INACTIVE_INTERVAL_MS` | `scan_inactive_interval` | ms |
//! | `SEQUENT_REFRESH_INTERVAL_MS` | `refresh_interval` | ms |
//! | `SEQUENT_WORKER_POOL_SIZE` | `worker_pool_size` | count |
//! | `SEQUENT_COMMAND_BATCH_SIZE` | `command_batch_size` | count |
//! | `SEQUENT_LEASE_RETRY_DELAY_MS` | `lease_retry_delay` | ms |
//! | `SEQUENT_LEASE_WARN_THRESHOLD` | `lease_warn_threshold` | count |
//! | `SEQUENT_MAX_RETRIES` | `retry_policy` budget | count (unset = unlimited) |

use crate::retry::{RetryBudget, RetryPolicy};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("Invalid value for {name}: {value:?} ({reason})")]
    InvalidValue {
        /// Variable name.
        name: &'static str,
        /// Raw value.
        value: String,
        /// Parse failure.
        reason: String,
    },

    /// A setting is out of range.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Tunables for the [`Engine`](crate::Engine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Consumer name used as the checkpoint namespace.
    pub processor_name: String,
    /// Idle time after which an empty mailbox may be removed.
    pub mailbox_inactive_timeout: Duration,
    /// Period of the inactive-mailbox sweep.
    pub scan_inactive_interval: Duration,
    /// Period of the waiting-mailbox version refresh.
    pub refresh_interval: Duration,
    /// Maximum number of concurrently running drains.
    pub worker_pool_size: usize,
    /// Commands handled per drain run before the mailbox yields its worker.
    pub command_batch_size: usize,
    /// Sleep between lease attempts.
    pub lease_retry_delay: Duration,
    /// Lease attempts between starvation warnings.
    pub lease_warn_threshold: u64,
    /// Retry policy for store and dispatch I/O.
    pub retry_policy: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        Self {
            processor_name: "DefaultEventProcessor".to_string(),
            mailbox_inactive_timeout: Duration::from_secs(3 * 24 * 60 * 60),
            scan_inactive_interval: Duration::from_secs(5),
            refresh_interval: Duration::from_secs(1),
            worker_pool_size: (parallelism * 4).max(1),
            command_batch_size: 1000,
            lease_retry_delay: Duration::from_millis(1),
            lease_warn_threshold: 10_000,
            retry_policy: RetryPolicy::unbounded(),
        }
    }
}

impl EngineConfig {
    /// Set the processor (consumer) name.
    #[must_use]
    pub fn with_processor_name(mut self, name: impl Into<String>) -> Self {
        self.processor_name = name.into();
        self
    }

    /// Set the mailbox inactivity timeout.
    #[must_use]
    pub const fn with_mailbox_inactive_timeout(mut self, timeout: Duration) -> Self {
        self.mailbox_inactive_timeout = timeout;
        self
    }

    /// Set the inactive-mailbox sweep period.
    #[must_use]
    pub const fn with_scan_inactive_interval(mut self, interval: Duration) -> Self {
        self.scan_inactive_interval = interval;
        self
    }

    /// Set the version refresh period.
    #[must_use]
    pub const fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Set the worker pool size.
    #[must_use]
    pub const fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    /// Set the command batch size.
    #[must_use]
    pub const fn with_command_batch_size(mut self, size: usize) -> Self {
        self.command_batch_size = size;
        self
    }

    /// Set the sleep between lease attempts.
    #[must_use]
    pub const fn with_lease_retry_delay(mut self, delay: Duration) -> Self {
        self.lease_retry_delay = delay;
        self
    }

    /// Set the lease starvation warning threshold.
    #[must_use]
    pub const fn with_lease_warn_threshold(mut self, threshold: u64) -> Self {
        self.lease_warn_threshold = threshold;
        self
    }

    /// Set the I/O retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Load from `SEQUENT_*` environment variables, defaulting unset ones.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable is malformed or the result fails
    /// [`validate`](Self::validate).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(name) = lookup("SEQUENT_PROCESSOR_NAME") {
            config.processor_name = name;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "SEQUENT_MAILBOX_INACTIVE_TIMEOUT_MS")? {
            config.mailbox_inactive_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "SEQUENT_SCAN_INACTIVE_INTERVAL_MS")? {
            config.scan_inactive_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "SEQUENT_REFRESH_INTERVAL_MS")? {
            config.refresh_interval = Duration::from_millis(ms);
        }
        if let Some(size) = parse_var(&lookup, "SEQUENT_WORKER_POOL_SIZE")? {
            config.worker_pool_size = size;
        }
        if let Some(size) = parse_var(&lookup, "SEQUENT_COMMAND_BATCH_SIZE")? {
            config.command_batch_size = size;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "SEQUENT_LEASE_RETRY_DELAY_MS")? {
            config.lease_retry_delay = Duration::from_millis(ms);
        }
        if let Some(threshold) = parse_var(&lookup, "SEQUENT_LEASE_WARN_THRESHOLD")? {
            config.lease_warn_threshold = threshold;
        }
        if let Some(max) = parse_var(&lookup, "SEQUENT_MAX_RETRIES")? {
            config.retry_policy.budget = RetryBudget::Limited(max);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check that every setting is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an empty processor name, a zero
    /// pool or batch size, a zero interval, or a zero warn threshold.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.processor_name.trim().is_empty() {
            return Err(ConfigError::Invalid("processor_name must not be empty".to_string()));
        }
        if self.worker_pool_size == 0 {
            return Err(ConfigError::Invalid("worker_pool_size must be at least 1".to_string()));
        }
        if self.command_batch_size == 0 {
            return Err(ConfigError::Invalid("command_batch_size must be at least 1".to_string()));
        }
        if self.scan_inactive_interval.is_zero() {
            return Err(ConfigError::Invalid("scan_inactive_interval must be non-zero".to_string()));
        }
        if self.refresh_interval.is_zero() {
            return Err(ConfigError::Invalid("refresh_interval must be non-zero".to_string()));
        }
        if self.lease_warn_threshold == 0 {
            return Err(ConfigError::Invalid("lease_warn_threshold must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .map_err(|e| ConfigError::InvalidValue {
                    name,
                    value: value.clone(),
                    reason: e.to_string(),
                })
        })
        .transpose()
}
