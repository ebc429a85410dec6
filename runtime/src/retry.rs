//! Retry with exponential backoff for store and dispatch I/O.
//!
//! Every call the engine makes to an [`EventLog`](sequent_core::EventLog),
//! [`CheckpointStore`](sequent_core::CheckpointStore) or
//! [`EventDispatcher`](sequent_core::EventDispatcher) goes through
//! [`retry_with_context`]. Components above it never loop on failures themselves.
//!
//! The retry runs as a plain loop: an unlimited budget under a long outage
//! does not grow the stack.
//!
//! # Example
//!
//! ```rust
//! use sequent_runtime::retry::{RetryPolicy, retry_with_context};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), String> {
//! let policy = RetryPolicy::builder()
//!     .max_retries(5)
//!     .initial_delay(Duration::from_millis(10))
//!     .build();
//!
//! let value = retry_with_context(
//!     "load_balance",
//!     &policy,
//!     || async { Ok::<_, String>(42) },
//!     |_err: &String| true,
//!     || "account-1".to_string(),
//! )
//! .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use crate::metrics::RetryMetrics;
use std::time::Duration;
use tokio::time::sleep;

/// How many times a failed operation may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryBudget {
    /// At most this many retries after the first attempt.
    Limited(usize),
    /// Retry until the operation succeeds.
    Unlimited,
}

impl RetryBudget {
    /// Whether another retry is allowed after `retries_done` retries.
    #[must_use]
    pub const fn allows(self, retries_done: usize) -> bool {
        match self {
            Self::Limited(max) => retries_done < max,
            Self::Unlimited => true,
        }
    }
}

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `budget`: `Limited(3)`
/// - `initial_delay`: 100ms
/// - `max_delay`: 30 seconds
/// - `multiplier`: 2.0 (delay doubles each retry)
/// - `jitter`: off
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retry budget
    pub budget: RetryBudget,
    /// Initial delay before first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries (cap for exponential backoff)
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Scale each delay by a random factor in `[0.5, 1.0]`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            budget: RetryBudget::Limited(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            budget: RetryBudget::Limited(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: false,
        }
    }

    /// Policy used by the mailbox drain path: never give up, back off up to one
    /// second between attempts.
    #[must_use]
    pub const fn unbounded() -> Self {
        Self {
            budget: RetryBudget::Unlimited,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: false,
        }
    }

    /// Calculate delay for a given attempt number.
    ///
    /// Uses exponential backoff: delay = initial_delay * (multiplier ^ attempt)
    /// Capped at `max_delay`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.min(i32::MAX as usize) as i32;
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        let final_ms = if self.jitter {
            use rand::Rng;
            capped_ms * rand::thread_rng().gen_range(0.5..=1.0)
        } else {
            capped_ms
        };

        Duration::from_millis(final_ms as u64)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    budget: RetryBudget,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
}

impl RetryPolicyBuilder {
    /// Set maximum number of retries.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: usize) -> Self {
        self.budget = RetryBudget::Limited(max_retries);
        self
    }

    /// Retry until success.
    #[must_use]
    pub const fn unlimited(mut self) -> Self {
        self.budget = RetryBudget::Unlimited;
        self
    }

    /// Set initial delay before first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enable random jitter on each delay.
    #[must_use]
    pub const fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub const fn build(self) -> RetryPolicy {
        RetryPolicy {
            budget: self.budget,
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }
}

/// Retry an async operation until it succeeds, a non-retryable error occurs,
/// or the policy's budget is exhausted.
///
/// # Arguments
///
/// * `action` - Stable name of the operation, used in logs and metrics
/// * `policy` - Backoff and budget
/// * `operation` - The fallible operation (called once per attempt)
/// * `is_retryable` - Whether an error may be retried; non-retryable errors
///   are returned immediately
/// * `context` - Describes what was being attempted; only evaluated when an
///   attempt fails
///
/// # Errors
///
/// Returns the first non-retryable error, or the last error once the budget is
/// exhausted.
pub async fn retry_with_context<F, Fut, T, E, P, C>(
    action: &'static str,
    policy: &RetryPolicy,
    mut operation: F,
    is_retryable: P,
    context: C,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
    C: Fn() -> String,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    RetryMetrics::record_success(action);
                    tracing::info!(action, attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) => {
                if !is_retryable(&err) {
                    tracing::debug!(
                        action,
                        context = %context(),
                        error = %err,
                        "Error is not retryable, failing immediately"
                    );
                    return Err(err);
                }

                if !policy.budget.allows(attempt) {
                    RetryMetrics::record_exhausted(action);
                    tracing::error!(
                        action,
                        attempt,
                        context = %context(),
                        error = %err,
                        "Operation failed after max retries"
                    );
                    return Err(err);
                }

                let delay = policy.delay_for_attempt(attempt);
                RetryMetrics::record_attempt(action);
                tracing::warn!(
                    action,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    context = %context(),
                    error = %err,
                    "Operation failed, retrying..."
                );

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
