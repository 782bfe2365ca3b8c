//! Retrying writes that lost an optimistic concurrency race.
//!
//! A `ConcurrentWriteDetected` error means another writer got there first.
//! The usual answer is to reload the producer, recompute its events and try
//! again, which is what [`retry`] does with an operation closure.

use crate::config::RetryConfig;
use crate::errors::{EventStoreError, ReplayError, SubscriptionError, UnitOfWorkError};
use std::time::Duration;
use tracing::{debug, warn};

/// Policy defining which errors should trigger a retry.
#[derive(Debug, Clone, Copy, Default)]
pub enum RetryPolicy {
    /// Only retry on concurrency conflicts.
    #[default]
    ConflictsOnly,
    /// Also retry when an envelope was already stored.
    ConflictsAndDuplicates,
    /// Custom policy with user-defined predicate.
    Custom(fn(&EventStoreError) -> bool),
}

impl RetryPolicy {
    /// Determines if an error should trigger a retry.
    pub fn should_retry(&self, error: &EventStoreError) -> bool {
        match self {
            Self::ConflictsOnly => error.is_retryable(),
            Self::ConflictsAndDuplicates => error.is_retryable() || error.is_duplicate(),
            Self::Custom(predicate) => predicate(error),
        }
    }
}

/// Errors that may wrap an [`EventStoreError`].
pub trait StoreFailure: std::fmt::Display {
    /// The wrapped store error, if any.
    fn store_error(&self) -> Option<&EventStoreError>;
}

impl StoreFailure for EventStoreError {
    fn store_error(&self) -> Option<&EventStoreError> {
        Some(self)
    }
}

impl StoreFailure for UnitOfWorkError {
    fn store_error(&self) -> Option<&EventStoreError> {
        match self {
            Self::EventStore(e) => Some(e),
            Self::ObjectNotSupported(_) => None,
        }
    }
}

impl StoreFailure for SubscriptionError {
    fn store_error(&self) -> Option<&EventStoreError> {
        match self {
            Self::EventStore(e) => Some(e),
            _ => None,
        }
    }
}

impl StoreFailure for ReplayError {
    fn store_error(&self) -> Option<&EventStoreError> {
        match self {
            Self::EventStore(e) => Some(e),
            Self::Dispatch(_) => None,
        }
    }
}

/// Runs `operation` until it succeeds, fails with an error the policy does
/// not retry, or runs out of attempts. The closure receives the zero-based
/// attempt number.
///
/// # Errors
///
/// Returns the last error produced by `operation`.
pub fn retry<T, E, F>(config: &RetryConfig, policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    E: StoreFailure,
    F: FnMut(u32) -> Result<T, E>,
{
    let max_attempts = config.max_attempts.into_inner();
    let mut attempt = 0;
    loop {
        match operation(attempt) {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempt, "[retry] succeeded after retrying");
                }
                return Ok(value);
            }
            Err(e) => {
                let retryable = e.store_error().is_some_and(|inner| policy.should_retry(inner));
                if !retryable || attempt + 1 >= max_attempts {
                    if retryable {
                        warn!(attempts = attempt + 1, error = %e, "[retry] giving up");
                    }
                    return Err(e);
                }
                let delay = backoff_delay(config, attempt);
                warn!(attempt, delay_ms = delay.as_millis(), error = %e, "[retry] retrying");
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                attempt += 1;
            }
        }
    }
}

/// Calculates the delay before retry number `attempt` (0-based).
///
/// Exponential backoff with ±25% jitter, capped at the configured maximum.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    use rand::Rng;

    #[allow(clippy::cast_precision_loss)]
    let base_ms = config.base_delay.into_inner() as f64;
    #[allow(clippy::cast_precision_loss)]
    let max_ms = config.max_delay.into_inner() as f64;
    let multiplier = config.backoff_multiplier.into_inner();

    #[allow(clippy::cast_possible_wrap)]
    let delay = base_ms * multiplier.powi(attempt.min(64) as i32);
    let jitter = delay * 0.25 * rand::rng().random_range(-1.0..=1.0);

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let millis = (delay + jitter).clamp(0.0, max_ms) as u64;
    Duration::from_millis(millis)
}
