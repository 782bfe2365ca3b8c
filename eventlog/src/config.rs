//! Validated configuration types.
//!
//! Every knob is a `nutype` newtype so that a configuration that made it
//! past construction is valid. Defaults are safe for tests and small
//! deployments.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Number of envelopes a stream fetches from the store per round trip.
///
/// Validated to be between 1 and 10,000.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10_000),
    default = 100,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Default,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct PageSize(usize);

/// Number of yielded envelopes a transactional subscription commits at once.
///
/// Validated to be between 1 and 100,000.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100_000),
    default = 100,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Default,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct BatchSize(usize);

/// Maximum number of attempts made by [`retry`](crate::retry::retry).
///
/// Validated to be between 1 and 10 attempts to prevent endless retry loops.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct MaxRetryAttempts(u32);

/// Base delay between retry attempts in milliseconds.
#[nutype(
    validate(less_or_equal = 10_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct RetryBaseDelayMs(u64);

impl RetryBaseDelayMs {
    /// Converts to a `Duration`.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into())
    }
}

/// Upper bound on the delay between retry attempts in milliseconds.
#[nutype(
    validate(less_or_equal = 300_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct RetryMaxDelayMs(u64);

impl RetryMaxDelayMs {
    /// Converts to a `Duration`.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into())
    }
}

/// Exponential backoff multiplier for retry delays.
///
/// Validated to be between 1.0 and 3.0.
#[nutype(
    validate(finite, greater_or_equal = 1.0, less_or_equal = 3.0),
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Into, Serialize, Deserialize)
)]
pub struct BackoffMultiplier(f64);

/// Stream paging configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Envelopes fetched per page.
    pub page_size: PageSize,
}

impl StreamConfig {
    /// Sets the page size.
    #[must_use]
    pub const fn with_page_size(mut self, page_size: PageSize) -> Self {
        self.page_size = page_size;
        self
    }
}

/// Transactional subscription configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionalConfig {
    /// Yielded envelopes per committed transaction.
    pub batch_size: BatchSize,
}

impl TransactionalConfig {
    /// Sets the batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: BatchSize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// Retry behaviour for writes that lost an optimistic concurrency race.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: MaxRetryAttempts,
    /// Delay before the first retry.
    pub base_delay: RetryBaseDelayMs,
    /// Upper bound on any single delay.
    pub max_delay: RetryMaxDelayMs,
    /// Growth factor between consecutive delays.
    pub backoff_multiplier: BackoffMultiplier,
}

impl RetryConfig {
    /// Creates a retry configuration with safe defaults.
    ///
    /// # Errors
    ///
    /// Returns validation errors if any of the values are invalid
    /// (which should never happen with these constants).
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            max_attempts: MaxRetryAttempts::try_new(3)?,
            base_delay: RetryBaseDelayMs::try_new(50)?,
            max_delay: RetryMaxDelayMs::try_new(5_000)?,
            backoff_multiplier: BackoffMultiplier::try_new(2.0)?,
        })
    }

    /// A configuration that retries immediately, used by tests.
    pub fn immediate(max_attempts: MaxRetryAttempts) -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            max_attempts,
            base_delay: RetryBaseDelayMs::try_new(0)?,
            max_delay: RetryMaxDelayMs::try_new(0)?,
            backoff_multiplier: BackoffMultiplier::try_new(1.0)?,
        })
    }

    /// Sets the maximum number of attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: MaxRetryAttempts) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new().expect("Default retry configuration should always be valid")
    }
}
