//! Testing utilities for code built on the event log.
//!
//! - [`FixedClock`]: a clock that only moves when told to
//! - [`RecordingBus`]: a bus that remembers what was published
//! - [`generators`]: `proptest` strategies for the domain types
//!
//! Available in this crate's tests and, with the `testing` feature, to
//! downstream crates.

pub mod generators;

use crate::clock::Clock;
use crate::envelope::Envelope;
use crate::store::Bus;
use crate::types::{EventId, Timestamp};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

/// A manually driven clock.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    /// A clock stopped at `at`.
    pub fn at(at: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(at) }
    }

    /// A clock stopped at the Unix epoch.
    pub fn epoch() -> Self {
        Self::at(DateTime::UNIX_EPOCH)
    }

    /// Moves the clock to `at`.
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }

    /// Moves the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Default for FixedClock {
    fn default() -> Self {
        Self::epoch()
    }
}

impl Clock for FixedClock {
    fn now(&self) -> Timestamp {
        Timestamp::new(*self.now.lock())
    }
}

/// A bus that records every publication.
#[derive(Debug, Default)]
pub struct RecordingBus {
    published: Mutex<Vec<Vec<Envelope>>>,
}

impl RecordingBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every published batch, in publication order.
    pub fn batches(&self) -> Vec<Vec<Envelope>> {
        self.published.lock().clone()
    }

    /// Ids of every published envelope, flattened.
    pub fn published_ids(&self) -> Vec<EventId> {
        self.published
            .lock()
            .iter()
            .flatten()
            .map(Envelope::id)
            .collect()
    }

    /// Forgets everything published so far.
    pub fn clear(&self) {
        self.published.lock().clear();
    }
}

impl Bus for RecordingBus {
    fn publish(&self, envelopes: &[Envelope]) {
        self.published.lock().push(envelopes.to_vec());
    }
}
