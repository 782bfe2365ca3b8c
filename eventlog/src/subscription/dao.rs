//! Persistence port for subscription progress.

use super::{ListenerState, SubscriptionStatus};
use crate::errors::EventStoreResult;
use crate::types::{EventId, Id, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The persisted form of a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    /// Listener id
    pub id: Id,
    /// Version counter
    pub version: u64,
    /// Lifecycle status
    pub status: SubscriptionStatus,
    /// Pause flag
    pub paused: bool,
    /// Start anchor
    pub started_by: Option<EventId>,
    /// When the subscription started
    pub started_at: Option<Timestamp>,
    /// Last examined envelope
    pub last_processed: Option<EventId>,
    /// When the last envelope was examined
    pub last_processed_at: Option<Timestamp>,
    /// Listener-owned state blob
    pub state: Option<ListenerState>,
}

/// Storage for subscription records.
///
/// `save` is optimistic: it succeeds only if the stored record still has
/// `expected_version` (a missing record counts as version 0). Otherwise it
/// fails with `ConcurrentWriteDetected` and stores nothing.
pub trait SubscriptionDao: Send + Sync {
    /// Inserts or updates a record.
    fn save(&self, record: &SubscriptionRecord, expected_version: u64) -> EventStoreResult<()>;

    /// Loads one record.
    fn one(&self, id: &Id) -> EventStoreResult<Option<SubscriptionRecord>>;

    /// Loads every record, ordered by id.
    fn all(&self) -> EventStoreResult<Vec<SubscriptionRecord>>;

    /// Deletes a record. Returns whether it existed.
    fn delete(&self, id: &Id) -> EventStoreResult<bool>;

    /// Returns true if a record exists.
    fn exists(&self, id: &Id) -> EventStoreResult<bool> {
        Ok(self.one(id)?.is_some())
    }
}

impl<D: SubscriptionDao + ?Sized> SubscriptionDao for Arc<D> {
    fn save(&self, record: &SubscriptionRecord, expected_version: u64) -> EventStoreResult<()> {
        (**self).save(record, expected_version)
    }

    fn one(&self, id: &Id) -> EventStoreResult<Option<SubscriptionRecord>> {
        (**self).one(id)
    }

    fn all(&self) -> EventStoreResult<Vec<SubscriptionRecord>> {
        (**self).all()
    }

    fn delete(&self, id: &Id) -> EventStoreResult<bool> {
        (**self).delete(id)
    }

    fn exists(&self, id: &Id) -> EventStoreResult<bool> {
        (**self).exists(id)
    }
}
