//! Error types for the event log.
//!
//! Each subsystem has its own error enum so that callers can tell a retry
//! signal from a programming error at the type level:
//!
//! - **EventStoreError**: append and query failures. `ConcurrentWriteDetected`
//!   is a retry signal; `EventAlreadyInStore` usually marks a harmless
//!   duplicate append from an at-least-once producer.
//! - **DispatchError**: an event could not be routed to exactly one handler.
//!   Always a configuration error, never retried.
//! - **SubscriptionError**: a subscription was driven from the wrong state,
//!   or its listener failed.
//! - **UnitOfWorkError**: an object the unit of work cannot track, or a
//!   failed commit.
//! - **ConversionError**: payload serialization at a persistence boundary.
//!
//! # Example
//!
//! ```rust,ignore
//! match unit_of_work.commit() {
//!     Ok(committed) => info!(count = committed.len(), "committed"),
//!     Err(UnitOfWorkError::EventStore(EventStoreError::ConcurrentWriteDetected(producer))) => {
//!         // re-read the producer, recompute its events and try again
//!     }
//!     Err(e) => return Err(e.into()),
//! }
//! ```

use crate::types::{EventId, EventName, Id};
use thiserror::Error;

/// Error raised by a listener while handling an envelope.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur when appending to or reading from an event store.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// An envelope with this id is already stored, or appears twice in one batch.
    #[error("Event {0} is already in the store")]
    EventAlreadyInStore(EventId),

    /// Another writer already stored an event with the same producer version.
    #[error("Concurrent write detected for producer '{0}'")]
    ConcurrentWriteDetected(Id),

    /// `add` was called with no envelopes.
    #[error("Cannot append an empty batch of envelopes")]
    EmptyBatch,

    /// `begin` was called while a transaction was already open.
    #[error("A transaction is already in progress")]
    TransactionAlreadyStarted,

    /// `commit` or `rollback` was called without an open transaction.
    #[error("No transaction in progress")]
    NoActiveTransaction,

    /// An event payload could not be converted at the storage boundary.
    #[error("Conversion failed: {0}")]
    Conversion(#[from] ConversionError),

    /// Any other storage failure, passed through unchanged.
    #[error("Storage backend failure: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl EventStoreError {
    /// Wraps a storage-layer error that has no typed translation.
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend(Box::new(error))
    }

    /// Returns true for errors the caller should answer by re-reading state
    /// and retrying the write.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentWriteDetected(_))
    }

    /// Returns true when the append failed only because the envelope was
    /// already stored.
    pub const fn is_duplicate(&self) -> bool {
        matches!(self, Self::EventAlreadyInStore(_))
    }
}

/// Errors that can occur while resolving the handler for an event.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// The envelope belongs to a different producer than the consumer.
    #[error("Event {event} of producer '{producer}' cannot be applied to consumer '{consumer}'")]
    EventAndConsumerMismatch {
        /// The envelope that was rejected
        event: EventId,
        /// The producer recorded on the envelope
        producer: Id,
        /// The identity of the consumer
        consumer: Id,
    },

    /// No registered handler accepts the event.
    #[error("No event applying method found on {consumer} for event '{event}'")]
    NoEventApplyingMethodFound {
        /// The consumer type name
        consumer: &'static str,
        /// The event name
        event: EventName,
    },

    /// More than one registered handler accepts the event.
    #[error("Too many event applying methods found on {consumer} for event '{event}' ({candidates} candidates)")]
    TooManyEventApplyingMethodsFound {
        /// The consumer type name
        consumer: &'static str,
        /// The event name
        event: EventName,
        /// How many handlers matched
        candidates: usize,
    },
}

/// Errors that can occur while rebuilding an object from its history.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// An event could not be applied.
    #[error("Replay failed: {0}")]
    Dispatch(#[from] DispatchError),

    /// The history could not be read.
    #[error("Replay failed: {0}")]
    EventStore(#[from] EventStoreError),
}

/// Errors that can occur while driving a subscription.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// `subscribe_to` was called before `start_for`.
    #[error("Subscription '{0}' has not been started yet")]
    NotStartedYet(Id),

    /// `start_for` was called twice.
    #[error("Subscription '{0}' has already been started")]
    AlreadyStarted(Id),

    /// The listener reported completion; nothing more will be delivered.
    #[error("Subscription '{0}' has already been completed")]
    AlreadyCompleted(Id),

    /// The subscription is paused.
    #[error("Subscription '{0}' is paused")]
    Paused(Id),

    /// `restart` was called from a state that cannot restart.
    #[error("Subscription '{0}' cannot be restarted from its current state")]
    RestartNotPossible(Id),

    /// A persisted record was handed to a listener with another id.
    #[error("Subscription record '{record}' does not belong to listener '{listener}'")]
    RecordMismatch {
        /// Id stored in the record
        record: Id,
        /// Id of the listener
        listener: Id,
    },

    /// The requested limit was zero or negative.
    #[error("Subscription limit must be a positive number, got {0}")]
    InvalidLimit(i64),

    /// The listener failed while handling an envelope.
    #[error("Listener '{id}' failed: {source}")]
    Listener {
        /// The listener id
        id: Id,
        /// The listener's own error
        #[source]
        source: ListenerError,
    },

    /// The underlying store failed.
    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),
}

/// Errors that can occur in a unit of work.
#[derive(Debug, Error)]
pub enum UnitOfWorkError {
    /// The unit of work cannot track objects of this kind.
    #[error("Object of kind '{0}' is not supported by this unit of work")]
    ObjectNotSupported(&'static str),

    /// Flushing an object to the store failed.
    #[error("Commit failed: {0}")]
    EventStore(#[from] EventStoreError),
}

/// Errors that can occur while converting payloads to and from their
/// portable representation.
#[derive(Debug, Error)]
pub enum ConversionError {
    /// No event type is registered under this name.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// The Rust type of the payload was never registered.
    #[error("Event type {0} is not registered with the converter")]
    UnregisteredType(&'static str),

    /// The name is already registered for a different type.
    #[error("Event name '{0}' is already registered with a different type")]
    NameConflict(String),

    /// Serialization failed.
    #[error("Failed to serialize '{name}': {source}")]
    Serialization {
        /// What was being serialized
        name: String,
        /// The serde error
        #[source]
        source: serde_json::Error,
    },

    /// Deserialization failed.
    #[error("Failed to deserialize '{name}': {source}")]
    Deserialization {
        /// What was being deserialized
        name: String,
        /// The serde error
        #[source]
        source: serde_json::Error,
    },
}

/// Type alias for event store results.
pub type EventStoreResult<T> = Result<T, EventStoreError>;

/// Type alias for dispatch results.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Type alias for subscription results.
pub type SubscriptionResult<T> = Result<T, SubscriptionError>;

/// Type alias for unit of work results.
pub type UnitOfWorkResult<T> = Result<T, UnitOfWorkError>;
