//! The event store port.
//!
//! This module defines the [`EventStore`] trait that every backend
//! implements, the query types the [`Stream`] uses to page through a
//! backend, the [`Transactional`] capability, and the
//! [`PublishingEventStore`] decorator that fans committed envelopes out to a
//! [`Bus`].
//!
//! Backends guarantee two invariants on `add`:
//!
//! - envelope ids are unique across the whole log, and
//! - `(producer type, producer id, version)` is unique whenever the version
//!   is set.
//!
//! A batch that would break either invariant is rejected as a whole.

use crate::config::StreamConfig;
use crate::envelope::Envelope;
use crate::errors::{EventStoreError, EventStoreResult};
use crate::stream::Stream;
use crate::types::{EventId, EventName, Id, Sequence};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Selects envelopes by producer.
///
/// An empty filter selects everything. Otherwise an envelope is selected
/// when its producer id is in the id set OR its producer type starts with
/// one of the prefixes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    producer_ids: BTreeSet<Id>,
    type_prefixes: BTreeSet<String>,
}

impl EventFilter {
    /// A filter that selects every envelope.
    pub fn all() -> Self {
        Self::default()
    }

    /// A filter that selects the envelopes of one producer.
    pub fn producer(id: Id) -> Self {
        Self::default().with_producer(id)
    }

    /// A filter that selects every producer whose type starts with `prefix`.
    pub fn type_prefix(prefix: impl Into<String>) -> Self {
        Self::default().with_type_prefix(prefix)
    }

    /// Adds a producer id to the filter.
    #[must_use]
    pub fn with_producer(mut self, id: Id) -> Self {
        self.producer_ids.insert(id);
        self
    }

    /// Adds producer ids to the filter.
    #[must_use]
    pub fn with_producers(mut self, ids: impl IntoIterator<Item = Id>) -> Self {
        self.producer_ids.extend(ids);
        self
    }

    /// Adds a producer type prefix to the filter.
    #[must_use]
    pub fn with_type_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.type_prefixes.insert(prefix.into());
        self
    }

    /// The producer ids this filter selects.
    pub const fn producer_ids(&self) -> &BTreeSet<Id> {
        &self.producer_ids
    }

    /// The producer type prefixes this filter selects.
    pub const fn type_prefixes(&self) -> &BTreeSet<String> {
        &self.type_prefixes
    }

    /// Returns true if the filter selects everything.
    pub fn is_all(&self) -> bool {
        self.producer_ids.is_empty() && self.type_prefixes.is_empty()
    }

    /// Returns true if the filter selects `envelope`.
    pub fn matches(&self, envelope: &Envelope) -> bool {
        self.is_all()
            || self.producer_ids.contains(envelope.producer_id())
            || self
                .type_prefixes
                .iter()
                .any(|prefix| envelope.producer_type().has_prefix(prefix))
    }
}

/// Allow-list or deny-list of event names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum NameFilter {
    /// Every name passes.
    #[default]
    All,
    /// Only these names pass.
    Only(BTreeSet<EventName>),
    /// Every name except these passes.
    Without(BTreeSet<EventName>),
}

impl NameFilter {
    /// An allow-list. An empty list passes everything.
    pub fn only(names: impl IntoIterator<Item = EventName>) -> Self {
        let names: BTreeSet<_> = names.into_iter().collect();
        if names.is_empty() {
            Self::All
        } else {
            Self::Only(names)
        }
    }

    /// A deny-list. An empty list passes everything.
    pub fn without(names: impl IntoIterator<Item = EventName>) -> Self {
        let names: BTreeSet<_> = names.into_iter().collect();
        if names.is_empty() {
            Self::All
        } else {
            Self::Without(names)
        }
    }

    /// Returns true if `name` passes the filter.
    pub fn accepts(&self, name: &EventName) -> bool {
        match self {
            Self::All => true,
            Self::Only(names) => names.contains(name),
            Self::Without(names) => !names.contains(name),
        }
    }
}

/// Direction in which a query walks the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Order {
    /// Oldest first.
    #[default]
    Ascending,
    /// Newest first.
    Descending,
}

/// A single page request against a backend.
///
/// Bounds are resolved sequences: `after` is exclusive, `until` inclusive.
/// Streams translate envelope references into these before calling
/// [`EventStore::read`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamQuery {
    /// Producer selection
    pub filter: EventFilter,
    /// Exclusive lower bound
    pub after: Option<Sequence>,
    /// Inclusive upper bound
    pub until: Option<Sequence>,
    /// Name allow/deny list
    pub names: NameFilter,
    /// Read direction
    pub order: Order,
    /// Maximum number of envelopes to return
    pub limit: usize,
}

impl StreamQuery {
    /// A query for the first `limit` envelopes matching `filter`.
    pub fn new(filter: EventFilter, limit: usize) -> Self {
        Self {
            filter,
            after: None,
            until: None,
            names: NameFilter::All,
            order: Order::Ascending,
            limit,
        }
    }

    /// Returns true if a stored envelope falls inside this query.
    ///
    /// Backends that filter in memory use this directly; the others must
    /// agree with it.
    pub fn matches(&self, envelope: &Envelope) -> bool {
        let Some(sequence) = envelope.sequence() else {
            return false;
        };
        self.after.is_none_or(|after| sequence > after)
            && self.until.is_none_or(|until| sequence <= until)
            && self.names.accepts(envelope.name())
            && self.filter.matches(envelope)
    }
}

/// The append-only event log.
///
/// The trait is synchronous and object safe: subscriptions and units of work
/// hold a `&dyn EventStore`.
pub trait EventStore: Send + Sync {
    /// Appends a non-empty batch atomically.
    ///
    /// Returns the committed envelopes carrying their sequence and append
    /// time, in batch order. Fails with
    /// [`EventStoreError::EventAlreadyInStore`] or
    /// [`EventStoreError::ConcurrentWriteDetected`] without storing anything.
    fn add(&self, envelopes: Vec<Envelope>) -> EventStoreResult<Vec<Envelope>>;

    /// Looks up one envelope by id.
    fn event(&self, id: EventId) -> EventStoreResult<Option<Envelope>>;

    /// Reads one page of envelopes.
    fn read(&self, query: &StreamQuery) -> EventStoreResult<Vec<Envelope>>;

    /// Paging configuration for streams over this store.
    fn stream_config(&self) -> StreamConfig {
        StreamConfig::default()
    }

    /// Opens a stream over the envelopes selected by `filter`.
    ///
    /// Behind a `&dyn EventStore`, use [`Stream::new`] instead.
    fn stream(&self, filter: EventFilter) -> Stream<'_>
    where
        Self: Sized,
    {
        Stream::new(self, filter)
    }
}

impl<S: EventStore + ?Sized> EventStore for Arc<S> {
    fn add(&self, envelopes: Vec<Envelope>) -> EventStoreResult<Vec<Envelope>> {
        (**self).add(envelopes)
    }

    fn event(&self, id: EventId) -> EventStoreResult<Option<Envelope>> {
        (**self).event(id)
    }

    fn read(&self, query: &StreamQuery) -> EventStoreResult<Vec<Envelope>> {
        (**self).read(query)
    }

    fn stream_config(&self) -> StreamConfig {
        (**self).stream_config()
    }
}

/// A store whose writes can be grouped into one transaction.
///
/// Store appends and subscription record writes made between `begin` and
/// `commit` become visible together, or not at all after `rollback`.
pub trait Transactional: Send + Sync {
    /// Opens a transaction.
    fn begin(&self) -> EventStoreResult<()>;

    /// Makes every write since `begin` durable.
    fn commit(&self) -> EventStoreResult<()>;

    /// Discards every write since `begin`.
    fn rollback(&self) -> EventStoreResult<()>;

    /// Returns true between `begin` and `commit`/`rollback`.
    fn in_transaction(&self) -> bool;
}

impl<S: Transactional + ?Sized> Transactional for Arc<S> {
    fn begin(&self) -> EventStoreResult<()> {
        (**self).begin()
    }

    fn commit(&self) -> EventStoreResult<()> {
        (**self).commit()
    }

    fn rollback(&self) -> EventStoreResult<()> {
        (**self).rollback()
    }

    fn in_transaction(&self) -> bool {
        (**self).in_transaction()
    }
}

/// Receives envelopes after they are committed.
pub trait Bus: Send + Sync {
    /// Delivers committed envelopes, in commit order.
    fn publish(&self, envelopes: &[Envelope]);
}

/// Decorator that publishes every successful append to a [`Bus`].
///
/// Failed appends publish nothing. Inside a transaction opened through this
/// decorator, envelopes are held back until `commit` and dropped on
/// `rollback`, so the bus never sees rolled back events.
pub struct PublishingEventStore<S> {
    inner: S,
    bus: Arc<dyn Bus>,
    held: Mutex<Option<Vec<Envelope>>>,
}

impl<S> PublishingEventStore<S> {
    /// Wraps `inner`, publishing to `bus`.
    pub fn new(inner: S, bus: Arc<dyn Bus>) -> Self {
        Self {
            inner,
            bus,
            held: Mutex::new(None),
        }
    }

    /// The decorated store.
    pub const fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S> std::fmt::Debug for PublishingEventStore<S>
where
    S: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishingEventStore")
            .field("inner", &self.inner)
            .field("bus", &"<bus>")
            .finish_non_exhaustive()
    }
}

impl<S: EventStore> EventStore for PublishingEventStore<S> {
    #[instrument(name = "publisher.add", skip(self, envelopes), fields(count = envelopes.len()))]
    fn add(&self, envelopes: Vec<Envelope>) -> EventStoreResult<Vec<Envelope>> {
        let committed = self.inner.add(envelopes)?;

        let mut held = self.held.lock();
        if let Some(buffer) = held.as_mut() {
            debug!(count = committed.len(), "[publisher.add] holding envelopes until commit");
            buffer.extend(committed.iter().cloned());
        } else {
            drop(held);
            self.bus.publish(&committed);
        }
        Ok(committed)
    }

    fn event(&self, id: EventId) -> EventStoreResult<Option<Envelope>> {
        self.inner.event(id)
    }

    fn read(&self, query: &StreamQuery) -> EventStoreResult<Vec<Envelope>> {
        self.inner.read(query)
    }

    fn stream_config(&self) -> StreamConfig {
        self.inner.stream_config()
    }
}

impl<S: Transactional> Transactional for PublishingEventStore<S> {
    fn begin(&self) -> EventStoreResult<()> {
        let mut held = self.held.lock();
        if held.is_some() {
            return Err(EventStoreError::TransactionAlreadyStarted);
        }
        self.inner.begin()?;
        *held = Some(Vec::new());
        Ok(())
    }

    #[instrument(name = "publisher.commit", skip(self))]
    fn commit(&self) -> EventStoreResult<()> {
        let mut held = self.held.lock();
        let Some(buffer) = held.take() else {
            return Err(EventStoreError::NoActiveTransaction);
        };
        if let Err(e) = self.inner.commit() {
            // the inner store rolled back or is still open; either way the
            // buffered envelopes were never committed
            *held = self.inner.in_transaction().then_some(buffer);
            return Err(e);
        }
        drop(held);
        if !buffer.is_empty() {
            debug!(count = buffer.len(), "[publisher.commit] publishing held envelopes");
            self.bus.publish(&buffer);
        }
        Ok(())
    }

    fn rollback(&self) -> EventStoreResult<()> {
        let mut held = self.held.lock();
        if held.take().is_none() {
            return Err(EventStoreError::NoActiveTransaction);
        }
        self.inner.rollback()
    }

    fn in_transaction(&self) -> bool {
        self.held.lock().is_some()
    }
}
