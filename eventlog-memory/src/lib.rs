//! In-memory backend for the `eventlog` crate.
//!
//! [`InMemoryEventStore`] keeps the log and the subscription records behind
//! one lock. It implements the full [`EventStore`] contract, including
//! duplicate and concurrent-write detection, and supports transactions by
//! snapshotting its state on `begin`. Useful for tests and development
//! where persistence is not required.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use eventlog::clock::{Clock, SystemClock};
use eventlog::config::StreamConfig;
use eventlog::errors::{EventStoreError, EventStoreResult};
use eventlog::store::{EventStore, Order, StreamQuery, Transactional};
use eventlog::subscription::{SubscriptionDao, SubscriptionRecord};
use eventlog::types::{EventId, Id, ProducerType, ProducerVersion, Sequence};
use eventlog::Envelope;
use parking_lot::RwLock;
use tracing::{debug, instrument, warn};

type VersionKey = (ProducerType, Id, ProducerVersion);

#[derive(Debug, Clone, Default)]
struct State {
    // The log in append order; an envelope's sequence is its index + 1
    log: Vec<Envelope>,
    ids: HashMap<EventId, usize>,
    versions: HashSet<VersionKey>,
    records: BTreeMap<Id, SubscriptionRecord>,
}

impl State {
    fn next_sequence(&self) -> Sequence {
        self.log
            .last()
            .and_then(Envelope::sequence)
            .map_or_else(Sequence::first, Sequence::next)
    }

    fn check(&self, envelopes: &[Envelope]) -> EventStoreResult<()> {
        let mut batch_ids = HashSet::new();
        let mut batch_versions = HashSet::new();
        for envelope in envelopes {
            let id = envelope.id();
            if self.ids.contains_key(&id) || !batch_ids.insert(id) {
                warn!(event = %id, "[memory.add] event already in store");
                return Err(EventStoreError::EventAlreadyInStore(id));
            }
            if let Some(version) = envelope.version() {
                let key = (
                    envelope.producer_type().clone(),
                    envelope.producer_id().clone(),
                    version,
                );
                if self.versions.contains(&key) || !batch_versions.insert(key) {
                    warn!(
                        producer = %envelope.producer_id(),
                        %version,
                        "[memory.add] concurrent write detected"
                    );
                    return Err(EventStoreError::ConcurrentWriteDetected(
                        envelope.producer_id().clone(),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: State,
    snapshot: Option<State>,
}

/// Thread-safe in-memory event store.
///
/// Clones share the same log. Writes made inside a transaction are visible
/// to readers immediately; `rollback` restores the state as it was at
/// `begin`.
#[derive(Clone)]
pub struct InMemoryEventStore {
    inner: Arc<RwLock<Inner>>,
    clock: Arc<dyn Clock>,
    config: StreamConfig,
}

impl std::fmt::Debug for InMemoryEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("InMemoryEventStore")
            .field("envelopes", &inner.state.log.len())
            .field("subscriptions", &inner.state.records.len())
            .field("in_transaction", &inner.snapshot.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl InMemoryEventStore {
    /// Create a new empty in-memory event store
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            clock: Arc::new(SystemClock),
            config: StreamConfig::default(),
        }
    }

    /// Uses `clock` to stamp appended envelopes.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Uses `config` for streams over this store.
    #[must_use]
    pub const fn with_config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    /// Number of stored envelopes.
    pub fn len(&self) -> usize {
        self.inner.read().state.log.len()
    }

    /// Returns true if nothing was appended yet.
    pub fn is_empty(&self) -> bool {
        self.inner.read().state.log.is_empty()
    }

    /// Every stored envelope, in append order.
    pub fn envelopes(&self) -> Vec<Envelope> {
        self.inner.read().state.log.clone()
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore for InMemoryEventStore {
    #[instrument(name = "memory.add", skip_all, fields(count = envelopes.len()))]
    fn add(&self, envelopes: Vec<Envelope>) -> EventStoreResult<Vec<Envelope>> {
        if envelopes.is_empty() {
            return Err(EventStoreError::EmptyBatch);
        }

        let mut inner = self.inner.write();
        let state = &mut inner.state;
        state.check(&envelopes)?;

        let appended_at = self.clock.now();
        let mut committed = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            let stored = envelope
                .with_sequence(state.next_sequence())
                .with_appended_at(appended_at);
            if let Some(version) = stored.version() {
                state.versions.insert((
                    stored.producer_type().clone(),
                    stored.producer_id().clone(),
                    version,
                ));
            }
            state.ids.insert(stored.id(), state.log.len());
            state.log.push(stored.clone());
            committed.push(stored);
        }

        debug!(
            last_sequence = ?committed.last().and_then(Envelope::sequence),
            "[memory.add] appended envelopes"
        );
        Ok(committed)
    }

    fn event(&self, id: EventId) -> EventStoreResult<Option<Envelope>> {
        let inner = self.inner.read();
        Ok(inner
            .state
            .ids
            .get(&id)
            .and_then(|&index| inner.state.log.get(index))
            .cloned())
    }

    fn read(&self, query: &StreamQuery) -> EventStoreResult<Vec<Envelope>> {
        let inner = self.inner.read();
        let log = &inner.state.log;

        // Sequences are dense, so the bounds translate into slice positions.
        let start = query
            .after
            .map_or(0, |after| usize::try_from(after.into_inner()).unwrap_or(usize::MAX))
            .min(log.len());
        let end = query
            .until
            .map_or(log.len(), |until| {
                usize::try_from(until.into_inner()).unwrap_or(usize::MAX)
            })
            .min(log.len());
        let window = log.get(start..end).unwrap_or_default();

        let page = match query.order {
            Order::Ascending => window
                .iter()
                .filter(|envelope| query.matches(envelope))
                .take(query.limit)
                .cloned()
                .collect(),
            Order::Descending => window
                .iter()
                .rev()
                .filter(|envelope| query.matches(envelope))
                .take(query.limit)
                .cloned()
                .collect(),
        };
        Ok(page)
    }

    fn stream_config(&self) -> StreamConfig {
        self.config
    }
}

impl Transactional for InMemoryEventStore {
    fn begin(&self) -> EventStoreResult<()> {
        let mut inner = self.inner.write();
        if inner.snapshot.is_some() {
            return Err(EventStoreError::TransactionAlreadyStarted);
        }
        inner.snapshot = Some(inner.state.clone());
        debug!("[memory.begin] transaction started");
        Ok(())
    }

    fn commit(&self) -> EventStoreResult<()> {
        let mut inner = self.inner.write();
        if inner.snapshot.take().is_none() {
            return Err(EventStoreError::NoActiveTransaction);
        }
        debug!("[memory.commit] transaction committed");
        Ok(())
    }

    fn rollback(&self) -> EventStoreResult<()> {
        let mut inner = self.inner.write();
        let Some(snapshot) = inner.snapshot.take() else {
            return Err(EventStoreError::NoActiveTransaction);
        };
        inner.state = snapshot;
        debug!("[memory.rollback] transaction rolled back");
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.inner.read().snapshot.is_some()
    }
}

impl SubscriptionDao for InMemoryEventStore {
    #[instrument(name = "memory.save_subscription", skip_all, fields(id = %record.id, version = record.version))]
    fn save(&self, record: &SubscriptionRecord, expected_version: u64) -> EventStoreResult<()> {
        let mut inner = self.inner.write();
        let records = &mut inner.state.records;
        let current = records.get(&record.id).map_or(0, |stored| stored.version);
        if current != expected_version {
            warn!(
                current,
                expected = expected_version,
                "[memory.save_subscription] stored version moved"
            );
            return Err(EventStoreError::ConcurrentWriteDetected(record.id.clone()));
        }
        records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn one(&self, id: &Id) -> EventStoreResult<Option<SubscriptionRecord>> {
        Ok(self.inner.read().state.records.get(id).cloned())
    }

    fn all(&self) -> EventStoreResult<Vec<SubscriptionRecord>> {
        Ok(self.inner.read().state.records.values().cloned().collect())
    }

    fn delete(&self, id: &Id) -> EventStoreResult<bool> {
        Ok(self.inner.write().state.records.remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventlog::event::Event;
    use eventlog::store::EventFilter;
    use eventlog::subscription::SubscriptionStatus;
    use eventlog::testing::FixedClock;
    use eventlog::types::EventName;

    #[derive(Debug)]
    struct Noted(&'static str);

    impl Event for Noted {
        fn name(&self) -> EventName {
            EventName::from(self.0)
        }
    }

    fn producer() -> (ProducerType, Id) {
        (
            ProducerType::try_new("note.pad").unwrap(),
            Id::try_new("pad-1").unwrap(),
        )
    }

    fn versioned(name: &'static str, version: u64) -> Envelope {
        let (kind, id) = producer();
        Envelope::versioned(kind, id, ProducerVersion::try_new(version).unwrap(), Noted(name))
    }

    fn record(id: &str, version: u64) -> SubscriptionRecord {
        SubscriptionRecord {
            id: Id::try_new(id).unwrap(),
            version,
            status: SubscriptionStatus::Started,
            paused: false,
            started_by: None,
            started_at: None,
            last_processed: None,
            last_processed_at: None,
            state: None,
        }
    }

    #[test]
    fn appends_assign_increasing_sequences_and_the_clock_time() {
        let clock = Arc::new(FixedClock::epoch());
        let store = InMemoryEventStore::new().with_clock(clock.clone());

        let first = store.add(vec![versioned("a", 1), versioned("b", 2)]).unwrap();
        let second = store.add(vec![versioned("c", 3)]).unwrap();

        let sequences: Vec<u64> = first
            .iter()
            .chain(&second)
            .filter_map(Envelope::sequence)
            .map(Sequence::into_inner)
            .collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(first[0].appended_at(), Some(clock.now()));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn empty_batches_are_rejected() {
        let store = InMemoryEventStore::new();
        assert!(matches!(store.add(Vec::new()), Err(EventStoreError::EmptyBatch)));
    }

    #[test]
    fn duplicate_ids_reject_the_whole_batch() {
        let store = InMemoryEventStore::new();
        let stored = store.add(vec![versioned("a", 1)]).unwrap();

        let again = stored[0].with_version(ProducerVersion::try_new(5).unwrap());
        let err = store.add(vec![versioned("b", 2), again]).unwrap_err();
        assert!(matches!(err, EventStoreError::EventAlreadyInStore(id) if id == stored[0].id()));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn duplicate_versions_within_one_batch_conflict() {
        let store = InMemoryEventStore::new();
        let err = store
            .add(vec![versioned("a", 1), versioned("b", 1)])
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(store.is_empty());
    }

    #[test]
    fn unversioned_envelopes_never_conflict() {
        let store = InMemoryEventStore::new();
        let (kind, id) = producer();
        store
            .add(vec![
                Envelope::new(kind.clone(), id.clone(), Noted("a")),
                Envelope::new(kind, id, Noted("a")),
            ])
            .unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn descending_reads_start_at_the_upper_bound() {
        let store = InMemoryEventStore::new();
        store
            .add(vec![versioned("a", 1), versioned("b", 2), versioned("c", 3)])
            .unwrap();

        let mut query = StreamQuery::new(EventFilter::all(), 1);
        query.order = Order::Descending;
        query.until = Some(Sequence::try_new(2).unwrap());

        let page = store.read(&query).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].name().as_ref(), "b");
    }

    #[test]
    fn rollback_restores_log_and_records() {
        let store = InMemoryEventStore::new();
        store.add(vec![versioned("a", 1)]).unwrap();
        store.save(&record("projector", 1), 0).unwrap();

        store.begin().unwrap();
        assert!(matches!(
            store.begin(),
            Err(EventStoreError::TransactionAlreadyStarted)
        ));
        store.add(vec![versioned("b", 2)]).unwrap();
        store.save(&record("projector", 2), 1).unwrap();
        store.rollback().unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.one(&Id::try_new("projector").unwrap()).unwrap().unwrap().version, 1);
        assert!(!store.in_transaction());
        assert!(matches!(store.commit(), Err(EventStoreError::NoActiveTransaction)));

        // The rolled back version is free again.
        store.add(vec![versioned("b", 2)]).unwrap();
    }

    #[test]
    fn subscription_saves_are_optimistic() {
        let store = InMemoryEventStore::new();
        let id = Id::try_new("projector").unwrap();

        store.save(&record("projector", 3), 0).unwrap();
        let err = store.save(&record("projector", 4), 0).unwrap_err();
        assert!(matches!(err, EventStoreError::ConcurrentWriteDetected(ref who) if *who == id));

        store.save(&record("projector", 4), 3).unwrap();
        assert!(store.exists(&id).unwrap());
        assert_eq!(store.all().unwrap().len(), 1);
        assert!(store.delete(&id).unwrap());
        assert!(!store.delete(&id).unwrap());
    }

    #[test]
    fn clones_share_the_log() {
        let store = InMemoryEventStore::new();
        let clone = store.clone();
        let stored = store.add(vec![versioned("a", 1)]).unwrap();
        assert_eq!(
            clone.event(stored[0].id()).unwrap().as_ref().map(Envelope::id),
            Some(stored[0].id())
        );
    }
}
