//! Batching dirty objects for commit.
//!
//! A unit of work collects objects whose changes still have to reach the
//! store: event producers with pending events, and subscriptions with
//! unsaved progress. `commit` flushes them in the order they were added.
//!
//! Commit is resumable rather than atomic. Objects flushed before a failure
//! stay committed and leave the unit of work; the failing object and every
//! object after it stay tracked, so calling `commit` again retries exactly
//! what is left.

use crate::errors::{UnitOfWorkError, UnitOfWorkResult};
use crate::sourcing::EventProducer;
use crate::store::EventStore;
use crate::subscription::{Subscription, SubscriptionDao};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Shared handle to an event producer.
pub type SharedProducer = Arc<Mutex<dyn EventProducer>>;

/// Shared handle to a subscription.
pub type SharedSubscription = Arc<Mutex<Subscription>>;

/// An object handed to a unit of work. Identity is pointer identity.
#[derive(Clone)]
pub enum Tracked {
    /// An event producer.
    Producer(SharedProducer),
    /// A subscription.
    Subscription(SharedSubscription),
    /// Anything else. Always rejected by the built-in units of work.
    Other {
        /// Type name used in errors
        kind: &'static str,
        /// The object
        object: Arc<dyn Any + Send + Sync>,
    },
}

impl std::fmt::Debug for Tracked {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Producer(producer) => {
                let producer = producer.lock();
                f.debug_struct("Producer")
                    .field("type", producer.producer_type())
                    .field("id", producer.producer_id())
                    .field("pending", &producer.pending().len())
                    .finish()
            }
            Self::Subscription(subscription) => f
                .debug_struct("Subscription")
                .field("id", subscription.lock().id())
                .finish(),
            Self::Other { kind, .. } => f.debug_struct("Other").field("kind", kind).finish(),
        }
    }
}

impl Tracked {
    /// Tracks an event producer.
    pub fn producer<P: EventProducer + 'static>(producer: Arc<Mutex<P>>) -> Self {
        Self::Producer(producer)
    }

    /// Tracks a subscription.
    pub const fn subscription(subscription: SharedSubscription) -> Self {
        Self::Subscription(subscription)
    }

    /// Wraps an object of any other kind.
    pub fn other<T: Any + Send + Sync>(object: Arc<T>) -> Self {
        Self::Other {
            kind: std::any::type_name::<T>(),
            object,
        }
    }

    /// The kind of object, used in errors.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Producer(_) => "event producer",
            Self::Subscription(_) => "subscription",
            Self::Other { kind, .. } => kind,
        }
    }

    /// Returns true if both handles point at the same object.
    pub fn same(&self, other: &Self) -> bool {
        self.address() == other.address()
    }

    fn address(&self) -> *const () {
        match self {
            Self::Producer(producer) => Arc::as_ptr(producer).cast::<()>(),
            Self::Subscription(subscription) => Arc::as_ptr(subscription).cast::<()>(),
            Self::Other { object, .. } => Arc::as_ptr(object).cast::<()>(),
        }
    }
}

/// A buffer of dirty objects committed together.
pub trait UnitOfWork: Send {
    /// Starts tracking `object`. Adding an object twice tracks it once.
    ///
    /// Fails with [`UnitOfWorkError::ObjectNotSupported`] for objects this
    /// unit of work cannot flush.
    fn add(&mut self, object: Tracked) -> UnitOfWorkResult<()>;

    /// Stops tracking `object`. Returns whether it was tracked.
    fn remove(&mut self, object: &Tracked) -> bool;

    /// Returns true if `object` is tracked.
    fn has(&self, object: &Tracked) -> bool;

    /// Number of tracked objects.
    fn count(&self) -> usize;

    /// The tracked objects, in commit order.
    fn uncommitted(&self) -> Vec<Tracked>;

    /// Flushes tracked objects in order and returns the committed ones.
    ///
    /// Stops at the first failure, which is returned; the failing object and
    /// the ones after it remain tracked.
    fn commit(&mut self) -> UnitOfWorkResult<Vec<Tracked>>;

    /// Stops tracking everything without flushing.
    fn clear(&mut self);
}

/// Ordered set of tracked objects shared by the built-in units of work.
#[derive(Debug, Default)]
struct DirtySet {
    objects: VecDeque<Tracked>,
}

impl DirtySet {
    fn insert(&mut self, object: Tracked) {
        if !self.contains(&object) {
            self.objects.push_back(object);
        }
    }

    fn remove(&mut self, object: &Tracked) -> bool {
        let before = self.objects.len();
        self.objects.retain(|tracked| !tracked.same(object));
        self.objects.len() != before
    }

    fn contains(&self, object: &Tracked) -> bool {
        self.objects.iter().any(|tracked| tracked.same(object))
    }

    /// Flushes front to back until `flush` fails.
    fn drain_with<F>(&mut self, mut flush: F) -> UnitOfWorkResult<Vec<Tracked>>
    where
        F: FnMut(&Tracked) -> UnitOfWorkResult<()>,
    {
        let mut committed = Vec::new();
        while let Some(object) = self.objects.front() {
            if let Err(e) = flush(object) {
                warn!(
                    committed = committed.len(),
                    remaining = self.objects.len(),
                    error = %e,
                    "[unit_of_work.commit] stopping at first failure"
                );
                return Err(e);
            }
            if let Some(object) = self.objects.pop_front() {
                committed.push(object);
            }
        }
        Ok(committed)
    }
}

/// Unit of work for event producers, flushed by appending their pending
/// events to a store.
pub struct EventStoreUnitOfWork {
    store: Arc<dyn EventStore>,
    dirty: DirtySet,
}

impl std::fmt::Debug for EventStoreUnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStoreUnitOfWork")
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

impl EventStoreUnitOfWork {
    /// Creates a unit of work appending to `store`.
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            dirty: DirtySet::default(),
        }
    }
}

impl UnitOfWork for EventStoreUnitOfWork {
    fn add(&mut self, object: Tracked) -> UnitOfWorkResult<()> {
        match object {
            Tracked::Producer(_) => {
                self.dirty.insert(object);
                Ok(())
            }
            other => Err(UnitOfWorkError::ObjectNotSupported(other.kind())),
        }
    }

    fn remove(&mut self, object: &Tracked) -> bool {
        self.dirty.remove(object)
    }

    fn has(&self, object: &Tracked) -> bool {
        self.dirty.contains(object)
    }

    fn count(&self) -> usize {
        self.dirty.objects.len()
    }

    fn uncommitted(&self) -> Vec<Tracked> {
        self.dirty.objects.iter().cloned().collect()
    }

    #[instrument(name = "unit_of_work.commit", skip(self), fields(kind = "producers", count = self.dirty.objects.len()))]
    fn commit(&mut self) -> UnitOfWorkResult<Vec<Tracked>> {
        let store = Arc::clone(&self.store);
        self.dirty.drain_with(|object| {
            let Tracked::Producer(producer) = object else {
                return Err(UnitOfWorkError::ObjectNotSupported(object.kind()));
            };
            let mut producer = producer.lock();
            let pending = producer.pending().to_vec();
            if pending.is_empty() {
                return Ok(());
            }
            let committed = store.add(pending)?;
            debug!(
                producer = %producer.producer_id(),
                count = committed.len(),
                "[unit_of_work.commit] producer flushed"
            );
            producer.mark_committed(&committed);
            Ok(())
        })
    }

    fn clear(&mut self) {
        self.dirty.objects.clear();
    }
}

/// Unit of work for subscriptions, flushed by saving their records.
pub struct SubscriptionUnitOfWork {
    dao: Arc<dyn SubscriptionDao>,
    dirty: DirtySet,
}

impl std::fmt::Debug for SubscriptionUnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionUnitOfWork")
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

impl SubscriptionUnitOfWork {
    /// Creates a unit of work saving through `dao`.
    pub fn new(dao: Arc<dyn SubscriptionDao>) -> Self {
        Self {
            dao,
            dirty: DirtySet::default(),
        }
    }
}

impl UnitOfWork for SubscriptionUnitOfWork {
    fn add(&mut self, object: Tracked) -> UnitOfWorkResult<()> {
        match object {
            Tracked::Subscription(_) => {
                self.dirty.insert(object);
                Ok(())
            }
            other => Err(UnitOfWorkError::ObjectNotSupported(other.kind())),
        }
    }

    fn remove(&mut self, object: &Tracked) -> bool {
        self.dirty.remove(object)
    }

    fn has(&self, object: &Tracked) -> bool {
        self.dirty.contains(object)
    }

    fn count(&self) -> usize {
        self.dirty.objects.len()
    }

    fn uncommitted(&self) -> Vec<Tracked> {
        self.dirty.objects.iter().cloned().collect()
    }

    #[instrument(name = "unit_of_work.commit", skip(self), fields(kind = "subscriptions", count = self.dirty.objects.len()))]
    fn commit(&mut self) -> UnitOfWorkResult<Vec<Tracked>> {
        let dao = Arc::clone(&self.dao);
        self.dirty.drain_with(|object| {
            let Tracked::Subscription(subscription) = object else {
                return Err(UnitOfWorkError::ObjectNotSupported(object.kind()));
            };
            let mut subscription = subscription.lock();
            if !subscription.is_dirty() {
                return Ok(());
            }
            dao.save(&subscription.record(), subscription.committed_version())?;
            subscription.mark_saved();
            debug!(
                id = %subscription.id(),
                version = subscription.version(),
                "[unit_of_work.commit] subscription saved"
            );
            Ok(())
        })
    }

    fn clear(&mut self) {
        self.dirty.objects.clear();
    }
}

/// Delegates to an ordered list of units of work.
///
/// `add` goes to the first member that does not reject the object as
/// unsupported. Everything else fans out to all members in order.
#[derive(Default)]
pub struct CompositeUnitOfWork {
    members: Vec<Box<dyn UnitOfWork>>,
}

impl std::fmt::Debug for CompositeUnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeUnitOfWork")
            .field("members", &self.members.len())
            .finish()
    }
}

impl CompositeUnitOfWork {
    /// Creates a composite over `members`.
    pub fn new(members: Vec<Box<dyn UnitOfWork>>) -> Self {
        Self { members }
    }

    /// Appends a member.
    #[must_use]
    pub fn with(mut self, member: Box<dyn UnitOfWork>) -> Self {
        self.members.push(member);
        self
    }
}

impl UnitOfWork for CompositeUnitOfWork {
    fn add(&mut self, object: Tracked) -> UnitOfWorkResult<()> {
        for member in &mut self.members {
            match member.add(object.clone()) {
                Err(UnitOfWorkError::ObjectNotSupported(_)) => {}
                result => return result,
            }
        }
        Err(UnitOfWorkError::ObjectNotSupported(object.kind()))
    }

    fn remove(&mut self, object: &Tracked) -> bool {
        self.members
            .iter_mut()
            .fold(false, |removed, member| member.remove(object) || removed)
    }

    fn has(&self, object: &Tracked) -> bool {
        self.members.iter().any(|member| member.has(object))
    }

    fn count(&self) -> usize {
        self.members.iter().map(|member| member.count()).sum()
    }

    fn uncommitted(&self) -> Vec<Tracked> {
        self.members
            .iter()
            .flat_map(|member| member.uncommitted())
            .collect()
    }

    fn commit(&mut self) -> UnitOfWorkResult<Vec<Tracked>> {
        let mut committed = Vec::new();
        for member in &mut self.members {
            committed.extend(member.commit()?);
        }
        Ok(committed)
    }

    fn clear(&mut self) {
        for member in &mut self.members {
            member.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::errors::{EventStoreError, EventStoreResult};
    use crate::store::StreamQuery;
    use crate::types::{EventId, Id, ProducerType};

    /// A store that refuses every write.
    struct ReadOnly;

    impl EventStore for ReadOnly {
        fn add(&self, _: Vec<Envelope>) -> EventStoreResult<Vec<Envelope>> {
            Err(EventStoreError::backend(std::io::Error::other("read only")))
        }

        fn event(&self, _: EventId) -> EventStoreResult<Option<Envelope>> {
            Ok(None)
        }

        fn read(&self, _: &StreamQuery) -> EventStoreResult<Vec<Envelope>> {
            Ok(Vec::new())
        }
    }

    struct Idle {
        kind: ProducerType,
        id: Id,
    }

    impl EventProducer for Idle {
        fn producer_type(&self) -> &ProducerType {
            &self.kind
        }

        fn producer_id(&self) -> &Id {
            &self.id
        }

        fn pending(&self) -> &[Envelope] {
            &[]
        }

        fn mark_committed(&mut self, _: &[Envelope]) {}
    }

    fn idle(id: &str) -> Arc<Mutex<Idle>> {
        Arc::new(Mutex::new(Idle {
            kind: ProducerType::try_new("idle").unwrap(),
            id: Id::try_new(id).unwrap(),
        }))
    }

    #[test]
    fn identity_is_by_pointer() {
        let first = idle("same");
        let twin = idle("same");

        let mut uow = EventStoreUnitOfWork::new(Arc::new(ReadOnly));
        uow.add(Tracked::producer(Arc::clone(&first))).unwrap();
        uow.add(Tracked::producer(Arc::clone(&first))).unwrap();

        assert_eq!(uow.count(), 1);
        assert!(uow.has(&Tracked::producer(Arc::clone(&first))));
        assert!(!uow.has(&Tracked::producer(twin)));
        assert!(uow.remove(&Tracked::producer(first)));
        assert_eq!(uow.count(), 0);
    }

    #[test]
    fn unsupported_objects_are_rejected() {
        let mut uow = EventStoreUnitOfWork::new(Arc::new(ReadOnly));
        let err = uow.add(Tracked::other(Arc::new(42_u32))).unwrap_err();
        assert!(matches!(err, UnitOfWorkError::ObjectNotSupported("u32")));

        let mut composite = CompositeUnitOfWork::default().with(Box::new(uow));
        assert!(matches!(
            composite.add(Tracked::other(Arc::new("text"))),
            Err(UnitOfWorkError::ObjectNotSupported(_))
        ));
    }

    #[test]
    fn producers_without_pending_events_commit_without_touching_the_store() {
        let mut uow = EventStoreUnitOfWork::new(Arc::new(ReadOnly));
        uow.add(Tracked::producer(idle("a"))).unwrap();
        uow.add(Tracked::producer(idle("b"))).unwrap();

        let committed = uow.commit().unwrap();
        assert_eq!(committed.len(), 2);
        assert_eq!(uow.count(), 0);
        assert!(uow.uncommitted().is_empty());
    }

    #[test]
    fn clear_forgets_everything() {
        let mut uow = EventStoreUnitOfWork::new(Arc::new(ReadOnly));
        uow.add(Tracked::producer(idle("a"))).unwrap();
        uow.clear();
        assert_eq!(uow.count(), 0);
    }
}
