//! Catch-up subscriptions.
//!
//! A [`Subscription`] tracks one [`Listener`]'s progress through the log. It
//! is created unstarted, started for a triggering envelope with
//! [`start_for`](Subscription::start_for), and then driven in passes with
//! [`subscribe_to`](Subscription::subscribe_to). Each pass is a
//! [`SubscriptionCursor`]: an iterator that feeds envelopes to the listener
//! and yields the ones it accepted.
//!
//! ```text
//! NotStarted --start_for--> Starting --first clean pass--> Started
//! Started --listener completed--> Completed
//! Started | Completed --restart--> Started
//! pause / unpause toggle a flag orthogonal to the status
//! ```
//!
//! The version grows by one per examined envelope, accepted or not, and by
//! one on `start_for` and `restart`. Progress is only persisted when the
//! caller checkpoints, so delivery is at-least-once unless a
//! [`TransactionalCursor`] couples progress and store writes.

mod dao;
mod repository;
mod transactional;

pub use dao::{SubscriptionDao, SubscriptionRecord};
pub use repository::{ListenerFactory, SubscriptionRepository};
pub use transactional::TransactionalCursor;

use crate::clock::Clock;
use crate::envelope::Envelope;
use crate::errors::{EventStoreResult, ListenerError, SubscriptionError, SubscriptionResult};
use crate::store::{EventFilter, EventStore};
use crate::stream::{Stream, StreamIter};
use crate::types::{EventId, Id, Timestamp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Consumer of envelopes driven by a [`Subscription`].
///
/// Only `id` and `on` are required. The `as_*` accessors expose optional
/// capabilities; a listener that has one returns `Some(self)`.
pub trait Listener: Send {
    /// Stable identity, also the identity of its subscription.
    fn id(&self) -> &Id;

    /// Handles one envelope. Returns whether it was accepted.
    fn on(&mut self, envelope: &Envelope) -> Result<bool, ListenerError>;

    /// Completion capability.
    fn as_completable(&self) -> Option<&dyn Completable> {
        None
    }

    /// Reset capability.
    fn as_resettable(&mut self) -> Option<&mut dyn Resettable> {
        None
    }

    /// Start anchor selection capability.
    fn as_picker(&self) -> Option<&dyn Picker> {
        None
    }

    /// Stream narrowing capability.
    fn as_filterer(&self) -> Option<&dyn Filterer> {
        None
    }

    /// State export capability.
    fn as_stateful(&self) -> Option<&dyn Stateful> {
        None
    }

    /// State import capability.
    fn as_stateful_mut(&mut self) -> Option<&mut dyn Stateful> {
        None
    }
}

/// A listener that can finish.
pub trait Completable {
    /// Returns true once the listener wants no more envelopes.
    fn completed(&self) -> bool;
}

/// A listener whose local state can be cleared for a restart.
pub trait Resettable {
    /// Clears listener-local state.
    fn reset(&mut self);
}

/// A listener that chooses where its subscription starts.
pub trait Picker {
    /// Returns the envelope to start from instead of `trigger`. `None`
    /// starts from the beginning of the log.
    fn pick(&self, store: &dyn EventStore, trigger: &Envelope) -> EventStoreResult<Option<Envelope>>;
}

/// A listener that narrows the stream it is fed.
pub trait Filterer {
    /// Refines the stream before delivery.
    fn filter<'s>(&self, stream: Stream<'s>) -> Stream<'s>;
}

/// A listener that keeps its own resumption state.
pub trait Stateful {
    /// Exports the state to persist with the subscription.
    fn to_state(&self) -> ListenerState;

    /// Imports previously exported state.
    fn from_state(&mut self, state: ListenerState) -> Result<(), ListenerError>;
}

/// Opaque listener state persisted alongside a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListenerState(Value);

impl ListenerState {
    /// Wraps a JSON value.
    pub const fn new(value: Value) -> Self {
        Self(value)
    }

    /// Serializes any value into listener state.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, ListenerError> {
        Ok(Self(serde_json::to_value(value)?))
    }

    /// Deserializes listener state into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ListenerError> {
        Ok(serde_json::from_value(self.0.clone())?)
    }

    /// The raw JSON value.
    pub const fn as_value(&self) -> &Value {
        &self.0
    }

    /// Unwraps the JSON value.
    pub fn into_value(self) -> Value {
        self.0
    }
}

/// Lifecycle status of a subscription. Pausing is tracked separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Created, `start_for` not called yet.
    NotStarted,
    /// Started, first pass not finished yet.
    Starting,
    /// At least one pass finished.
    Started,
    /// The listener reported completion.
    Completed,
}

impl SubscriptionStatus {
    /// The name stored in persisted records.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Completed => "completed",
        }
    }

    /// Parses a stored status name.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "not_started" => Some(Self::NotStarted),
            "starting" => Some(Self::Starting),
            "started" => Some(Self::Started),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Progress fields restored when a transactional batch rolls back.
#[derive(Debug, Clone, Copy)]
struct Progress {
    status: SubscriptionStatus,
    version: u64,
    started_by: Option<EventId>,
    started_at: Option<Timestamp>,
    last_processed: Option<EventId>,
    last_processed_at: Option<Timestamp>,
}

/// One listener's persistent cursor over the log.
pub struct Subscription {
    listener: Box<dyn Listener>,
    clock: Arc<dyn Clock>,
    status: SubscriptionStatus,
    paused: bool,
    committed_paused: bool,
    version: u64,
    committed_version: u64,
    started_by: Option<EventId>,
    started_at: Option<Timestamp>,
    last_processed: Option<EventId>,
    last_processed_at: Option<Timestamp>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", self.id())
            .field("status", &self.status)
            .field("paused", &self.paused)
            .field("committed_paused", &self.committed_paused)
            .field("version", &self.version)
            .field("committed_version", &self.committed_version)
            .field("started_by", &self.started_by)
            .field("last_processed", &self.last_processed)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// A new, unstarted subscription for `listener`.
    pub fn new(listener: Box<dyn Listener>, clock: Arc<dyn Clock>) -> Self {
        Self {
            listener,
            clock,
            status: SubscriptionStatus::NotStarted,
            paused: false,
            committed_paused: false,
            version: 0,
            committed_version: 0,
            started_by: None,
            started_at: None,
            last_processed: None,
            last_processed_at: None,
        }
    }

    /// Rebuilds a subscription from its persisted record.
    ///
    /// Stateful listeners receive the stored state blob. The record must
    /// carry the listener's id.
    pub fn restore(
        mut listener: Box<dyn Listener>,
        record: SubscriptionRecord,
        clock: Arc<dyn Clock>,
    ) -> SubscriptionResult<Self> {
        if record.id != *listener.id() {
            return Err(SubscriptionError::RecordMismatch {
                record: record.id,
                listener: listener.id().clone(),
            });
        }
        if let (Some(state), Some(stateful)) = (record.state, listener.as_stateful_mut()) {
            stateful
                .from_state(state)
                .map_err(|source| SubscriptionError::Listener {
                    id: record.id.clone(),
                    source,
                })?;
        }
        Ok(Self {
            listener,
            clock,
            status: record.status,
            paused: record.paused,
            committed_paused: record.paused,
            version: record.version,
            committed_version: record.version,
            started_by: record.started_by,
            started_at: record.started_at,
            last_processed: record.last_processed,
            last_processed_at: record.last_processed_at,
        })
    }

    /// Identity, taken from the listener.
    pub fn id(&self) -> &Id {
        self.listener.id()
    }

    /// The listener.
    pub fn listener(&self) -> &dyn Listener {
        self.listener.as_ref()
    }

    /// The listener, mutably.
    pub fn listener_mut(&mut self) -> &mut dyn Listener {
        self.listener.as_mut()
    }

    /// Current status.
    pub const fn status(&self) -> SubscriptionStatus {
        self.status
    }

    /// Monotonic version counter.
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// The version last persisted.
    pub const fn committed_version(&self) -> u64 {
        self.committed_version
    }

    /// Returns true if progress or the pause flag changed since the
    /// subscription was last persisted.
    pub const fn is_dirty(&self) -> bool {
        self.version != self.committed_version || self.paused != self.committed_paused
    }

    /// Returns true while paused.
    pub const fn paused(&self) -> bool {
        self.paused
    }

    /// Returns true between `start_for` and the end of the first pass.
    pub fn starting(&self) -> bool {
        self.status == SubscriptionStatus::Starting
    }

    /// Returns true once a pass has finished.
    pub fn started(&self) -> bool {
        self.status == SubscriptionStatus::Started
    }

    /// Returns true once the listener completed.
    pub fn completed(&self) -> bool {
        self.status == SubscriptionStatus::Completed
    }

    /// The envelope the subscription started from.
    pub const fn started_by(&self) -> Option<EventId> {
        self.started_by
    }

    /// When `start_for` was called.
    pub const fn started_at(&self) -> Option<Timestamp> {
        self.started_at
    }

    /// The last envelope examined.
    pub const fn last_processed(&self) -> Option<EventId> {
        self.last_processed
    }

    /// When the last envelope was examined.
    pub const fn last_processed_at(&self) -> Option<Timestamp> {
        self.last_processed_at
    }

    /// Starts the subscription at `trigger`, or wherever the listener's
    /// picker chooses.
    #[instrument(name = "subscription.start_for", skip_all, fields(id = %self.id(), trigger = %trigger.id()))]
    pub fn start_for(&mut self, trigger: &Envelope, store: &dyn EventStore) -> SubscriptionResult<()> {
        if self.status != SubscriptionStatus::NotStarted {
            return Err(SubscriptionError::AlreadyStarted(self.id().clone()));
        }

        let anchor = match self.listener.as_picker() {
            Some(picker) => picker.pick(store, trigger)?.map(|envelope| envelope.id()),
            None => Some(trigger.id()),
        };

        self.started_by = anchor;
        self.started_at = Some(self.clock.now());
        self.status = SubscriptionStatus::Starting;
        self.version += 1;
        info!(started_by = ?anchor, "[subscription.start_for] subscription starting");
        Ok(())
    }

    /// Opens a catch-up pass over `store`.
    ///
    /// Preconditions are checked here; `limit` is checked on the first pull.
    pub fn subscribe_to<'a>(
        &'a mut self,
        store: &'a dyn EventStore,
        limit: Option<i64>,
    ) -> SubscriptionResult<SubscriptionCursor<'a>> {
        match self.status {
            SubscriptionStatus::NotStarted => {
                return Err(SubscriptionError::NotStartedYet(self.id().clone()));
            }
            SubscriptionStatus::Completed => {
                return Err(SubscriptionError::AlreadyCompleted(self.id().clone()));
            }
            SubscriptionStatus::Starting | SubscriptionStatus::Started => {}
        }
        if self.paused {
            return Err(SubscriptionError::Paused(self.id().clone()));
        }

        debug!(id = %self.id(), version = self.version, ?limit, "[subscription.subscribe_to] opening pass");
        Ok(SubscriptionCursor {
            subscription: self,
            store,
            limit,
            state: CursorState::Fresh,
        })
    }

    /// Pauses the subscription. Idempotent.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Resumes the subscription. Idempotent.
    pub fn unpause(&mut self) {
        self.paused = false;
    }

    /// Restarts from the start anchor with listener-local state reset.
    ///
    /// Only valid from `Started` or `Completed`, and not while paused.
    #[instrument(name = "subscription.restart", skip_all, fields(id = %self.id()))]
    pub fn restart(&mut self) -> SubscriptionResult<()> {
        let restartable = matches!(
            self.status,
            SubscriptionStatus::Started | SubscriptionStatus::Completed
        );
        if !restartable || self.paused {
            return Err(SubscriptionError::RestartNotPossible(self.id().clone()));
        }

        if let Some(resettable) = self.listener.as_resettable() {
            resettable.reset();
        }
        self.last_processed = None;
        self.last_processed_at = None;
        self.status = SubscriptionStatus::Started;
        self.version += 1;
        info!(version = self.version, "[subscription.restart] subscription restarted");
        Ok(())
    }

    /// The persisted form of this subscription.
    pub fn record(&self) -> SubscriptionRecord {
        SubscriptionRecord {
            id: self.id().clone(),
            version: self.version,
            status: self.status,
            paused: self.paused,
            started_by: self.started_by,
            started_at: self.started_at,
            last_processed: self.last_processed,
            last_processed_at: self.last_processed_at,
            state: self.listener.as_stateful().map(|stateful| stateful.to_state()),
        }
    }

    /// Persists progress through `dao`, expecting the stored version to be
    /// the one this subscription last saved.
    #[instrument(name = "subscription.save", skip_all, fields(id = %self.id(), version = self.version))]
    pub fn save(&mut self, dao: &dyn SubscriptionDao) -> SubscriptionResult<()> {
        if let Err(e) = dao.save(&self.record(), self.committed_version) {
            if e.is_retryable() {
                warn!(expected = self.committed_version, "[subscription.save] stored version moved");
            }
            return Err(e.into());
        }
        self.mark_saved();
        Ok(())
    }

    /// Records that the current state is persisted.
    pub fn mark_saved(&mut self) {
        self.committed_version = self.version;
        self.committed_paused = self.paused;
    }

    fn progress(&self) -> Progress {
        Progress {
            status: self.status,
            version: self.version,
            started_by: self.started_by,
            started_at: self.started_at,
            last_processed: self.last_processed,
            last_processed_at: self.last_processed_at,
        }
    }

    fn rewind(&mut self, progress: Progress, state: Option<ListenerState>) {
        self.status = progress.status;
        self.version = progress.version;
        self.started_by = progress.started_by;
        self.started_at = progress.started_at;
        self.last_processed = progress.last_processed;
        self.last_processed_at = progress.last_processed_at;
        if let (Some(state), Some(stateful)) = (state, self.listener.as_stateful_mut()) {
            if let Err(e) = stateful.from_state(state) {
                warn!(error = %e, "[subscription.rewind] listener state could not be restored");
            }
        }
    }

    fn stream<'a>(&self, store: &'a dyn EventStore) -> Stream<'a> {
        let mut stream = Stream::new(store, EventFilter::all());
        if let Some(filterer) = self.listener.as_filterer() {
            stream = filterer.filter(stream);
        }
        match (self.last_processed, self.started_by) {
            (Some(last), _) => stream.after(last),
            (None, Some(start)) => stream.from(start),
            (None, None) => stream,
        }
    }
}

enum CursorState<'a> {
    Fresh,
    Running {
        envelopes: StreamIter<'a>,
        remaining: Option<u64>,
    },
    Done,
}

/// One catch-up pass of a subscription.
///
/// Yields the envelopes the listener accepted. Every examined envelope bumps
/// the subscription version; the pass stops at the limit, at the end of the
/// stream, or as soon as the listener reports completion. A pass that ends
/// without error moves a starting subscription to started.
pub struct SubscriptionCursor<'a> {
    subscription: &'a mut Subscription,
    store: &'a dyn EventStore,
    limit: Option<i64>,
    state: CursorState<'a>,
}

impl std::fmt::Debug for SubscriptionCursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionCursor")
            .field("subscription", &self.subscription)
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

impl SubscriptionCursor<'_> {
    /// The subscription being driven.
    pub fn subscription(&self) -> &Subscription {
        self.subscription
    }

    /// Persists the progress made so far.
    pub fn checkpoint(&mut self, dao: &dyn SubscriptionDao) -> SubscriptionResult<()> {
        self.subscription.save(dao)
    }

    fn finish(&mut self) {
        if self.subscription.status == SubscriptionStatus::Starting {
            self.subscription.status = SubscriptionStatus::Started;
        }
        self.state = CursorState::Done;
    }

    fn fail(&mut self, error: SubscriptionError) -> Option<SubscriptionResult<Envelope>> {
        self.state = CursorState::Done;
        Some(Err(error))
    }
}

impl Iterator for SubscriptionCursor<'_> {
    type Item = SubscriptionResult<Envelope>;

    fn next(&mut self) -> Option<Self::Item> {
        if matches!(self.state, CursorState::Fresh) {
            let remaining = match self.limit {
                Some(limit) if limit <= 0 => {
                    return self.fail(SubscriptionError::InvalidLimit(limit));
                }
                Some(limit) => Some(limit.unsigned_abs()),
                None => None,
            };
            self.state = CursorState::Running {
                envelopes: self.subscription.stream(self.store).iter(),
                remaining,
            };
        }

        loop {
            let CursorState::Running {
                envelopes,
                remaining,
            } = &mut self.state
            else {
                return None;
            };

            if *remaining == Some(0) {
                self.finish();
                return None;
            }

            let envelope = match envelopes.next() {
                None => {
                    self.finish();
                    return None;
                }
                Some(Err(e)) => return self.fail(e.into()),
                Some(Ok(envelope)) => envelope,
            };

            let subscription = &mut *self.subscription;
            let accepted = match subscription.listener.on(&envelope) {
                Ok(accepted) => accepted,
                Err(source) => {
                    let id = subscription.id().clone();
                    warn!(%id, event = %envelope.id(), error = %source, "[subscription.next] listener failed");
                    return self.fail(SubscriptionError::Listener { id, source });
                }
            };

            subscription.version += 1;
            subscription.last_processed = Some(envelope.id());
            subscription.last_processed_at = Some(subscription.clock.now());

            let completed = subscription
                .listener
                .as_completable()
                .is_some_and(|completable| completable.completed());

            if accepted {
                if let Some(left) = remaining.as_mut() {
                    *left -= 1;
                }
            }
            let limit_reached = *remaining == Some(0);

            if completed {
                subscription.status = SubscriptionStatus::Completed;
                info!(id = %subscription.id(), version = subscription.version, "[subscription.next] listener completed");
                self.state = CursorState::Done;
            } else if limit_reached {
                self.finish();
            }

            if accepted {
                return Some(Ok(envelope));
            }
            if completed {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use serde_json::json;

    struct Quiet(Id);

    impl Listener for Quiet {
        fn id(&self) -> &Id {
            &self.0
        }

        fn on(&mut self, _: &Envelope) -> Result<bool, ListenerError> {
            Ok(true)
        }
    }

    fn quiet(id: &str) -> Box<dyn Listener> {
        Box::new(Quiet(Id::try_new(id).unwrap()))
    }

    #[test]
    fn pausing_makes_a_saved_subscription_dirty() {
        let mut subscription = Subscription::new(quiet("projector"), Arc::new(SystemClock));
        assert!(!subscription.is_dirty());

        subscription.pause();
        assert!(subscription.is_dirty());
        assert_eq!(subscription.version(), 0);
        subscription.unpause();
        assert!(!subscription.is_dirty());

        subscription.pause();
        subscription.mark_saved();
        assert!(!subscription.is_dirty());
        assert!(subscription.record().paused);
        subscription.unpause();
        assert!(subscription.is_dirty());
    }

    #[test]
    fn restore_rejects_a_record_of_another_listener() {
        let record = Subscription::new(quiet("projector"), Arc::new(SystemClock)).record();

        let err = Subscription::restore(quiet("mailer"), record.clone(), Arc::new(SystemClock))
            .unwrap_err();
        assert!(matches!(
            err,
            SubscriptionError::RecordMismatch { ref record, ref listener }
                if record.as_str() == "projector" && listener.as_str() == "mailer"
        ));

        let mut paused = record;
        paused.paused = true;
        let restored = Subscription::restore(quiet("projector"), paused, Arc::new(SystemClock)).unwrap();
        assert!(restored.paused());
        assert!(!restored.is_dirty());
    }

    #[test]
    fn status_names_round_trip() {
        for status in [
            SubscriptionStatus::NotStarted,
            SubscriptionStatus::Starting,
            SubscriptionStatus::Started,
            SubscriptionStatus::Completed,
        ] {
            assert_eq!(SubscriptionStatus::parse(status.as_str()), Some(status));
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                json!(status.as_str())
            );
        }
        assert_eq!(SubscriptionStatus::parse("paused"), None);
    }

    #[test]
    fn listener_state_encodes_any_serializable_value() {
        let state = ListenerState::encode(&vec![1, 2, 3]).unwrap();
        assert_eq!(state.as_value(), &json!([1, 2, 3]));
        assert_eq!(state.decode::<Vec<u32>>().unwrap(), vec![1, 2, 3]);
        assert!(state.decode::<String>().is_err());
    }
}
