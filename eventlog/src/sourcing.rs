//! Event-sourced objects.
//!
//! An event-sourced object embeds a [`Sourcing`] helper that tracks its
//! identity, the version it has reached, and the events it produced but has
//! not committed yet. The [`EventSourced`] trait supplies the shared
//! behaviour (apply, replay, load) on top of a [`Handlers`] table.
//!
//! ```rust
//! use std::sync::OnceLock;
//! use eventlog::dispatch::Handlers;
//! use eventlog::event::Event;
//! use eventlog::sourcing::{EventSourced, Sourcing};
//! use eventlog::types::{EventName, Id, ProducerType};
//!
//! #[derive(Debug)]
//! struct Renamed(String);
//! impl Event for Renamed {
//!     fn name(&self) -> EventName { EventName::from("renamed") }
//! }
//!
//! struct Profile { sourcing: Sourcing, name: String }
//!
//! impl EventSourced for Profile {
//!     fn handlers() -> &'static Handlers<Self> {
//!         static HANDLERS: OnceLock<Handlers<Profile>> = OnceLock::new();
//!         HANDLERS.get_or_init(|| {
//!             Handlers::new().on(|p: &mut Profile, e: &Renamed| p.name.clone_from(&e.0))
//!         })
//!     }
//!     fn sourcing(&self) -> &Sourcing { &self.sourcing }
//!     fn sourcing_mut(&mut self) -> &mut Sourcing { &mut self.sourcing }
//! }
//!
//! let mut profile = Profile {
//!     sourcing: Sourcing::new(ProducerType::try_new("profile").unwrap(), Id::try_new("p-1").unwrap()),
//!     name: String::new(),
//! };
//! profile.apply_event(Renamed("ada".into())).unwrap();
//! assert_eq!(profile.name, "ada");
//! assert_eq!(profile.sourcing().pending().len(), 1);
//! ```

use crate::dispatch::{ApplyMode, Handlers};
use crate::envelope::Envelope;
use crate::errors::{DispatchError, DispatchResult, ReplayError};
use crate::event::Event;
use crate::store::{EventFilter, EventStore};
use crate::stream::Stream;
use crate::types::{EventId, Id, ProducerType, ProducerVersion};
use std::collections::HashSet;

/// Shared state of every event-sourced object.
#[derive(Debug, Clone)]
pub struct Sourcing {
    producer_type: ProducerType,
    producer_id: Id,
    version: Option<ProducerVersion>,
    committed_version: Option<ProducerVersion>,
    pending: Vec<Envelope>,
    last_replayed: Option<Envelope>,
    last_event: Option<Envelope>,
}

impl Sourcing {
    /// Fresh state for a producer with no history.
    pub const fn new(producer_type: ProducerType, producer_id: Id) -> Self {
        Self {
            producer_type,
            producer_id,
            version: None,
            committed_version: None,
            pending: Vec::new(),
            last_replayed: None,
            last_event: None,
        }
    }

    /// Kind of producer.
    pub const fn producer_type(&self) -> &ProducerType {
        &self.producer_type
    }

    /// Producer identity.
    pub const fn producer_id(&self) -> &Id {
        &self.producer_id
    }

    /// Latest version applied, pending events included.
    pub const fn version(&self) -> Option<ProducerVersion> {
        self.version
    }

    /// Latest version known to be in the store.
    pub const fn committed_version(&self) -> Option<ProducerVersion> {
        self.committed_version
    }

    /// Version the next produced event gets.
    pub fn next_version(&self) -> ProducerVersion {
        self.version.map_or_else(ProducerVersion::first, ProducerVersion::next)
    }

    /// Events produced but not committed yet.
    pub fn pending(&self) -> &[Envelope] {
        &self.pending
    }

    /// Returns true when there are uncommitted events.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// The last envelope applied in replay mode.
    pub const fn last_replayed(&self) -> Option<&Envelope> {
        self.last_replayed.as_ref()
    }

    /// The last envelope applied in live mode.
    pub const fn last_event(&self) -> Option<&Envelope> {
        self.last_event.as_ref()
    }

    /// Returns true if `envelope` was emitted by this producer.
    pub fn owns(&self, envelope: &Envelope) -> bool {
        envelope.is_from(&self.producer_type, &self.producer_id)
    }

    fn record(&mut self, envelope: &Envelope, mode: ApplyMode) {
        if let Some(version) = envelope.version() {
            self.version = Some(self.version.map_or(version, |current| current.max(version)));
        }
        match mode {
            ApplyMode::Replay => {
                self.committed_version = self.version;
                self.last_replayed = Some(envelope.clone());
            }
            ApplyMode::LiveApply => {
                self.pending.push(envelope.clone());
                self.last_event = Some(envelope.clone());
            }
        }
    }

    /// Drops the pending envelopes that the store accepted.
    pub fn mark_committed(&mut self, committed: &[Envelope]) {
        let ids: HashSet<EventId> = committed.iter().map(Envelope::id).collect();
        self.pending.retain(|envelope| !ids.contains(&envelope.id()));

        let committed_version = committed
            .iter()
            .filter(|envelope| self.owns(envelope))
            .filter_map(Envelope::version)
            .max();
        if let Some(version) = committed_version {
            self.committed_version = Some(
                self.committed_version
                    .map_or(version, |current| current.max(version)),
            );
        }

        if let Some(last) = self.last_event.as_ref() {
            if let Some(stored) = committed.iter().find(|envelope| envelope.id() == last.id()) {
                self.last_event = Some(stored.clone());
            }
        }
    }

    /// Discards uncommitted events and rewinds to the committed version.
    pub fn discard_pending(&mut self) {
        self.pending.clear();
        self.version = self.committed_version;
    }
}

/// An object rebuilt from, and producing, events.
pub trait EventSourced: Sized + Send + 'static {
    /// The handler table for this type.
    fn handlers() -> &'static Handlers<Self>;

    /// The embedded sourcing state.
    fn sourcing(&self) -> &Sourcing;

    /// The embedded sourcing state, mutably.
    fn sourcing_mut(&mut self) -> &mut Sourcing;

    /// Applies one envelope in the given mode.
    ///
    /// Fails with [`DispatchError::EventAndConsumerMismatch`] if the envelope
    /// belongs to another producer.
    fn apply(&mut self, envelope: &Envelope, mode: ApplyMode) -> DispatchResult<()> {
        let sourcing = self.sourcing();
        if !sourcing.owns(envelope) {
            return Err(DispatchError::EventAndConsumerMismatch {
                event: envelope.id(),
                producer: envelope.producer_id().clone(),
                consumer: sourcing.producer_id().clone(),
            });
        }
        Self::handlers().dispatch(self, envelope.event())?;
        self.sourcing_mut().record(envelope, mode);
        Ok(())
    }

    /// Produces a new event at the next version and applies it live.
    fn apply_event<E: Event>(&mut self, event: E) -> DispatchResult<Envelope> {
        let sourcing = self.sourcing();
        let envelope = Envelope::versioned(
            sourcing.producer_type().clone(),
            sourcing.producer_id().clone(),
            sourcing.next_version(),
            event,
        );
        self.apply(&envelope, ApplyMode::LiveApply)?;
        Ok(envelope)
    }

    /// Replays every envelope of `stream`. Returns how many were applied.
    fn replay(&mut self, stream: &Stream<'_>) -> Result<usize, ReplayError> {
        let mut applied = 0;
        for envelope in stream {
            self.apply(&envelope?, ApplyMode::Replay)?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Replays this producer's own history from `store`.
    fn load_history(&mut self, store: &dyn EventStore) -> Result<usize, ReplayError> {
        let sourcing = self.sourcing();
        let producer_type = sourcing.producer_type().clone();
        let stream = Stream::new(store, EventFilter::producer(sourcing.producer_id().clone()));

        let mut applied = 0;
        for envelope in &stream {
            let envelope = envelope?;
            // ids are only unique per producer type
            if envelope.producer_type() != &producer_type {
                continue;
            }
            self.apply(&envelope, ApplyMode::Replay)?;
            applied += 1;
        }
        Ok(applied)
    }
}

/// Object-safe view of anything that buffers events for commit.
pub trait EventProducer: Send {
    /// Kind of producer.
    fn producer_type(&self) -> &ProducerType;

    /// Producer identity.
    fn producer_id(&self) -> &Id;

    /// Events waiting to be appended.
    fn pending(&self) -> &[Envelope];

    /// Called with the committed envelopes after a successful append.
    fn mark_committed(&mut self, committed: &[Envelope]);
}

impl<T: EventSourced> EventProducer for T {
    fn producer_type(&self) -> &ProducerType {
        self.sourcing().producer_type()
    }

    fn producer_id(&self) -> &Id {
        self.sourcing().producer_id()
    }

    fn pending(&self) -> &[Envelope] {
        self.sourcing().pending()
    }

    fn mark_committed(&mut self, committed: &[Envelope]) {
        self.sourcing_mut().mark_committed(committed);
    }
}

/// Builds an object with `create` and replays its history from `store`.
pub fn load<T, F>(store: &dyn EventStore, create: F) -> Result<T, ReplayError>
where
    T: EventSourced,
    F: FnOnce() -> T,
{
    let mut object = create();
    object.load_history(store)?;
    Ok(object)
}
