//! Fixtures shared by the integration tests.
//!
//! A small banking domain (accounts that produce [`Opened`], [`Deposited`]
//! and [`Withdrawn`]), position markers for shaping the log, and a
//! [`ScriptedListener`] whose answers and capabilities are chosen per test.

#![allow(clippy::missing_panics_doc)]

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, OnceLock};

use eventlog::dispatch::Handlers;
use eventlog::errors::{DispatchResult, EventStoreResult, ListenerError};
use eventlog::event::Event;
use eventlog::sourcing::{EventSourced, Sourcing};
use eventlog::store::{EventFilter, EventStore};
use eventlog::stream::Stream;
use eventlog::subscription::{
    Completable, Filterer, Listener, ListenerState, Picker, Resettable, Stateful, Subscription,
};
use eventlog::testing::FixedClock;
use eventlog::types::{EventName, Id, ProducerType};
use eventlog::Envelope;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;

/// Producer type of every [`Account`].
pub const ACCOUNT: &str = "account";

/// Producer type of position markers.
pub const MARKER: &str = "marker";

/// Parses a fixture id.
pub fn id(value: &str) -> Id {
    Id::try_new(value).expect("fixture ids are valid")
}

/// The account producer type.
pub fn account_type() -> ProducerType {
    ProducerType::try_new(ACCOUNT).expect("fixture producer types are valid")
}

/// An account was opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opened {
    /// Account holder
    pub owner: String,
}

impl Event for Opened {
    fn name(&self) -> EventName {
        EventName::from("account.opened")
    }
}

/// Money was paid in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deposited {
    /// Amount in cents
    pub amount: i64,
}

impl Event for Deposited {
    fn name(&self) -> EventName {
        EventName::from("account.deposited")
    }
}

/// Money was taken out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Withdrawn {
    /// Amount in cents
    pub amount: i64,
}

impl Event for Withdrawn {
    fn name(&self) -> EventName {
        EventName::from("account.withdrawn")
    }
}

/// An event whose name is its label. Used to lay out the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Marker(pub &'static str);

impl Event for Marker {
    fn name(&self) -> EventName {
        EventName::from(self.0)
    }
}

/// An unversioned marker envelope.
pub fn marker(label: &'static str) -> Envelope {
    Envelope::new(
        ProducerType::try_new(MARKER).expect("fixture producer types are valid"),
        id("markers"),
        Marker(label),
    )
}

/// Appends one marker per label, each in its own batch.
pub fn append_markers(store: &dyn EventStore, labels: &[&'static str]) -> Vec<Envelope> {
    labels
        .iter()
        .map(|label| {
            store
                .add(vec![marker(label)])
                .expect("markers never conflict")
                .remove(0)
        })
        .collect()
}

/// Labels of the marker envelopes in `envelopes`, in order.
pub fn labels(envelopes: &[Envelope]) -> Vec<&'static str> {
    envelopes
        .iter()
        .filter_map(|envelope| envelope.downcast_ref::<Marker>().map(|marker| marker.0))
        .collect()
}

/// A bank account rebuilt from its events.
#[derive(Debug)]
pub struct Account {
    sourcing: Sourcing,
    owner: Option<String>,
    balance: i64,
}

impl Account {
    /// An account with no history.
    pub fn new(account_id: &str) -> Self {
        Self {
            sourcing: Sourcing::new(account_type(), id(account_id)),
            owner: None,
            balance: 0,
        }
    }

    /// A new account with a pending `Opened` event.
    pub fn open(account_id: &str, owner: &str) -> DispatchResult<Self> {
        let mut account = Self::new(account_id);
        account.apply_event(Opened {
            owner: owner.to_owned(),
        })?;
        Ok(account)
    }

    /// Records a deposit.
    pub fn deposit(&mut self, amount: i64) -> DispatchResult<Envelope> {
        self.apply_event(Deposited { amount })
    }

    /// Records a withdrawal.
    pub fn withdraw(&mut self, amount: i64) -> DispatchResult<Envelope> {
        self.apply_event(Withdrawn { amount })
    }

    /// The account holder, once opened.
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// Current balance.
    pub const fn balance(&self) -> i64 {
        self.balance
    }
}

impl EventSourced for Account {
    fn handlers() -> &'static Handlers<Self> {
        static HANDLERS: OnceLock<Handlers<Account>> = OnceLock::new();
        HANDLERS.get_or_init(|| {
            Handlers::new()
                .on(|account: &mut Account, event: &Opened| {
                    account.owner = Some(event.owner.clone());
                })
                .on(|account: &mut Account, event: &Deposited| account.balance += event.amount)
                .on(|account: &mut Account, event: &Withdrawn| account.balance -= event.amount)
        })
    }

    fn sourcing(&self) -> &Sourcing {
        &self.sourcing
    }

    fn sourcing_mut(&mut self) -> &mut Sourcing {
        &mut self.sourcing
    }
}

/// Where a picking listener starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pick {
    /// At the beginning of the log.
    Beginning,
    /// At the envelope right before the trigger.
    Previous,
}

/// What a [`ScriptedListener`] observed. Shared with the test so it stays
/// readable after the listener moved into a subscription.
#[derive(Debug, Default)]
pub struct Probe {
    /// Every envelope handed to `on`, accepted or not
    pub delivered: Vec<Envelope>,
    /// Envelopes accepted since the last reset
    pub tally: u64,
    /// How often the listener was reset
    pub resets: usize,
}

/// Shared handle on a [`Probe`].
pub type ProbeHandle = Arc<Mutex<Probe>>;

#[derive(Debug, Deserialize)]
struct TallyState {
    tally: u64,
}

/// A listener whose answers and capabilities are configured by the test.
///
/// Answers are consumed in order; once they run out the listener answers
/// `fallback`.
#[derive(Debug)]
pub struct ScriptedListener {
    id: Id,
    answers: VecDeque<bool>,
    fallback: bool,
    probe: ProbeHandle,
    complete_after: Option<usize>,
    resettable: bool,
    stateful: bool,
    names: Option<BTreeSet<EventName>>,
    pick: Option<Pick>,
    fail_on: Option<EventName>,
}

impl ScriptedListener {
    /// A listener that accepts everything.
    pub fn new(listener_id: &str) -> Self {
        Self {
            id: id(listener_id),
            answers: VecDeque::new(),
            fallback: true,
            probe: ProbeHandle::default(),
            complete_after: None,
            resettable: false,
            stateful: false,
            names: None,
            pick: None,
            fail_on: None,
        }
    }

    /// Answers `answers` in order, then `true`.
    #[must_use]
    pub fn answering(mut self, answers: impl IntoIterator<Item = bool>) -> Self {
        self.answers = answers.into_iter().collect();
        self
    }

    /// Answers `fallback` once the scripted answers run out.
    #[must_use]
    pub const fn otherwise(mut self, fallback: bool) -> Self {
        self.fallback = fallback;
        self
    }

    /// Reports completion once `count` envelopes were delivered.
    #[must_use]
    pub const fn completing_after(mut self, count: usize) -> Self {
        self.complete_after = Some(count);
        self
    }

    /// Supports reset.
    #[must_use]
    pub const fn resettable(mut self) -> Self {
        self.resettable = true;
        self
    }

    /// Persists its tally with the subscription.
    #[must_use]
    pub const fn stateful(mut self) -> Self {
        self.stateful = true;
        self
    }

    /// Only receives envelopes with these names.
    #[must_use]
    pub fn only(mut self, names: &[&str]) -> Self {
        self.names = Some(names.iter().map(|name| EventName::from(*name)).collect());
        self
    }

    /// Chooses its own start anchor.
    #[must_use]
    pub const fn picking(mut self, pick: Pick) -> Self {
        self.pick = Some(pick);
        self
    }

    /// Fails when handed an envelope with this name.
    #[must_use]
    pub fn failing_on(mut self, name: &str) -> Self {
        self.fail_on = Some(EventName::from(name));
        self
    }

    /// The shared probe.
    pub fn probe(&self) -> ProbeHandle {
        Arc::clone(&self.probe)
    }

    /// Wraps the listener in a subscription driven by a fixed clock.
    pub fn subscribe(self) -> (Subscription, ProbeHandle) {
        let probe = self.probe();
        let subscription = Subscription::new(Box::new(self), Arc::new(FixedClock::epoch()));
        (subscription, probe)
    }
}

impl Listener for ScriptedListener {
    fn id(&self) -> &Id {
        &self.id
    }

    fn on(&mut self, envelope: &Envelope) -> Result<bool, ListenerError> {
        if self.fail_on.as_ref() == Some(envelope.name()) {
            return Err(format!("cannot handle {}", envelope.name()).into());
        }
        let accepted = self.answers.pop_front().unwrap_or(self.fallback);
        let mut probe = self.probe.lock();
        probe.delivered.push(envelope.clone());
        if accepted {
            probe.tally += 1;
        }
        Ok(accepted)
    }

    fn as_completable(&self) -> Option<&dyn Completable> {
        self.complete_after.map(|_| self as &dyn Completable)
    }

    fn as_resettable(&mut self) -> Option<&mut dyn Resettable> {
        if self.resettable {
            Some(self)
        } else {
            None
        }
    }

    fn as_picker(&self) -> Option<&dyn Picker> {
        self.pick.map(|_| self as &dyn Picker)
    }

    fn as_filterer(&self) -> Option<&dyn Filterer> {
        self.names.as_ref().map(|_| self as &dyn Filterer)
    }

    fn as_stateful(&self) -> Option<&dyn Stateful> {
        self.stateful.then_some(self as &dyn Stateful)
    }

    fn as_stateful_mut(&mut self) -> Option<&mut dyn Stateful> {
        if self.stateful {
            Some(self)
        } else {
            None
        }
    }
}

impl Completable for ScriptedListener {
    fn completed(&self) -> bool {
        self.complete_after
            .is_some_and(|count| self.probe.lock().delivered.len() >= count)
    }
}

impl Resettable for ScriptedListener {
    fn reset(&mut self) {
        let mut probe = self.probe.lock();
        probe.tally = 0;
        probe.resets += 1;
    }
}

impl Picker for ScriptedListener {
    fn pick(&self, store: &dyn EventStore, trigger: &Envelope) -> EventStoreResult<Option<Envelope>> {
        match self.pick {
            Some(Pick::Previous) => Stream::new(store, EventFilter::all())
                .before(trigger.id())
                .last(),
            Some(Pick::Beginning) | None => Ok(None),
        }
    }
}

impl Filterer for ScriptedListener {
    fn filter<'s>(&self, stream: Stream<'s>) -> Stream<'s> {
        match &self.names {
            Some(names) => stream.only(names.iter().cloned()),
            None => stream,
        }
    }
}

impl Stateful for ScriptedListener {
    fn to_state(&self) -> ListenerState {
        ListenerState::new(json!({ "tally": self.probe.lock().tally }))
    }

    fn from_state(&mut self, state: ListenerState) -> Result<(), ListenerError> {
        let TallyState { tally } = state.decode()?;
        self.probe.lock().tally = tally;
        Ok(())
    }
}
