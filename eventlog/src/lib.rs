//! Append-only event log with optimistic concurrency.
//!
//! Producers record facts as events. Each event travels in an [`Envelope`]
//! stamped with its producer, the producer's version and, once stored, a
//! global sequence. On top of the [`EventStore`] port this crate provides:
//!
//! - lazy, refinable [`Stream`]s over the log
//! - handler tables that route events to exactly one method ([`Handlers`])
//! - rebuilding objects from their history ([`EventSourced`])
//! - catch-up [`Subscription`]s with optional exactly-once delivery
//! - a [`UnitOfWork`] that flushes dirty producers and subscriptions
//! - a [`PublishingEventStore`] that forwards stored envelopes to a bus
//!
//! Storage backends live in separate crates (`eventlog-memory`,
//! `eventlog-postgres`).
//!
//! # Example
//!
//! ```rust,ignore
//! use eventlog::prelude::*;
//!
//! let mut account = Account::open(id);
//! account.apply_event(Deposited { amount: 10 })?;
//!
//! let mut unit = EventStoreUnitOfWork::new(store.clone());
//! unit.add(Tracked::producer(Arc::new(Mutex::new(account))))?;
//! unit.commit()?;
//!
//! for envelope in store.stream(EventFilter::all()).only(["account.deposited".into()]) {
//!     println!("{}", envelope?.id());
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

pub mod clock;
pub mod config;
pub mod converter;
pub mod dispatch;
pub mod envelope;
pub mod errors;
pub mod event;
pub mod retry;
pub mod sourcing;
pub mod store;
pub mod stream;
pub mod subscription;
pub mod types;
pub mod unit_of_work;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use clock::{Clock, SystemClock};
pub use config::{RetryConfig, StreamConfig, TransactionalConfig};
pub use converter::{Converter, JsonConverter};
pub use dispatch::{ApplyMode, Handlers};
pub use envelope::{Attributes, Envelope, EnvelopeParts};
pub use errors::{
    ConversionError, DispatchError, EventStoreError, ListenerError, ReplayError,
    SubscriptionError, UnitOfWorkError,
};
pub use event::Event;
pub use retry::{retry, RetryPolicy};
pub use sourcing::{load, EventProducer, EventSourced, Sourcing};
pub use store::{
    Bus, EventFilter, EventStore, NameFilter, Order, PublishingEventStore, StreamQuery,
    Transactional,
};
pub use stream::{Stream, StreamIter};
pub use subscription::{
    Completable, Filterer, Listener, ListenerFactory, ListenerState, Picker, Resettable,
    Stateful, Subscription, SubscriptionCursor, SubscriptionDao, SubscriptionRecord,
    SubscriptionRepository, SubscriptionStatus, TransactionalCursor,
};
pub use types::{EventId, EventName, Id, ProducerType, ProducerVersion, Sequence, Timestamp};
pub use unit_of_work::{
    CompositeUnitOfWork, EventStoreUnitOfWork, SubscriptionUnitOfWork, Tracked, UnitOfWork,
};

/// Everything needed to define producers and listeners and drive them.
pub mod prelude {
    pub use crate::dispatch::{ApplyMode, Handlers};
    pub use crate::envelope::Envelope;
    pub use crate::errors::{
        DispatchError, DispatchResult, EventStoreError, EventStoreResult, ListenerError,
        SubscriptionError, SubscriptionResult, UnitOfWorkError, UnitOfWorkResult,
    };
    pub use crate::event::Event;
    pub use crate::sourcing::{EventSourced, Sourcing};
    pub use crate::store::{EventFilter, EventStore, Transactional};
    pub use crate::stream::Stream;
    pub use crate::subscription::{Listener, Subscription, SubscriptionDao};
    pub use crate::types::{EventId, EventName, Id, ProducerType};
    pub use crate::unit_of_work::{Tracked, UnitOfWork};
}
