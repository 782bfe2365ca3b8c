//! Routing events to handlers.
//!
//! A consumer type declares its handlers once, in a [`Handlers`] table,
//! usually kept in a `OnceLock`. Each entry accepts either one concrete event
//! type, a family of types chosen by a predicate, or every event. Dispatch
//! resolves exactly one entry per event:
//!
//! - no entry accepts the event: [`DispatchError::NoEventApplyingMethodFound`]
//! - more than one entry accepts it: [`DispatchError::TooManyEventApplyingMethodsFound`]
//!
//! Ambiguity is never settled by picking the most specific entry.
//!
//! ```rust
//! use std::sync::OnceLock;
//! use eventlog::dispatch::Handlers;
//! use eventlog::event::Event;
//! use eventlog::types::EventName;
//!
//! #[derive(Debug)]
//! struct Deposited(u64);
//! impl Event for Deposited {
//!     fn name(&self) -> EventName { EventName::from("deposited") }
//! }
//!
//! #[derive(Default)]
//! struct Balance(u64);
//!
//! fn handlers() -> &'static Handlers<Balance> {
//!     static HANDLERS: OnceLock<Handlers<Balance>> = OnceLock::new();
//!     HANDLERS.get_or_init(|| {
//!         Handlers::new().on(|balance: &mut Balance, event: &Deposited| balance.0 += event.0)
//!     })
//! }
//!
//! let mut balance = Balance::default();
//! handlers().dispatch(&mut balance, &Deposited(5)).unwrap();
//! assert_eq!(balance.0, 5);
//! ```

use crate::errors::{DispatchError, DispatchResult};
use crate::event::Event;

/// Whether an event is being re-applied from history or newly produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// A stored event rebuilding state. Never buffered again.
    Replay,
    /// A new event produced by a command. Buffered until committed.
    LiveApply,
}

type Matcher = Box<dyn Fn(&dyn Event) -> bool + Send + Sync>;
type Invoke<C, R> = Box<dyn Fn(&mut C, &dyn Event) -> Option<R> + Send + Sync>;

struct Entry<C, R> {
    label: &'static str,
    matches: Matcher,
    invoke: Invoke<C, R>,
}

/// Registration table mapping events to handlers on a consumer `C`.
///
/// `R` is what a handler returns: `()` for event-sourced objects, `bool`
/// (accepted or not) for listeners.
pub struct Handlers<C, R = ()> {
    consumer: &'static str,
    entries: Vec<Entry<C, R>>,
}

impl<C, R> std::fmt::Debug for Handlers<C, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handlers")
            .field("consumer", &self.consumer)
            .field(
                "entries",
                &self.entries.iter().map(|e| e.label).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl<C: 'static, R: 'static> Default for Handlers<C, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: 'static, R: 'static> Handlers<C, R> {
    /// An empty table for consumer `C`.
    pub fn new() -> Self {
        let full = std::any::type_name::<C>();
        Self {
            consumer: full.rsplit("::").next().unwrap_or(full),
            entries: Vec::new(),
        }
    }

    /// Registers a handler for the concrete event type `E`.
    #[must_use]
    pub fn on<E, F>(mut self, handler: F) -> Self
    where
        E: Event,
        F: Fn(&mut C, &E) -> R + Send + Sync + 'static,
    {
        self.entries.push(Entry {
            label: std::any::type_name::<E>(),
            matches: Box::new(|event: &dyn Event| event.is::<E>()),
            invoke: Box::new(move |consumer: &mut C, event: &dyn Event| {
                event.downcast_ref::<E>().map(|typed| handler(consumer, typed))
            }),
        });
        self
    }

    /// Registers a handler for every event accepted by `matches`.
    ///
    /// Used for families of event types that share a handler.
    #[must_use]
    pub fn on_matching<M, F>(mut self, label: &'static str, matches: M, handler: F) -> Self
    where
        M: Fn(&dyn Event) -> bool + Send + Sync + 'static,
        F: Fn(&mut C, &dyn Event) -> R + Send + Sync + 'static,
    {
        self.entries.push(Entry {
            label,
            matches: Box::new(matches),
            invoke: Box::new(move |consumer: &mut C, event: &dyn Event| {
                Some(handler(consumer, event))
            }),
        });
        self
    }

    /// Registers a handler that accepts every event.
    #[must_use]
    pub fn on_any<F>(self, handler: F) -> Self
    where
        F: Fn(&mut C, &dyn Event) -> R + Send + Sync + 'static,
    {
        self.on_matching("dyn Event", |_| true, handler)
    }

    /// Name of the consumer type used in errors.
    pub const fn consumer(&self) -> &'static str {
        self.consumer
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if exactly one handler accepts `event`.
    pub fn handles(&self, event: &dyn Event) -> bool {
        self.candidates(event).len() == 1
    }

    /// Invokes the single handler that accepts `event`.
    pub fn dispatch(&self, consumer: &mut C, event: &dyn Event) -> DispatchResult<R> {
        self.resolve(event)?
            .ok_or_else(|| self.not_found(event))
            .and_then(|entry| (entry.invoke)(consumer, event).ok_or_else(|| self.not_found(event)))
    }

    fn resolve(&self, event: &dyn Event) -> DispatchResult<Option<&Entry<C, R>>> {
        let candidates = self.candidates(event);
        match candidates.as_slice() {
            [] => Ok(None),
            [entry] => Ok(Some(*entry)),
            many => Err(DispatchError::TooManyEventApplyingMethodsFound {
                consumer: self.consumer,
                event: event.name(),
                candidates: many.len(),
            }),
        }
    }

    fn candidates(&self, event: &dyn Event) -> Vec<&Entry<C, R>> {
        self.entries
            .iter()
            .filter(|entry| (entry.matches)(event))
            .collect()
    }

    fn not_found(&self, event: &dyn Event) -> DispatchError {
        DispatchError::NoEventApplyingMethodFound {
            consumer: self.consumer,
            event: event.name(),
        }
    }
}

impl<C: 'static> Handlers<C, bool> {
    /// Listener dispatch: an event no handler accepts is ignored and reported
    /// as not accepted. Ambiguity is still an error.
    pub fn listen(&self, consumer: &mut C, event: &dyn Event) -> DispatchResult<bool> {
        match self.resolve(event)? {
            None => Ok(false),
            Some(entry) => Ok((entry.invoke)(consumer, event).unwrap_or(false)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventName;

    #[derive(Debug)]
    struct Opened;

    impl Event for Opened {
        fn name(&self) -> EventName {
            EventName::from("opened")
        }
    }

    #[derive(Debug)]
    struct Closed;

    impl Event for Closed {
        fn name(&self) -> EventName {
            EventName::from("closed")
        }
    }

    #[derive(Default)]
    struct Door {
        log: Vec<&'static str>,
    }

    #[test]
    fn the_single_matching_handler_runs() {
        let handlers = Handlers::<Door>::new()
            .on(|door: &mut Door, _: &Opened| door.log.push("opened"))
            .on(|door: &mut Door, _: &Closed| door.log.push("closed"));

        let mut door = Door::default();
        handlers.dispatch(&mut door, &Opened).unwrap();
        handlers.dispatch(&mut door, &Closed).unwrap();
        assert_eq!(door.log, ["opened", "closed"]);
    }

    #[test]
    fn missing_handlers_are_reported() {
        let handlers = Handlers::<Door>::new().on(|_: &mut Door, _: &Opened| ());

        let err = handlers.dispatch(&mut Door::default(), &Closed).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::NoEventApplyingMethodFound { consumer: "Door", ref event } if event.as_ref() == "closed"
        ));
    }

    #[test]
    fn a_base_type_handler_next_to_a_concrete_one_is_ambiguous() {
        let handlers = Handlers::<Door>::new()
            .on(|door: &mut Door, _: &Opened| door.log.push("opened"))
            .on_any(|door: &mut Door, _| door.log.push("any"));

        let mut door = Door::default();
        let err = handlers.dispatch(&mut door, &Opened).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::TooManyEventApplyingMethodsFound { candidates: 2, .. }
        ));
        assert!(door.log.is_empty());

        handlers.dispatch(&mut door, &Closed).unwrap();
        assert_eq!(door.log, ["any"]);
    }

    #[test]
    fn listeners_ignore_unhandled_events() {
        let handlers = Handlers::<Door, bool>::new().on(|_: &mut Door, _: &Opened| true);

        let mut door = Door::default();
        assert!(handlers.listen(&mut door, &Opened).unwrap());
        assert!(!handlers.listen(&mut door, &Closed).unwrap());
    }

    #[test]
    fn listeners_still_fail_on_ambiguity() {
        let handlers = Handlers::<Door, bool>::new()
            .on(|_: &mut Door, _: &Opened| true)
            .on_matching("door events", |e| e.is::<Opened>() || e.is::<Closed>(), |_, _| false);

        assert!(handlers.listen(&mut Door::default(), &Opened).is_err());
        assert!(!handlers.listen(&mut Door::default(), &Closed).unwrap());
        assert!(handlers.handles(&Closed));
        assert!(!handlers.handles(&Opened));
    }
}
