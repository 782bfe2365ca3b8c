//! The event payload trait.
//!
//! Payloads are plain Rust types. The log stores them behind `Arc<dyn Event>`
//! so that one store can hold every event type of an application, and
//! handlers recover the concrete type with [`downcast_ref`](trait.Event.html#method.downcast_ref).

use crate::types::EventName;
use std::any::Any;
use std::fmt::Debug;

/// A domain event payload.
///
/// ```rust
/// use eventlog::event::Event;
/// use eventlog::types::EventName;
///
/// #[derive(Debug)]
/// struct AccountOpened {
///     owner: String,
/// }
///
/// impl Event for AccountOpened {
///     fn name(&self) -> EventName {
///         EventName::from("account.opened")
///     }
/// }
///
/// let event: &dyn Event = &AccountOpened { owner: "ada".into() };
/// assert!(event.is::<AccountOpened>());
/// assert_eq!(event.downcast_ref::<AccountOpened>().unwrap().owner, "ada");
/// ```
pub trait Event: Any + Debug + Send + Sync {
    /// Stable name of this event type, stored with every envelope.
    fn name(&self) -> EventName;
}

impl dyn Event {
    /// Returns true if the payload is of type `T`.
    pub fn is<T: Event>(&self) -> bool {
        (self as &dyn Any).is::<T>()
    }

    /// Returns the payload as `T` if it has that type.
    pub fn downcast_ref<T: Event>(&self) -> Option<&T> {
        (self as &dyn Any).downcast_ref::<T>()
    }
}
