//! Conversion of event payloads to and from a portable representation.
//!
//! Persistent backends store payloads as JSON. The [`JsonConverter`] keeps a
//! registry from event names to serde functions so that a row read back from
//! storage can be turned into the right Rust type without knowing it at
//! compile time.

use crate::errors::ConversionError;
use crate::event::Event;
use crate::types::EventName;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Converts payloads to and from a portable representation.
pub trait Converter: Send + Sync {
    /// Serializes a payload.
    fn to_portable(&self, event: &dyn Event) -> Result<Value, ConversionError>;

    /// Deserializes a payload stored under `name`.
    fn from_portable(&self, name: &EventName, body: Value) -> Result<Arc<dyn Event>, ConversionError>;
}

type SerializeFn = fn(&dyn Event) -> Result<Value, ConversionError>;
type DeserializeFn = fn(&EventName, Value) -> Result<Arc<dyn Event>, ConversionError>;

/// Registry metadata for one event type.
#[derive(Clone, Copy)]
struct TypeInfo {
    type_id: TypeId,
    type_name: &'static str,
    serialize: SerializeFn,
    deserialize: DeserializeFn,
}

impl std::fmt::Debug for TypeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeInfo")
            .field("type_name", &self.type_name)
            .field("serialize", &"<function>")
            .field("deserialize", &"<function>")
            .finish()
    }
}

/// A [`Converter`] backed by `serde_json` and an explicit type registry.
///
/// ```rust
/// use eventlog::converter::{Converter, JsonConverter};
/// use eventlog::event::Event;
/// use eventlog::types::EventName;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize, PartialEq)]
/// struct Renamed { to: String }
///
/// impl Event for Renamed {
///     fn name(&self) -> EventName { EventName::from("renamed") }
/// }
///
/// let mut converter = JsonConverter::new();
/// converter.register::<Renamed>("renamed").unwrap();
///
/// let body = converter.to_portable(&Renamed { to: "b".into() }).unwrap();
/// let back = converter.from_portable(&EventName::from("renamed"), body).unwrap();
/// assert_eq!(back.downcast_ref::<Renamed>(), Some(&Renamed { to: "b".into() }));
/// ```
#[derive(Debug, Default, Clone)]
pub struct JsonConverter {
    by_name: HashMap<EventName, TypeInfo>,
    by_type: HashMap<TypeId, EventName>,
}

impl JsonConverter {
    /// Creates an empty converter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `E` under `name`.
    ///
    /// Registering the same type under the same name twice is a no-op.
    /// Reusing a name for a different type fails with
    /// [`ConversionError::NameConflict`].
    pub fn register<E>(&mut self, name: impl Into<EventName>) -> Result<&mut Self, ConversionError>
    where
        E: Event + Serialize + DeserializeOwned,
    {
        let name = name.into();
        let type_id = TypeId::of::<E>();

        if let Some(existing) = self.by_name.get(&name) {
            if existing.type_id != type_id {
                return Err(ConversionError::NameConflict(name.into_inner()));
            }
        }

        self.by_name.insert(
            name.clone(),
            TypeInfo {
                type_id,
                type_name: std::any::type_name::<E>(),
                serialize: serialize_as::<E>,
                deserialize: deserialize_as::<E>,
            },
        );
        self.by_type.insert(type_id, name);
        Ok(self)
    }

    /// Returns true if a type is registered under `name`.
    pub fn is_registered(&self, name: &EventName) -> bool {
        self.by_name.contains_key(name)
    }

    /// All registered names, sorted.
    pub fn registered_names(&self) -> Vec<EventName> {
        let mut names: Vec<_> = self.by_name.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Converter for JsonConverter {
    fn to_portable(&self, event: &dyn Event) -> Result<Value, ConversionError> {
        let type_id = (event as &dyn Any).type_id();
        let info = self
            .by_type
            .get(&type_id)
            .and_then(|name| self.by_name.get(name))
            .ok_or_else(|| ConversionError::UnknownEventType(event.name().into_inner()))?;
        (info.serialize)(event)
    }

    fn from_portable(&self, name: &EventName, body: Value) -> Result<Arc<dyn Event>, ConversionError> {
        let info = self
            .by_name
            .get(name)
            .ok_or_else(|| ConversionError::UnknownEventType(name.to_string()))?;
        (info.deserialize)(name, body)
    }
}

fn serialize_as<E>(event: &dyn Event) -> Result<Value, ConversionError>
where
    E: Event + Serialize,
{
    let typed = event
        .downcast_ref::<E>()
        .ok_or(ConversionError::UnregisteredType(std::any::type_name::<E>()))?;
    serde_json::to_value(typed).map_err(|source| ConversionError::Serialization {
        name: event.name().into_inner(),
        source,
    })
}

fn deserialize_as<E>(name: &EventName, body: Value) -> Result<Arc<dyn Event>, ConversionError>
where
    E: Event + DeserializeOwned,
{
    let event: E = serde_json::from_value(body).map_err(|source| ConversionError::Deserialization {
        name: name.to_string(),
        source,
    })?;
    Ok(Arc::new(event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Credited {
        amount: u64,
    }

    impl Event for Credited {
        fn name(&self) -> EventName {
            EventName::from("credited")
        }
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Debited {
        amount: u64,
    }

    impl Event for Debited {
        fn name(&self) -> EventName {
            EventName::from("debited")
        }
    }

    #[test]
    fn registered_types_convert_both_ways() {
        let mut converter = JsonConverter::new();
        converter.register::<Credited>("credited").unwrap();

        let body = converter.to_portable(&Credited { amount: 5 }).unwrap();
        assert_eq!(body, json!({ "amount": 5 }));

        let event = converter
            .from_portable(&EventName::from("credited"), body)
            .unwrap();
        assert_eq!(event.downcast_ref::<Credited>(), Some(&Credited { amount: 5 }));
    }

    #[test]
    fn unknown_names_are_rejected() {
        let converter = JsonConverter::new();
        let err = converter
            .from_portable(&EventName::from("nope"), json!({}))
            .unwrap_err();
        assert!(matches!(err, ConversionError::UnknownEventType(name) if name == "nope"));

        let err = converter.to_portable(&Credited { amount: 1 }).unwrap_err();
        assert!(matches!(err, ConversionError::UnknownEventType(_)));
    }

    #[test]
    fn a_name_cannot_be_reused_for_another_type() {
        let mut converter = JsonConverter::new();
        converter.register::<Credited>("money").unwrap();
        converter.register::<Credited>("money").unwrap();

        let err = converter.register::<Debited>("money").unwrap_err();
        assert!(matches!(err, ConversionError::NameConflict(name) if name == "money"));
    }

    #[test]
    fn malformed_bodies_report_the_event_name() {
        let mut converter = JsonConverter::new();
        converter.register::<Debited>("debited").unwrap();

        let err = converter
            .from_portable(&EventName::from("debited"), json!({ "amount": "many" }))
            .unwrap_err();
        assert!(err.to_string().starts_with("Failed to deserialize 'debited'"));
    }

    #[test]
    fn registered_names_are_sorted() {
        let mut converter = JsonConverter::new();
        converter
            .register::<Debited>("debited")
            .unwrap()
            .register::<Credited>("credited")
            .unwrap();
        assert_eq!(
            converter.registered_names(),
            vec![EventName::from("credited"), EventName::from("debited")]
        );
    }
}
