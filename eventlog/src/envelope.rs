//! The envelope that wraps every event in the log.
//!
//! An envelope carries one payload plus its metadata. The well-known fields
//! live in a fixed struct; anything else a listener wants to attach goes into
//! the typed [`Attributes`] map. Envelopes never change in place: each setter
//! returns a new envelope and leaves the receiver untouched.

use crate::event::Event;
use crate::types::{EventId, EventName, Id, ProducerType, ProducerVersion, Sequence, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Extension attributes attached to an envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes(BTreeMap<String, Value>);

impl Attributes {
    /// Creates an empty attribute map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the attribute stored under `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Returns true when no attributes are set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterates attributes in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    #[must_use]
    fn with(mut self, key: String, value: Value) -> Self {
        self.0.insert(key, value);
        self
    }
}

impl FromIterator<(String, Value)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// All the fields of an envelope, used to rebuild one read back from storage.
#[derive(Debug, Clone)]
pub struct EnvelopeParts {
    /// Globally unique id
    pub id: EventId,
    /// Name of the event type
    pub name: EventName,
    /// Kind of producer
    pub producer_type: ProducerType,
    /// Producer identity
    pub producer_id: Id,
    /// Version within the producer's history, if versioned
    pub version: Option<ProducerVersion>,
    /// Global position, once stored
    pub sequence: Option<Sequence>,
    /// When the store accepted the envelope
    pub appended_at: Option<Timestamp>,
    /// Extension attributes
    pub attributes: Attributes,
    /// The payload
    pub payload: Arc<dyn Event>,
}

/// An immutable event plus its metadata.
#[derive(Debug, Clone)]
pub struct Envelope {
    id: EventId,
    name: EventName,
    producer_type: ProducerType,
    producer_id: Id,
    version: Option<ProducerVersion>,
    sequence: Option<Sequence>,
    appended_at: Option<Timestamp>,
    attributes: Attributes,
    payload: Arc<dyn Event>,
}

impl Envelope {
    /// Wraps an unversioned event with a fresh id.
    pub fn new<E: Event>(producer_type: ProducerType, producer_id: Id, event: E) -> Self {
        Self::from_arc(producer_type, producer_id, None, Arc::new(event))
    }

    /// Wraps an event at a given producer version with a fresh id.
    pub fn versioned<E: Event>(
        producer_type: ProducerType,
        producer_id: Id,
        version: ProducerVersion,
        event: E,
    ) -> Self {
        Self::from_arc(producer_type, producer_id, Some(version), Arc::new(event))
    }

    /// Wraps a shared payload with a fresh id.
    pub fn from_arc(
        producer_type: ProducerType,
        producer_id: Id,
        version: Option<ProducerVersion>,
        payload: Arc<dyn Event>,
    ) -> Self {
        Self {
            id: EventId::new(),
            name: payload.name(),
            producer_type,
            producer_id,
            version,
            sequence: None,
            appended_at: None,
            attributes: Attributes::new(),
            payload,
        }
    }

    /// Rebuilds an envelope from its stored parts.
    pub fn from_parts(parts: EnvelopeParts) -> Self {
        Self {
            id: parts.id,
            name: parts.name,
            producer_type: parts.producer_type,
            producer_id: parts.producer_id,
            version: parts.version,
            sequence: parts.sequence,
            appended_at: parts.appended_at,
            attributes: parts.attributes,
            payload: parts.payload,
        }
    }

    /// Splits the envelope into its parts.
    pub fn into_parts(self) -> EnvelopeParts {
        EnvelopeParts {
            id: self.id,
            name: self.name,
            producer_type: self.producer_type,
            producer_id: self.producer_id,
            version: self.version,
            sequence: self.sequence,
            appended_at: self.appended_at,
            attributes: self.attributes,
            payload: self.payload,
        }
    }

    /// Globally unique id.
    pub const fn id(&self) -> EventId {
        self.id
    }

    /// Name of the event type.
    pub const fn name(&self) -> &EventName {
        &self.name
    }

    /// Kind of producer that emitted the event.
    pub const fn producer_type(&self) -> &ProducerType {
        &self.producer_type
    }

    /// Identity of the producer.
    pub const fn producer_id(&self) -> &Id {
        &self.producer_id
    }

    /// Version within the producer's history, if any.
    pub const fn version(&self) -> Option<ProducerVersion> {
        self.version
    }

    /// Global position assigned by the store. `None` until stored.
    pub const fn sequence(&self) -> Option<Sequence> {
        self.sequence
    }

    /// When the store accepted the envelope. `None` until stored.
    pub const fn appended_at(&self) -> Option<Timestamp> {
        self.appended_at
    }

    /// Extension attributes.
    pub const fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Shortcut for `attributes().get(key)`.
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// The event payload.
    pub fn event(&self) -> &dyn Event {
        self.payload.as_ref()
    }

    /// The shared payload handle.
    pub fn payload(&self) -> &Arc<dyn Event> {
        &self.payload
    }

    /// Returns the payload as `T` if it has that type.
    pub fn downcast_ref<T: Event>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    /// Returns true if the envelope was emitted by this producer.
    pub fn is_from(&self, producer_type: &ProducerType, producer_id: &Id) -> bool {
        &self.producer_type == producer_type && &self.producer_id == producer_id
    }

    /// Returns a copy with an extension attribute set.
    #[must_use]
    pub fn with_attribute(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut copy = self.clone();
        copy.attributes = copy.attributes.with(key.into(), value.into());
        copy
    }

    /// Returns a copy at the given producer version.
    #[must_use]
    pub fn with_version(&self, version: ProducerVersion) -> Self {
        Self {
            version: Some(version),
            ..self.clone()
        }
    }

    /// Returns a copy carrying its store position.
    #[must_use]
    pub fn with_sequence(&self, sequence: Sequence) -> Self {
        Self {
            sequence: Some(sequence),
            ..self.clone()
        }
    }

    /// Returns a copy stamped with its append time.
    #[must_use]
    pub fn with_appended_at(&self, appended_at: Timestamp) -> Self {
        Self {
            appended_at: Some(appended_at),
            ..self.clone()
        }
    }
}
