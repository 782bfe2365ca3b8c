//! Core value types for the event log.
//!
//! All identifiers use smart constructors so that an invalid value can never
//! be constructed. Once a `ProducerType` or `Id` exists it is valid everywhere
//! it flows, from the store down to the subscription records.

use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// A globally unique envelope identifier using UUIDv7 format.
///
/// UUIDv7 keeps ids roughly time ordered, which makes them friendly to
/// B-tree indexes in persistent backends.
#[nutype(
    validate(predicate = |id: &Uuid| id.get_version() == Some(uuid::Version::SortRand)),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new `EventId` with the current timestamp.
    pub fn new() -> Self {
        // Uuid::now_v7() always yields a version 7 UUID
        Self::try_new(Uuid::now_v7()).expect("Uuid::now_v7() should always return a valid v7 UUID")
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

/// Opaque identifier of an event producer or a listener.
///
/// Equality is by value. `Display` renders the string form and `FromStr`
/// parses it back, so ids survive a round trip through any storage column.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct Id(String);

impl FromStr for Id {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_new(s)
    }
}

/// The kind of object that produced an event, e.g. `"bank.account"`.
///
/// Streams can be narrowed by producer-type prefix, so dotted names group
/// naturally: the prefix `"bank."` selects every banking producer.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct ProducerType(String);

impl ProducerType {
    /// Returns true if this producer type starts with `prefix`.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.as_ref().starts_with(prefix)
    }
}

impl FromStr for ProducerType {
    type Err = ProducerTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_new(s)
    }
}

/// Stable name of an event type, stored alongside each envelope.
#[nutype(
    sanitize(trim),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct EventName(String);

impl From<&str> for EventName {
    fn from(name: &str) -> Self {
        Self::new(name.to_owned())
    }
}

impl From<String> for EventName {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

/// The version of an event within its producer's own history.
///
/// Versions start at 1 and grow by one per event. The pair
/// (producer, version) is unique in the store, which is what turns a
/// duplicate version into a detected concurrent write.
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct ProducerVersion(u64);

impl ProducerVersion {
    /// The version of a producer's first event.
    pub fn first() -> Self {
        Self::try_new(1).expect("1 is always a valid version")
    }

    /// Returns the version following this one.
    #[must_use]
    pub fn next(self) -> Self {
        Self::try_new(self.into_inner() + 1).expect("next version should always be valid")
    }
}

/// Global position of an envelope in the log, assigned by the store.
///
/// Sequences are strictly increasing in append order. Backends may leave
/// gaps (e.g. after a rolled back append) but never reorder.
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct Sequence(u64);

impl Sequence {
    /// The first sequence a store hands out.
    pub fn first() -> Self {
        Self::try_new(1).expect("1 is always a valid sequence")
    }

    /// Returns the following sequence.
    #[must_use]
    pub fn next(self) -> Self {
        Self::try_new(self.into_inner() + 1).expect("next sequence should always be valid")
    }

    /// Returns the preceding sequence, or `None` for the first one.
    pub fn previous(self) -> Option<Self> {
        self.into_inner()
            .checked_sub(1)
            .and_then(|value| Self::try_new(value).ok())
    }
}

/// A point in time, always in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a timestamp from a UTC `DateTime`.
    pub const fn new(datetime: DateTime<Utc>) -> Self {
        Self(datetime)
    }

    /// Creates a timestamp representing the current moment.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Returns the underlying `DateTime`.
    pub const fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Converts the timestamp into the underlying `DateTime`.
    pub const fn into_datetime(self) -> DateTime<Utc> {
        self.0
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(datetime: DateTime<Utc>) -> Self {
        Self::new(datetime)
    }
}

impl From<Timestamp> for DateTime<Utc> {
    fn from(timestamp: Timestamp) -> Self {
        timestamp.into_datetime()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
