//! Property test generators for domain types.
//!
//! Each generator respects the validation rules of its type.

use crate::envelope::Attributes;
use crate::types::{EventId, EventName, Id, ProducerType, ProducerVersion, Timestamp};
use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use serde_json::Value;

/// Generates valid producer and listener ids.
pub fn arb_id() -> impl Strategy<Value = Id> {
    "[a-zA-Z0-9][a-zA-Z0-9._-]{0,63}".prop_filter_map("Invalid Id", |s| Id::try_new(s).ok())
}

/// Generates valid producer types, dotted like `billing.invoice`.
pub fn arb_producer_type() -> impl Strategy<Value = ProducerType> {
    "[a-z]{1,12}(\\.[a-z]{1,12}){0,2}"
        .prop_filter_map("Invalid ProducerType", |s| ProducerType::try_new(s).ok())
}

/// Generates event names.
pub fn arb_event_name() -> impl Strategy<Value = EventName> {
    "[a-z]{1,16}(\\.[a-z]{1,16})?".prop_map(EventName::from)
}

/// Generates fresh event ids.
pub fn arb_event_id() -> impl Strategy<Value = EventId> {
    any::<()>().prop_map(|()| EventId::new())
}

/// Generates small producer versions.
pub fn arb_producer_version() -> impl Strategy<Value = ProducerVersion> {
    (1u64..=1000).prop_filter_map("Invalid ProducerVersion", |v| ProducerVersion::try_new(v).ok())
}

/// Generates timestamps up to the year 9999.
pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
    (0i64..=253_402_300_799i64).prop_filter_map("Invalid timestamp", |secs| {
        Utc.timestamp_opt(secs, 0).single().map(Timestamp::new)
    })
}

/// Generates attribute maps with scalar values.
pub fn arb_attributes() -> impl Strategy<Value = Attributes> {
    let value = prop_oneof![
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[a-z0-9 ]{0,16}".prop_map(Value::from),
    ];
    prop::collection::btree_map("[a-z_]{1,12}", value, 0..5)
        .prop_map(|entries| entries.into_iter().collect())
}
