//! Tests against a live database. They return early unless `DATABASE_URL`
//! is set.

use eventlog::converter::JsonConverter;
use eventlog::event::Event;
use eventlog::store::{EventFilter, EventStore, Transactional};
use eventlog::subscription::{SubscriptionDao, SubscriptionRecord, SubscriptionStatus};
use eventlog::types::{EventName, Id, ProducerType, ProducerVersion};
use eventlog::{Envelope, EventStoreError};
use eventlog_postgres::{PostgresConfig, PostgresEventStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing_test::traced_test;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Deposited {
    amount: i64,
}

impl Event for Deposited {
    fn name(&self) -> EventName {
        EventName::from("account.deposited")
    }
}

fn store() -> Option<PostgresEventStore> {
    let config = PostgresConfig::from_env().ok()?;
    let mut converter = JsonConverter::new();
    converter.register::<Deposited>("account.deposited").unwrap();

    let store = PostgresEventStore::connect(&config, Arc::new(converter)).unwrap();
    store.migrate().unwrap();
    Some(store)
}

fn unique(prefix: &str) -> Id {
    Id::try_new(format!("{prefix}-{}", Uuid::now_v7())).unwrap()
}

fn deposit(producer: &Id, version: u64, amount: i64) -> Envelope {
    Envelope::versioned(
        ProducerType::try_new("bank.account").unwrap(),
        producer.clone(),
        ProducerVersion::try_new(version).unwrap(),
        Deposited { amount },
    )
}

#[test]
fn appended_envelopes_read_back_with_their_payload() {
    let Some(store) = store() else { return };
    let account = unique("account");

    let committed = store
        .add(vec![deposit(&account, 1, 10), deposit(&account, 2, 20)])
        .unwrap();
    assert!(committed[0].sequence() < committed[1].sequence());

    let read = store.stream(EventFilter::producer(account)).to_vec().unwrap();
    let amounts: Vec<i64> = read
        .iter()
        .filter_map(|envelope| envelope.downcast_ref::<Deposited>())
        .map(|deposited| deposited.amount)
        .collect();
    assert_eq!(amounts, vec![10, 20]);

    let one = store.event(committed[1].id()).unwrap().unwrap();
    assert_eq!(one.sequence(), committed[1].sequence());
}

#[test]
#[traced_test]
fn conflicting_versions_leave_the_stream_unchanged() {
    let Some(store) = store() else { return };
    let account = unique("account");

    store
        .add(vec![deposit(&account, 1, 1), deposit(&account, 2, 2)])
        .unwrap();
    let before = store.stream(EventFilter::producer(account.clone())).to_vec().unwrap();

    let err = store
        .add(vec![deposit(&account, 3, 3), deposit(&account, 1, 4)])
        .unwrap_err();
    assert!(matches!(err, EventStoreError::ConcurrentWriteDetected(ref who) if *who == account));
    assert!(logs_contain("concurrent write detected"));

    let after = store.stream(EventFilter::producer(account)).to_vec().unwrap();
    let ids = |envelopes: &[Envelope]| envelopes.iter().map(Envelope::id).collect::<Vec<_>>();
    assert_eq!(ids(&before), ids(&after));
}

#[test]
fn duplicate_ids_are_rejected() {
    let Some(store) = store() else { return };
    let account = unique("account");

    let committed = store.add(vec![deposit(&account, 1, 1)]).unwrap();
    let again = committed[0].with_version(ProducerVersion::try_new(2).unwrap());
    assert!(store.add(vec![again]).unwrap_err().is_duplicate());
}

#[test]
fn rolled_back_transactions_store_nothing() {
    let Some(store) = store() else { return };
    let account = unique("account");

    store.begin().unwrap();
    store.add(vec![deposit(&account, 1, 1)]).unwrap();

    // A rejected batch inside the transaction leaves it usable.
    assert!(store.add(vec![deposit(&account, 1, 2)]).is_err());
    store.add(vec![deposit(&account, 2, 2)]).unwrap();
    assert_eq!(store.stream(EventFilter::producer(account.clone())).to_vec().unwrap().len(), 2);

    store.rollback().unwrap();
    assert!(!store.in_transaction());
    assert!(store.stream(EventFilter::producer(account)).first().unwrap().is_none());
}

#[test]
fn subscription_records_are_saved_optimistically() {
    let Some(store) = store() else { return };
    let id = unique("projector");
    let record = |version| SubscriptionRecord {
        id: id.clone(),
        version,
        status: SubscriptionStatus::Started,
        paused: false,
        started_by: None,
        started_at: None,
        last_processed: None,
        last_processed_at: None,
        state: None,
    };

    store.save(&record(2), 0).unwrap();
    assert!(store.save(&record(3), 0).unwrap_err().is_retryable());
    assert!(store.save(&record(3), 7).unwrap_err().is_retryable());
    store.save(&record(3), 2).unwrap();

    assert_eq!(store.one(&id).unwrap(), Some(record(3)));
    assert!(store.delete(&id).unwrap());
    assert!(!store.exists(&id).unwrap());
}
