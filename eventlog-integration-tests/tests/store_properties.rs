//! Store-level properties checked against the in-memory backend.

use eventlog::prelude::*;
use eventlog::types::ProducerVersion;
use eventlog::Envelope;
use eventlog_integration_tests::{account_type, append_markers, id, labels, Account, Deposited};
use eventlog_memory::InMemoryEventStore;
use proptest::prelude::*;

fn deposit(account: &str, version: u64, amount: i64) -> Envelope {
    Envelope::versioned(
        account_type(),
        id(account),
        ProducerVersion::try_new(version).unwrap(),
        Deposited { amount },
    )
}

fn history(store: &InMemoryEventStore, account: &str) -> Vec<Envelope> {
    store
        .stream(EventFilter::producer(id(account)))
        .to_vec()
        .unwrap()
}

#[test]
fn a_conflicting_batch_leaves_the_first_writer_intact() {
    let store = InMemoryEventStore::new();
    let first = store
        .add(vec![deposit("acc-1", 1, 10), deposit("acc-1", 2, 20)])
        .unwrap();

    let err = store
        .add(vec![deposit("acc-1", 1, 30), deposit("acc-1", 2, 40)])
        .unwrap_err();

    assert!(matches!(&err, EventStoreError::ConcurrentWriteDetected(producer) if producer == &id("acc-1")));
    let stored: Vec<EventId> = history(&store, "acc-1").iter().map(Envelope::id).collect();
    assert_eq!(stored, first.iter().map(Envelope::id).collect::<Vec<_>>());
}

#[test]
fn a_batch_repeating_an_id_stores_nothing() {
    let store = InMemoryEventStore::new();
    let envelope = deposit("acc-1", 1, 10);
    let twin = envelope.with_version(ProducerVersion::try_new(2).unwrap());

    let err = store.add(vec![envelope.clone(), twin]).unwrap_err();

    assert!(matches!(err, EventStoreError::EventAlreadyInStore(dup) if dup == envelope.id()));
    assert!(store.is_empty());
}

#[test]
fn committed_envelopes_are_readable_right_away() {
    let store = InMemoryEventStore::new();
    let committed = store.add(vec![deposit("acc-1", 1, 10)]).unwrap();

    let found = store.event(committed[0].id()).unwrap().unwrap();
    assert_eq!(found.sequence(), committed[0].sequence());
    assert_eq!(found.downcast_ref::<Deposited>(), Some(&Deposited { amount: 10 }));
}

#[test]
fn only_then_without_keeps_the_last_name_filter() {
    let store = InMemoryEventStore::new();
    append_markers(&store, &["a", "b", "c"]);

    let stream = store
        .stream(EventFilter::all())
        .only(["a".into()])
        .without(["a".into()]);

    assert_eq!(labels(&stream.to_vec().unwrap()), ["b", "c"]);
}

#[test]
fn bounds_select_a_window_of_the_log() {
    let store = InMemoryEventStore::new();
    let markers = append_markers(&store, &["a", "b", "c", "d", "e"]);
    let all = store.stream(EventFilter::all());

    assert_eq!(labels(&all.from(markers[1].id()).to(markers[3].id()).to_vec().unwrap()), ["b", "c", "d"]);
    assert_eq!(labels(&all.after(markers[1].id()).before(markers[3].id()).to_vec().unwrap()), ["c"]);
    assert!(all.after(markers[3].id()).before(markers[1].id()).to_vec().unwrap().is_empty());
}

#[test]
fn a_bound_the_store_does_not_know_yields_nothing() {
    let store = InMemoryEventStore::new();
    append_markers(&store, &["a", "b"]);

    let stream = store.stream(EventFilter::all()).after(EventId::new());
    assert!(stream.first().unwrap().is_none());
}

#[test]
fn producer_and_type_filters_combine_with_or() {
    let store = InMemoryEventStore::new();
    store.add(vec![deposit("acc-1", 1, 10)]).unwrap();
    store.add(vec![deposit("acc-2", 1, 20)]).unwrap();
    append_markers(&store, &["a"]);

    let accounts = store.stream(EventFilter::type_prefix("acc")).to_vec().unwrap();
    assert_eq!(accounts.len(), 2);

    let mixed = store
        .stream(EventFilter::producer(id("acc-2")).with_type_prefix("mark"))
        .to_vec()
        .unwrap();
    assert_eq!(mixed.len(), 2);
    assert_eq!(labels(&mixed), ["a"]);
}

#[test]
fn replaying_history_rebuilds_the_account() {
    let store = InMemoryEventStore::new();
    let mut account = Account::open("acc-1", "ada").unwrap();
    account.deposit(50).unwrap();
    account.withdraw(20).unwrap();
    store.add(account.sourcing().pending().to_vec()).unwrap();

    let loaded = eventlog::load(&store, || Account::new("acc-1")).unwrap();
    assert_eq!(loaded.owner(), Some("ada"));
    assert_eq!(loaded.balance(), 30);
    assert_eq!(loaded.sourcing().committed_version().map(ProducerVersion::into_inner), Some(3));
    assert!(loaded.sourcing().pending().is_empty());
}

#[test]
fn concurrent_writers_of_the_same_version_have_one_winner() {
    let store = InMemoryEventStore::new();

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|amount| scope.spawn({
                let store = store.clone();
                move || store.add(vec![deposit("acc-1", 1, amount)])
            }))
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|result| result.as_ref().err())
        .all(EventStoreError::is_retryable));
    assert_eq!(history(&store, "acc-1").len(), 1);
}

proptest! {
    #[test]
    fn re_adding_stored_versions_always_conflicts(count in 1u64..12, retry_from in 1u64..12) {
        let store = InMemoryEventStore::new();
        let batch: Vec<Envelope> = (1..=count).map(|version| deposit("acc-1", version, 1)).collect();
        store.add(batch).unwrap();
        let before = history(&store, "acc-1");

        let start = retry_from.min(count);
        let again: Vec<Envelope> = (start..=count).map(|version| deposit("acc-1", version, 2)).collect();
        let err = store.add(again).unwrap_err();

        prop_assert!(err.is_retryable());
        let after = history(&store, "acc-1");
        prop_assert_eq!(
            before.iter().map(Envelope::id).collect::<Vec<_>>(),
            after.iter().map(Envelope::id).collect::<Vec<_>>()
        );
    }

    #[test]
    fn limit_takes_a_contiguous_prefix(size in 0usize..20, limit in 0usize..25, page in 1usize..6) {
        let store = InMemoryEventStore::new();
        let names: Vec<&'static str> = ["a", "b", "c", "d"].iter().copied().cycle().take(size).collect();
        let all = append_markers(&store, &names);

        let stream = store
            .stream(EventFilter::all())
            .with_page_size(eventlog::config::PageSize::try_new(page).unwrap())
            .limit(limit);
        let taken = stream.to_vec().unwrap();

        let expected = limit.min(size);
        prop_assert_eq!(taken.len(), expected);
        prop_assert_eq!(
            taken.iter().map(Envelope::id).collect::<Vec<_>>(),
            all.iter().take(expected).map(Envelope::id).collect::<Vec<_>>()
        );
        prop_assert_eq!(stream.last().unwrap().as_ref().map(Envelope::id), taken.last().map(Envelope::id));
    }
}
