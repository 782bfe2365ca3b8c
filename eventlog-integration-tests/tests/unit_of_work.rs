//! Committing producers and subscriptions through units of work.

use std::sync::Arc;

use eventlog::config::MaxRetryAttempts;
use eventlog::prelude::*;
use eventlog::testing::FixedClock;
use eventlog::types::ProducerVersion;
use eventlog::{
    CompositeUnitOfWork, EventStoreUnitOfWork, ReplayError, RetryConfig, RetryPolicy,
    SubscriptionUnitOfWork,
};
use eventlog_integration_tests::{append_markers, id, Account, ScriptedListener};
use eventlog_memory::InMemoryEventStore;
use parking_lot::Mutex;
use tracing_test::traced_test;

fn shared(account: Account) -> Arc<Mutex<Account>> {
    Arc::new(Mutex::new(account))
}

/// Another writer stores the first event of `account_id` behind our back.
fn race(store: &InMemoryEventStore, account_id: &str) {
    let rival = Account::open(account_id, "mallory").unwrap();
    store.add(rival.sourcing().pending().to_vec()).unwrap();
}

#[test]
fn commit_flushes_every_producer_in_order() {
    let store = Arc::new(InMemoryEventStore::new());
    let mut unit = EventStoreUnitOfWork::new(store.clone());

    let first = shared(Account::open("acc-1", "ada").unwrap());
    let second = shared(Account::open("acc-2", "bob").unwrap());
    second.lock().deposit(5).unwrap();
    unit.add(Tracked::producer(first.clone())).unwrap();
    unit.add(Tracked::producer(second.clone())).unwrap();
    unit.add(Tracked::producer(first.clone())).unwrap();
    assert_eq!(unit.count(), 2);

    let committed = unit.commit().unwrap();

    assert_eq!(committed.len(), 2);
    assert_eq!(unit.count(), 0);
    assert_eq!(store.len(), 3);
    assert!(first.lock().sourcing().pending().is_empty());
    assert_eq!(
        second.lock().sourcing().committed_version(),
        ProducerVersion::try_new(2).ok()
    );
    assert_eq!(store.envelopes()[0].producer_id().as_str(), "acc-1");
}

#[test]
#[traced_test]
fn a_failed_commit_keeps_what_is_left() {
    let store = Arc::new(InMemoryEventStore::new());
    let mut unit = EventStoreUnitOfWork::new(store.clone());

    let first = shared(Account::open("acc-1", "ada").unwrap());
    let contested = shared(Account::open("acc-2", "bob").unwrap());
    let third = shared(Account::open("acc-3", "cy").unwrap());
    for account in [&first, &contested, &third] {
        unit.add(Tracked::producer(Arc::clone(account))).unwrap();
    }
    race(&store, "acc-2");

    let err = unit.commit().unwrap_err();

    assert!(matches!(err, UnitOfWorkError::EventStore(ref e) if e.is_retryable()));
    assert!(!unit.has(&Tracked::producer(first.clone())));
    assert!(unit.has(&Tracked::producer(contested.clone())));
    assert!(unit.has(&Tracked::producer(third.clone())));
    assert_eq!(unit.count(), 2);
    assert!(logs_contain("stopping at first failure"));

    // reload the contested producer and carry on from where commit stopped
    unit.remove(&Tracked::producer(contested.clone()));
    let reloaded = shared(eventlog::load(store.as_ref(), || Account::new("acc-2")).unwrap());
    reloaded.lock().deposit(7).unwrap();
    unit.add(Tracked::producer(reloaded.clone())).unwrap();

    let committed = unit.commit().unwrap();
    assert_eq!(committed.len(), 2);
    assert!(committed[0].same(&Tracked::producer(third)));
    assert_eq!(reloaded.lock().balance(), 7);
    assert_eq!(store.len(), 4);
}

#[test]
fn retry_reloads_until_the_write_lands() {
    let store = Arc::new(InMemoryEventStore::new());
    race(&store, "acc-1");
    let config = RetryConfig::immediate(MaxRetryAttempts::try_new(3).unwrap()).unwrap();

    let mut attempts = 0;
    let result: Result<i64, ReplayError> =
        eventlog::retry(&config, &RetryPolicy::default(), |attempt| {
            attempts += 1;
            let mut account = if attempt == 0 {
                // a stale copy that never saw the rival's event
                Account::new("acc-1")
            } else {
                eventlog::load(store.as_ref(), || Account::new("acc-1"))?
            };
            account.deposit(10)?;
            store.add(account.sourcing().pending().to_vec())?;
            Ok(account.balance())
        });

    assert_eq!(result.unwrap(), 10);
    assert_eq!(attempts, 2);
}

#[test]
fn subscriptions_are_saved_only_when_dirty() {
    let store = Arc::new(InMemoryEventStore::new());
    let log = append_markers(store.as_ref(), &["a", "b"]);
    let (mut subscription, _probe) = ScriptedListener::new("projector").subscribe();
    subscription.start_for(&log[0], store.as_ref()).unwrap();
    let subscription = Arc::new(Mutex::new(subscription));

    let mut unit = SubscriptionUnitOfWork::new(store.clone());
    unit.add(Tracked::subscription(subscription.clone())).unwrap();
    unit.commit().unwrap();
    assert_eq!(store.one(&id("projector")).unwrap().unwrap().version, 1);

    {
        let mut subscription = subscription.lock();
        let examined = subscription.subscribe_to(store.as_ref(), None).unwrap().count();
        assert_eq!(examined, 2);
    }
    assert!(subscription.lock().is_dirty());
    unit.add(Tracked::subscription(subscription.clone())).unwrap();
    unit.commit().unwrap();
    assert_eq!(store.one(&id("projector")).unwrap().unwrap().version, 3);
    assert!(!subscription.lock().is_dirty());

    // a clean subscription is passed over without touching the dao
    store.delete(&id("projector")).unwrap();
    unit.add(Tracked::subscription(subscription.clone())).unwrap();
    assert_eq!(unit.commit().unwrap().len(), 1);
    assert!(!store.exists(&id("projector")).unwrap());

    // deleting the record destroyed the subscription: the next save conflicts
    subscription.lock().pause();
    unit.add(Tracked::subscription(subscription.clone())).unwrap();
    let err = unit.commit().unwrap_err();
    assert!(matches!(err, UnitOfWorkError::EventStore(ref e) if e.is_retryable()));
    assert!(unit.has(&Tracked::subscription(subscription)));
}

#[test]
fn pausing_is_persisted_by_the_unit_of_work() {
    let store = Arc::new(InMemoryEventStore::new());
    let log = append_markers(store.as_ref(), &["a"]);
    let (mut subscription, _probe) = ScriptedListener::new("projector").subscribe();
    subscription.start_for(&log[0], store.as_ref()).unwrap();
    let subscription = Arc::new(Mutex::new(subscription));

    let mut unit = SubscriptionUnitOfWork::new(store.clone());
    unit.add(Tracked::subscription(subscription.clone())).unwrap();
    unit.commit().unwrap();

    subscription.lock().pause();
    assert!(subscription.lock().is_dirty());
    unit.add(Tracked::subscription(subscription.clone())).unwrap();
    unit.commit().unwrap();

    let stored = store.one(&id("projector")).unwrap().unwrap();
    assert!(stored.paused);
    assert_eq!(stored.version, 1);
    assert!(!subscription.lock().is_dirty());

    let mut reloaded = Subscription::restore(
        Box::new(ScriptedListener::new("projector")),
        stored,
        Arc::new(FixedClock::epoch()),
    )
    .unwrap();
    assert!(matches!(
        reloaded.subscribe_to(store.as_ref(), None),
        Err(SubscriptionError::Paused(_))
    ));

    subscription.lock().unpause();
    unit.add(Tracked::subscription(subscription.clone())).unwrap();
    unit.commit().unwrap();
    assert!(!store.one(&id("projector")).unwrap().unwrap().paused);
}

#[test]
fn a_composite_routes_objects_to_the_unit_that_takes_them() {
    let store = Arc::new(InMemoryEventStore::new());
    let log = append_markers(store.as_ref(), &["a"]);
    let (mut subscription, _probe) = ScriptedListener::new("projector").subscribe();
    subscription.start_for(&log[0], store.as_ref()).unwrap();
    let subscription = Arc::new(Mutex::new(subscription));
    let account = shared(Account::open("acc-1", "ada").unwrap());

    let producers: Box<dyn UnitOfWork> = Box::new(EventStoreUnitOfWork::new(store.clone()));
    let mut unit = CompositeUnitOfWork::new(vec![producers])
        .with(Box::new(SubscriptionUnitOfWork::new(store.clone())));

    unit.add(Tracked::subscription(subscription.clone())).unwrap();
    unit.add(Tracked::producer(account.clone())).unwrap();
    let err = unit.add(Tracked::other(Arc::new(42_u32))).unwrap_err();
    insta::assert_snapshot!(err.to_string(), @"Object of kind 'u32' is not supported by this unit of work");

    assert_eq!(unit.count(), 2);
    let order: Vec<&str> = unit.uncommitted().iter().map(Tracked::kind).collect();
    assert_eq!(order, ["event producer", "subscription"]);

    let committed = unit.commit().unwrap();
    assert_eq!(committed.len(), 2);
    assert_eq!(store.len(), 2);
    assert!(store.exists(subscription.lock().id()).unwrap());

    assert!(!unit.remove(&Tracked::producer(account)));
    unit.add(Tracked::subscription(subscription)).unwrap();
    unit.clear();
    assert_eq!(unit.count(), 0);
}
