//! End-to-end behaviour of repositories, resolvers, cache and snapshots over
//! the in-memory store.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use eventfold_uow::{
    ChannelDispatcher, CommitContext, CommitOutcome, ConflictError, ConflictStrategy, DispatchError,
    Dispatcher, Engine, EngineBuilder, EventStore, Id, MemoryStore, OutgoingEvent, RepositoryError,
    ResolveError, Route, State, StreamType, WeakConfig,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Account {
    balance: i64,
    applied: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum AccountEvent {
    Deposited { amount: i64 },
    Withdrawn { amount: i64 },
    Audited { by: String },
}

impl State for Account {
    const ENTITY_TYPE: &'static str = "account";
    type Event = AccountEvent;

    fn apply(&mut self, event: &AccountEvent) -> Route {
        match event {
            AccountEvent::Deposited { amount } => self.balance += amount,
            AccountEvent::Withdrawn { amount } => self.balance -= amount,
            AccountEvent::Audited { .. } => return Route::Unhandled,
        }
        self.applied += 1;
        Route::Handled
    }

    fn conflict(&self, event: &AccountEvent) -> Result<(), ConflictError> {
        match event {
            AccountEvent::Withdrawn { amount } if *amount > self.balance => {
                Err(ConflictError::Abandon {
                    reason: "overdrawn".into(),
                })
            }
            AccountEvent::Audited { .. } => Err(ConflictError::Discard),
            _ => Ok(()),
        }
    }

    fn should_snapshot(&self, version: u64, last_snapshot: Option<u64>) -> bool {
        version >= last_snapshot.unwrap_or(0) + 10
    }
}

fn open(store: &Arc<MemoryStore>) -> Engine {
    EngineBuilder::new(store.clone()).start_sweeper(false).open()
}

fn domain_key(engine: &Engine, id: &str) -> String {
    engine.stream_key::<Account>(StreamType::Domain, "default", &Id::from(id), &[])
}

async fn seed(engine: &Engine, id: &str, events: Vec<AccountEvent>) {
    let mut repo = engine.repository::<Account>();
    let account = repo.create("default", id).unwrap();
    for event in events {
        account.apply(event);
    }
    repo.commit(&CommitContext::new()).await.unwrap();
}

fn deposit(amount: i64) -> AccountEvent {
    AccountEvent::Deposited { amount }
}

#[tokio::test]
async fn applies_advance_version_one_by_one() {
    let store = Arc::new(MemoryStore::new());
    let engine = open(&store);
    seed(&engine, "acc", vec![deposit(1), deposit(1), deposit(1)]).await;

    let mut repo = engine.repository::<Account>();
    let account = repo.get("default", "acc").await.unwrap();
    assert_eq!(account.version(), 3);
    for n in 1..=4 {
        account.apply(deposit(1));
        assert_eq!(account.version(), 3 + n);
    }
    assert_eq!(account.committed_version(), 3);
}

#[tokio::test]
async fn same_commit_twice_is_a_duplicate_not_a_second_write() {
    let store = Arc::new(MemoryStore::new());
    let engine = open(&store);
    let ctx = CommitContext::new().with_actor("tester");

    let mut repo = engine.repository::<Account>();
    let account = repo.create("default", "acc").unwrap();
    account.apply(deposit(1));
    account.apply(deposit(2));
    repo.commit(&ctx).await.unwrap();

    let mut retry = engine.repository::<Account>();
    let account = retry.get("default", "acc").await.unwrap();
    account.apply(deposit(1));
    account.apply(deposit(2));
    let report = retry.commit(&ctx).await.unwrap();

    assert_eq!(report.outcome(&domain_key(&engine, "acc")), Some(CommitOutcome::Duplicate));
    assert_eq!(store.all_events(&domain_key(&engine, "acc")).len(), 2);
}

/// Fails the first dispatch, then delivers.
#[derive(Default)]
struct FlakyDispatcher {
    calls: AtomicUsize,
}

#[async_trait]
impl Dispatcher for FlakyDispatcher {
    async fn dispatch(
        &self,
        _stream: &str,
        _events: &[OutgoingEvent],
    ) -> Result<(), DispatchError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(DispatchError("bus unavailable".into()));
        }
        Ok(())
    }
}

#[tokio::test]
async fn retry_after_failed_dispatch_redispatches_without_rewriting() {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = Arc::new(FlakyDispatcher::default());
    let engine = EngineBuilder::new(store.clone())
        .dispatcher(dispatcher.clone())
        .start_sweeper(false)
        .open();
    let ctx = CommitContext::new();

    let mut repo = engine.repository::<Account>();
    repo.get_or_create("default", "acc").await.unwrap().apply(deposit(7));
    let err = repo.commit(&ctx).await.unwrap_err();
    assert!(matches!(err, RepositoryError::Dispatch(_)));

    let mut retry = engine.repository::<Account>();
    retry.get_or_create("default", "acc").await.unwrap().apply(deposit(7));
    let report = retry.commit(&ctx).await.unwrap();
    assert_eq!(report.outcome(&domain_key(&engine, "acc")), Some(CommitOutcome::Duplicate));
    assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 2);
    assert_eq!(store.all_events(&domain_key(&engine, "acc")).len(), 1);
}

/// Entity at version 3 with two local events; a concurrent writer commits
/// one event first.
async fn race(
    engine: &Engine,
    strategy: ConflictStrategy,
) -> Result<CommitOutcome, RepositoryError> {
    seed(engine, "acc", vec![deposit(10), deposit(10), deposit(10)]).await;

    let mut local = engine.repository_with_strategy::<Account>(strategy);
    let account = local.get("default", "acc").await.unwrap();
    assert_eq!(account.committed_version(), 3);
    account.apply(deposit(5));
    account.apply(AccountEvent::Withdrawn { amount: 3 });

    let mut remote = engine.repository::<Account>();
    remote.get("default", "acc").await.unwrap().apply(deposit(10));
    remote.commit(&CommitContext::new()).await.unwrap();

    let report = local.commit(&CommitContext::new()).await?;
    Ok(report.outcome(&domain_key(engine, "acc")).unwrap())
}

#[tokio::test]
async fn strong_resolution_merges_remote_and_local_events() {
    let store = Arc::new(MemoryStore::new());
    let engine = open(&store);
    let outcome = race(&engine, ConflictStrategy::ResolveStrongly).await.unwrap();
    assert_eq!(outcome, CommitOutcome::Resolved { version: 6 });

    let mut repo = engine.repository::<Account>();
    let account = repo.get("default", "acc").await.unwrap();
    assert!(account.committed_version() >= 5);
    assert_eq!(account.state().applied, 3 + 1 + 2);
    assert_eq!(account.state().balance, 30 + 10 + 5 - 3);
}

#[tokio::test]
async fn discard_resolution_writes_nothing() {
    let store = Arc::new(MemoryStore::new());
    let engine = open(&store);
    let outcome = race(&engine, ConflictStrategy::Discard).await.unwrap();
    assert_eq!(outcome, CommitOutcome::Discarded);
    assert_eq!(store.all_events(&domain_key(&engine, "acc")).len(), 4);

    let mut repo = engine.repository::<Account>();
    assert_eq!(repo.get("default", "acc").await.unwrap().state().balance, 40);
}

#[tokio::test]
async fn ignore_resolution_appends_local_events_after_remote() {
    let store = Arc::new(MemoryStore::new());
    let engine = open(&store);
    let outcome = race(&engine, ConflictStrategy::Ignore).await.unwrap();
    assert_eq!(outcome, CommitOutcome::Resolved { version: 6 });

    let events = store.all_events(&domain_key(&engine, "acc"));
    let tail: Vec<(&str, &serde_json::Value)> = events[3..]
        .iter()
        .map(|e| (e.event_type.as_str(), &e.payload))
        .collect();
    assert_eq!(
        tail,
        vec![
            ("Deposited", &serde_json::json!({ "amount": 10 })),
            ("Deposited", &serde_json::json!({ "amount": 5 })),
            ("Withdrawn", &serde_json::json!({ "amount": 3 })),
        ]
    );
}

#[tokio::test]
async fn throw_resolution_surfaces_the_conflict() {
    let store = Arc::new(MemoryStore::new());
    let engine = open(&store);
    let err = race(&engine, ConflictStrategy::Throw).await.unwrap_err();
    assert!(matches!(
        err,
        RepositoryError::ConflictResolutionFailed {
            source: ResolveError::Rejected,
            ..
        }
    ));
    assert_eq!(store.all_events(&domain_key(&engine, "acc")).len(), 4);
}

#[tokio::test]
async fn weak_resolution_defers_then_merges_once_old_enough() {
    let store = Arc::new(MemoryStore::new());
    let engine = open(&store);
    let outcome = race(&engine, ConflictStrategy::ResolveWeakly).await.unwrap();
    assert_eq!(outcome, CommitOutcome::Deferred);
    assert_eq!(store.all_events(&domain_key(&engine, "acc")).len(), 4);
    let queue = engine.stream_key::<Account>(StreamType::Delayed, "default", &Id::from("acc"), &[]);
    assert_eq!(engine.delayed().pending(&queue).await.unwrap().len(), 2);

    let eager = Arc::new(MemoryStore::new());
    let engine = EngineBuilder::new(eager.clone())
        .weak_config(WeakConfig {
            threshold: Duration::ZERO,
        })
        .start_sweeper(false)
        .open();
    let outcome = race(&engine, ConflictStrategy::ResolveWeakly).await.unwrap();
    assert_eq!(outcome, CommitOutcome::Resolved { version: 6 });
    assert!(engine.delayed().pending(&queue).await.unwrap().is_empty());
}

#[tokio::test]
async fn new_stream_collision_fails_for_every_strategy() {
    for strategy in [
        ConflictStrategy::Throw,
        ConflictStrategy::Ignore,
        ConflictStrategy::Discard,
        ConflictStrategy::ResolveStrongly,
        ConflictStrategy::ResolveWeakly,
    ] {
        let store = Arc::new(MemoryStore::new());
        let engine = open(&store);
        seed(&engine, "X", vec![deposit(1)]).await;

        let mut repo = engine.repository_with_strategy::<Account>(strategy);
        repo.create("default", "X").unwrap().apply(deposit(2));
        let err = repo.commit(&CommitContext::new()).await.unwrap_err();
        assert!(
            matches!(err, RepositoryError::EntityAlreadyExists { .. }),
            "{strategy:?} gave {err:?}"
        );
        assert_eq!(store.all_events(&domain_key(&engine, "X")).len(), 1);
    }
}

#[tokio::test]
async fn key_read_across_two_sweeps_is_served_from_cache() {
    let store = Arc::new(MemoryStore::new());
    let engine = open(&store);
    seed(&engine, "acc", vec![deposit(1)]).await;

    engine.repository::<Account>().get("default", "acc").await.unwrap();
    engine.cache().sweep();
    engine.repository::<Account>().get("default", "acc").await.unwrap();

    let before = store.reads();
    let mut repo = engine.repository::<Account>();
    assert_eq!(repo.get("default", "acc").await.unwrap().state().balance, 1);
    assert_eq!(store.reads(), before);
    assert!(engine.cache().stats().hits >= 1);
}

#[tokio::test]
async fn key_evicted_between_reads_is_never_cached() {
    let store = Arc::new(MemoryStore::new());
    let engine = open(&store);
    seed(&engine, "acc", vec![deposit(1)]).await;
    let key = domain_key(&engine, "acc");

    for _ in 0..4 {
        let before = store.reads();
        engine.repository::<Account>().get("default", "acc").await.unwrap();
        assert!(store.reads() > before);
        engine.cache().evict(&key);
        engine.cache().sweep();
    }
}

#[tokio::test]
async fn oob_events_never_advance_version() {
    let store = Arc::new(MemoryStore::new());
    let (dispatcher, mut published) = ChannelDispatcher::new();
    let engine = EngineBuilder::new(store.clone())
        .dispatcher(Arc::new(dispatcher))
        .start_sweeper(false)
        .open();
    seed(&engine, "acc", vec![deposit(1)]).await;

    let mut repo = engine.repository::<Account>();
    let account = repo.get("default", "acc").await.unwrap();
    for by in ["a", "b", "c"] {
        account.raise(AccountEvent::Audited { by: by.into() }, "audit", false, Some(30));
    }
    assert_eq!(account.version(), 1);
    repo.commit(&CommitContext::new()).await.unwrap();

    let account = repo.get("default", "acc").await.unwrap();
    assert_eq!(account.version(), 1);
    let side = engine.oob_stream_key::<Account>("default", &Id::from("acc"), &[], "audit");
    assert_eq!(store.all_events(&side).len(), 3);
    assert_eq!(store.all_events(&domain_key(&engine, "acc")).len(), 1);

    let mut seen = 0;
    while let Ok((stream, event)) = published.try_recv() {
        if stream == side {
            assert_eq!(event.headers["Aggregates.OobId"], "audit");
            seen += 1;
        }
    }
    assert_eq!(seen, 3);
}

#[tokio::test]
async fn strong_resolution_replays_oob_events_with_their_parameters() {
    let store = Arc::new(MemoryStore::new());
    let engine = open(&store);
    seed(&engine, "acc", vec![deposit(10), deposit(10), deposit(10)]).await;

    let mut local = engine.repository_with_strategy::<Account>(ConflictStrategy::ResolveStrongly);
    let account = local.get("default", "acc").await.unwrap();
    account.apply(deposit(5));
    account.raise(AccountEvent::Audited { by: "ops".into() }, "audit", false, Some(30));
    account.raise(AccountEvent::Audited { by: "risk".into() }, "audit", false, Some(30));

    let mut remote = engine.repository::<Account>();
    remote.get("default", "acc").await.unwrap().apply(deposit(10));
    remote.commit(&CommitContext::new()).await.unwrap();

    let report = local.commit(&CommitContext::new()).await.unwrap();
    assert_eq!(
        report.outcome(&domain_key(&engine, "acc")),
        Some(CommitOutcome::Resolved { version: 5 })
    );
    assert_eq!(store.all_events(&domain_key(&engine, "acc")).len(), 5);

    let side = engine.oob_stream_key::<Account>("default", &Id::from("acc"), &[], "audit");
    let audits = store.all_events(&side);
    assert_eq!(audits.len(), 2);
    for event in &audits {
        assert_eq!(event.descriptor.headers["Aggregates.OobId"], "audit");
        assert_eq!(event.descriptor.headers["Aggregates.DaysToLive"], "30");
    }
    assert_eq!(audits[0].payload, serde_json::json!({ "by": "ops" }));
    assert_eq!(audits[1].payload, serde_json::json!({ "by": "risk" }));
}

#[tokio::test]
async fn conflict_evicts_a_stale_cache_entry() {
    let store = Arc::new(MemoryStore::new());
    let here = open(&store);
    let elsewhere = open(&store);
    seed(&here, "acc", vec![deposit(1)]).await;

    // Promote the stream in this process's cache at version 1.
    here.repository::<Account>().get("default", "acc").await.unwrap();
    here.cache().sweep();
    here.repository::<Account>().get("default", "acc").await.unwrap();

    // Another process writes version 2 through its own cache.
    let mut other = elsewhere.repository::<Account>();
    other.get("default", "acc").await.unwrap().apply(deposit(2));
    other.commit(&CommitContext::new()).await.unwrap();

    let mut first = here.repository_with_strategy::<Account>(ConflictStrategy::Throw);
    let account = first.get("default", "acc").await.unwrap();
    assert_eq!(account.committed_version(), 1);
    account.apply(deposit(3));
    let err = first.commit(&CommitContext::new()).await.unwrap_err();
    assert!(matches!(err, RepositoryError::ConflictResolutionFailed { .. }));

    let mut retry = here.repository_with_strategy::<Account>(ConflictStrategy::Throw);
    let account = retry.get("default", "acc").await.unwrap();
    assert_eq!(account.committed_version(), 2);
    account.apply(deposit(3));
    let report = retry.commit(&CommitContext::new()).await.unwrap();
    assert_eq!(
        report.outcome(&domain_key(&here, "acc")),
        Some(CommitOutcome::Written { version: 3 })
    );
    assert_eq!(retry.get("default", "acc").await.unwrap().state().balance, 6);
}

#[tokio::test]
async fn snapshot_round_trip_reproduces_state() {
    let store = Arc::new(MemoryStore::new());
    let engine = open(&store);
    let mut repo = engine.repository::<Account>();
    let account = repo.create("default", "acc").unwrap();
    for n in 1..=10 {
        account.apply(deposit(n));
    }
    repo.commit(&CommitContext::new()).await.unwrap();
    let committed = repo.get("default", "acc").await.unwrap().state().clone();

    let snapshot = engine
        .snapshots()
        .get_snapshot::<Account>("default", &Id::from("acc"), &[])
        .await
        .unwrap()
        .expect("snapshot written");
    assert_eq!(snapshot.version, 10);
    assert_eq!(snapshot.payload, committed);

    // Rebuild from the snapshot alone.
    let events = store
        .get_events(&domain_key(&engine, "acc"), Some(snapshot.version + 1), None)
        .await
        .unwrap();
    assert!(events.is_empty());
    let mut fresh = engine.repository::<Account>();
    let reloaded = fresh.get("default", "acc").await.unwrap();
    assert_eq!(reloaded.state(), &committed);
    assert_eq!(reloaded.committed_version(), 10);
}

#[tokio::test]
async fn failed_commit_leaves_entity_as_it_was() {
    let store = Arc::new(MemoryStore::new());
    let engine = open(&store);
    seed(&engine, "acc", vec![deposit(1)]).await;

    let mut repo = engine.repository::<Account>();
    let account = repo.get("default", "acc").await.unwrap();
    account.apply(deposit(2));
    let before = (account.state().clone(), account.version(), account.uncommitted().len());

    store.fail_writes(true);
    let err = repo.commit(&CommitContext::new()).await.unwrap_err();
    assert!(matches!(err, RepositoryError::Persistence(_)));

    let account = repo.get("default", "acc").await.unwrap();
    assert_eq!(
        (account.state().clone(), account.version(), account.uncommitted().len()),
        before
    );
}
