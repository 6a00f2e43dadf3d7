//! Conflict resolution strategies.
//!
//! A resolver runs only after the log store rejected a commit with a
//! version conflict. It receives a clean copy of the entity, freshly read
//! from the store, plus the local events that failed to commit, and either
//! commits a merged result itself or decides not to.
//!
//! | Strategy | Outcome |
//! |---|---|
//! | [`Throw`](ConflictStrategy::Throw) | fails with [`ResolveError::Rejected`] |
//! | [`Ignore`](ConflictStrategy::Ignore) | applies local events on the clean entity, writes |
//! | [`Discard`](ConflictStrategy::Discard) | drops local events, writes nothing |
//! | [`ResolveStrongly`](ConflictStrategy::ResolveStrongly) | freezes, replays, writes |
//! | [`ResolveWeakly`](ConflictStrategy::ResolveWeakly) | defers; merges strongly once old enough |
//!
//! Strong and weak merges route every local event through [`State::conflict`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::cancel::Cancellation;
use crate::context::CommitContext;
use crate::engine::Engine;
use crate::entity::{Entity, OobEvent};
use crate::error::{ConflictError, ResolveError, StoreError};
use crate::event::{FullEvent, StreamType, decode_recorded, encode_event, event_id, propose};
use crate::state::State;
use crate::store::ExpectedVersion;

/// Built-in conflict resolution strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictStrategy {
    /// Never resolve; surface the conflict.
    Throw,
    /// Append local events after the remote ones without any merge check.
    ///
    /// Only correct when the events commute.
    Ignore,
    /// Drop local events.
    Discard,
    /// Merge under a freeze through the state's conflict handler.
    ResolveStrongly,
    /// Defer local events and merge strongly once they are old enough.
    ///
    /// Only correct when the deferred events commute over the deferral
    /// window.
    ResolveWeakly,
}

/// Settings for acquiring the freeze marker during a merge.
///
/// Acquisition polls with exponential backoff and checks the unit of
/// work's cancellation signal before every attempt.
#[derive(Debug, Clone)]
pub struct FreezeConfig {
    /// How long a freeze marker stays valid if its owner never releases it.
    ///
    /// Default: 30 seconds.
    pub ttl: Duration,

    /// Attempts before giving up with [`ResolveError::Frozen`].
    ///
    /// Default: 10.
    pub attempts: u32,

    /// Delay after the first failed attempt; doubled after each further one.
    ///
    /// Default: 50 milliseconds.
    pub base_delay: Duration,

    /// Upper bound of the backoff delay.
    ///
    /// Default: 2 seconds.
    pub max_delay: Duration,
}

impl Default for FreezeConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            attempts: 10,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

/// Settings of the weak resolver.
#[derive(Debug, Clone)]
pub struct WeakConfig {
    /// Deferred events are merged once the oldest of them is this old.
    ///
    /// Default: 30 seconds.
    pub threshold: Duration,
}

impl Default for WeakConfig {
    fn default() -> Self {
        Self {
            threshold: Duration::from_secs(30),
        }
    }
}

/// Local events that failed to commit.
#[derive(Debug, Clone)]
pub struct Conflicting<S: State> {
    /// Domain events, in apply order.
    pub domain: Vec<FullEvent<S::Event>>,
    /// Out-of-band events, in raise order.
    pub oob: Vec<OobEvent<S::Event>>,
}

impl<S: State> Conflicting<S> {
    /// Copy the uncommitted events of `entity`.
    pub fn from_entity(entity: &Entity<S>) -> Self {
        Self {
            domain: entity.uncommitted().to_vec(),
            oob: entity.oob_events().to_vec(),
        }
    }
}

/// What a resolver did. Each variant carries the entity the repository
/// keeps tracking afterwards.
#[derive(Debug)]
pub enum Resolution<S: State> {
    /// A merged result was written.
    Committed(Entity<S>),
    /// Local events were parked in the delayed queue.
    Deferred(Entity<S>),
    /// Local events were dropped.
    Discarded(Entity<S>),
}

/// A conflict resolution algorithm for entities of type `S`.
#[async_trait]
pub trait ConflictResolver<S: State>: Send + Sync {
    /// Resolve a version conflict.
    ///
    /// # Arguments
    ///
    /// * `engine` - Shared services, for reads and for the write path.
    /// * `clean` - The entity as currently stored, read bypassing the cache.
    /// * `conflicting` - Local events that failed to commit.
    /// * `ctx` - Context of the failed commit.
    /// * `cancel` - Cancellation signal of the unit of work.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] if no committable result could be produced.
    async fn resolve(
        &self,
        engine: &Engine,
        clean: Entity<S>,
        conflicting: Conflicting<S>,
        ctx: &CommitContext,
        cancel: &Cancellation,
    ) -> Result<Resolution<S>, ResolveError>;
}

/// The resolver implementing `strategy`.
pub fn resolver_for<S: State>(strategy: ConflictStrategy) -> Arc<dyn ConflictResolver<S>> {
    match strategy {
        ConflictStrategy::Throw => Arc::new(ThrowResolver),
        ConflictStrategy::Ignore => Arc::new(IgnoreResolver),
        ConflictStrategy::Discard => Arc::new(DiscardResolver),
        ConflictStrategy::ResolveStrongly => Arc::new(StrongResolver),
        ConflictStrategy::ResolveWeakly => Arc::new(WeakResolver),
    }
}

/// Fails every conflict.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThrowResolver;

#[async_trait]
impl<S: State> ConflictResolver<S> for ThrowResolver {
    async fn resolve(
        &self,
        _engine: &Engine,
        _clean: Entity<S>,
        _conflicting: Conflicting<S>,
        _ctx: &CommitContext,
        _cancel: &Cancellation,
    ) -> Result<Resolution<S>, ResolveError> {
        Err(ResolveError::Rejected)
    }
}

/// Applies local events onto the clean entity and writes them unchecked.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreResolver;

#[async_trait]
impl<S: State> ConflictResolver<S> for IgnoreResolver {
    async fn resolve(
        &self,
        engine: &Engine,
        clean: Entity<S>,
        conflicting: Conflicting<S>,
        ctx: &CommitContext,
        _cancel: &Cancellation,
    ) -> Result<Resolution<S>, ResolveError> {
        let mut entity = clean;
        for full in conflicting.domain {
            entity.apply_with(full.event, full.descriptor.headers);
        }
        for oob in conflicting.oob {
            entity.raise_oob(oob);
        }
        let expected = ExpectedVersion::from_loaded(entity.committed_version());
        let persisted = engine.persist(&mut entity, ctx, expected).await?;
        tracing::info!(
            entity_type = S::ENTITY_TYPE,
            stream_id = %entity.id(),
            version = persisted.version,
            "conflict ignored; local events appended"
        );
        Ok(Resolution::Committed(entity))
    }
}

/// Drops local events.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardResolver;

#[async_trait]
impl<S: State> ConflictResolver<S> for DiscardResolver {
    async fn resolve(
        &self,
        _engine: &Engine,
        clean: Entity<S>,
        conflicting: Conflicting<S>,
        _ctx: &CommitContext,
        _cancel: &Cancellation,
    ) -> Result<Resolution<S>, ResolveError> {
        tracing::info!(
            entity_type = S::ENTITY_TYPE,
            stream_id = %clean.id(),
            discarded = conflicting.domain.len(),
            "conflicting events discarded"
        );
        Ok(Resolution::Discarded(clean))
    }
}

/// Merges under a freeze through the state's conflict handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrongResolver;

#[async_trait]
impl<S: State> ConflictResolver<S> for StrongResolver {
    async fn resolve(
        &self,
        engine: &Engine,
        clean: Entity<S>,
        conflicting: Conflicting<S>,
        ctx: &CommitContext,
        cancel: &Cancellation,
    ) -> Result<Resolution<S>, ResolveError> {
        let stream = engine.entity_stream_key(StreamType::Domain, &clean);
        let owner = Uuid::new_v4();
        acquire_freeze(engine, &stream, owner, cancel).await?;
        let merged = merge(engine, clean, conflicting, ctx).await;
        release_freeze(engine, &stream, owner).await;
        merged.map(Resolution::Committed)
    }
}

/// Defers local events; merges strongly once they are old enough.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeakResolver;

#[async_trait]
impl<S: State> ConflictResolver<S> for WeakResolver {
    async fn resolve(
        &self,
        engine: &Engine,
        clean: Entity<S>,
        conflicting: Conflicting<S>,
        ctx: &CommitContext,
        cancel: &Cancellation,
    ) -> Result<Resolution<S>, ResolveError> {
        let queue = engine.entity_stream_key(StreamType::Delayed, &clean);
        let deferred = conflicting
            .domain
            .iter()
            .enumerate()
            .map(|(i, full)| propose(full, event_id(ctx.commit_id, i)))
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)?;
        engine
            .delayed()
            .defer(&queue, deferred, &ctx.commit_headers())
            .await?;

        let age = engine.delayed().oldest_age(&queue).await?.unwrap_or_default();
        let threshold = engine.weak_config().threshold;
        if age < threshold {
            let mut entity = clean;
            for oob in conflicting.oob {
                entity.raise_oob(oob);
            }
            if !entity.oob_events().is_empty() {
                engine.persist(&mut entity, ctx, ExpectedVersion::Any).await?;
            }
            tracing::info!(
                entity_type = S::ENTITY_TYPE,
                stream_id = %entity.id(),
                age_ms = u64::try_from(age.as_millis()).unwrap_or(u64::MAX),
                "conflicting events deferred"
            );
            return Ok(Resolution::Deferred(entity));
        }

        let stream = engine.entity_stream_key(StreamType::Domain, &clean);
        let owner = Uuid::new_v4();
        acquire_freeze(engine, &stream, owner, cancel).await?;
        let merged = merge_deferred(engine, clean, conflicting.oob, &queue, ctx).await;
        release_freeze(engine, &stream, owner).await;
        merged.map(Resolution::Committed)
    }
}

async fn merge_deferred<S: State>(
    engine: &Engine,
    clean: Entity<S>,
    oob: Vec<OobEvent<S::Event>>,
    queue: &str,
    ctx: &CommitContext,
) -> Result<Entity<S>, ResolveError> {
    let pending = engine.delayed().pending(queue).await?;

    // A merge whose write went through but whose acknowledgement did not
    // leaves its events queued. They keep their ids in the domain stream,
    // somewhere at or after the version they were first applied at.
    let stream = engine.entity_stream_key(StreamType::Domain, &clean);
    let merged: HashSet<Uuid> = match pending.iter().map(|r| r.descriptor.version).min() {
        Some(floor) => engine
            .store()
            .get_events(&stream, Some(floor.max(1)), None)
            .await?
            .into_iter()
            .map(|r| r.event_id)
            .collect(),
        None => HashSet::new(),
    };

    let mut domain = Vec::with_capacity(pending.len());
    for recorded in &pending {
        if merged.contains(&recorded.event_id) {
            tracing::debug!(
                stream = %queue,
                version = recorded.stream_version,
                "deferred event already merged"
            );
            continue;
        }
        match decode_recorded::<S::Event>(recorded) {
            Some(full) => domain.push(full),
            None => tracing::warn!(
                stream = %queue,
                event_type = %recorded.event_type,
                "unknown deferred event dropped"
            ),
        }
    }
    let entity = merge(engine, clean, Conflicting { domain, oob }, ctx).await?;
    if let Some(last) = pending.last() {
        engine.delayed().acknowledge(queue, last.stream_version).await?;
    }
    Ok(entity)
}

/// Poll for the freeze marker with exponential backoff.
async fn acquire_freeze(
    engine: &Engine,
    stream: &str,
    owner: Uuid,
    cancel: &Cancellation,
) -> Result<(), ResolveError> {
    let config = engine.freeze_config();
    let mut delay = config.base_delay;
    for attempt in 1..=config.attempts {
        if cancel.is_cancelled() {
            return Err(ResolveError::Cancelled);
        }
        match engine.store().freeze(stream, owner, config.ttl).await {
            Ok(()) => return Ok(()),
            Err(StoreError::Frozen { .. }) => {
                tracing::debug!(stream = %stream, attempt, "stream frozen; backing off");
                if attempt < config.attempts {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(config.max_delay);
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(ResolveError::Frozen {
        stream: stream.to_owned(),
    })
}

async fn release_freeze(engine: &Engine, stream: &str, owner: Uuid) {
    if let Err(e) = engine.store().unfreeze(stream, owner).await {
        tracing::warn!(stream = %stream, error = %e, "failed to release freeze");
    }
}

/// Catch up on missed remote events, then replay local events through the
/// conflict handler and write the result.
async fn merge<S: State>(
    engine: &Engine,
    clean: Entity<S>,
    conflicting: Conflicting<S>,
    ctx: &CommitContext,
) -> Result<Entity<S>, ResolveError> {
    let mut entity = clean;
    let stream = engine.entity_stream_key(StreamType::Domain, &entity);
    let missed = engine
        .store()
        .get_events(&stream, Some(entity.committed_version() + 1), None)
        .await?;
    for recorded in &missed {
        entity.fold_committed(recorded);
    }

    let mut discarded = 0usize;
    for full in conflicting.domain {
        let event_type = encode_event(&full.event)
            .map(|(t, _)| t)
            .unwrap_or_else(|_| "<unencodable>".to_owned());
        match entity.apply_conflicting(full) {
            Ok(()) => {}
            Err(ConflictError::Discard) => {
                discarded += 1;
                tracing::debug!(
                    stream = %stream,
                    event_type = %event_type,
                    "conflicting event discarded"
                );
            }
            Err(ConflictError::Unhandled) => return Err(ResolveError::Unhandled { event_type }),
            Err(ConflictError::Abandon { reason }) => {
                return Err(ResolveError::Abandoned { reason });
            }
        }
    }
    for oob in conflicting.oob {
        entity.raise_oob(oob);
    }

    let expected = ExpectedVersion::from_loaded(entity.committed_version());
    let persisted = engine.persist(&mut entity, ctx, expected).await?;
    tracing::info!(
        stream = %stream,
        caught_up = missed.len(),
        discarded,
        version = persisted.version,
        "conflict resolved"
    );
    Ok(entity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineBuilder;
    use crate::event::Headers;
    use crate::factory::EntityFactory;
    use crate::id::Id;
    use crate::memory::MemoryStore;
    use crate::state::test_fixtures::{Account, AccountEvent};
    use crate::store::EventStore;

    fn engine(store: Arc<MemoryStore>) -> Engine {
        EngineBuilder::new(store)
            .start_sweeper(false)
            .freeze_config(FreezeConfig {
                attempts: 3,
                base_delay: Duration::from_millis(10),
                ..FreezeConfig::default()
            })
            .open()
    }

    /// Commit `events` to `acc-1` and return the clean entity.
    async fn seeded(engine: &Engine, events: &[AccountEvent]) -> Entity<Account> {
        let mut e = EntityFactory::<Account>::new().create("default", Id::from("acc-1"), vec![]);
        for ev in events {
            e.apply(ev.clone());
        }
        engine
            .persist(&mut e, &CommitContext::new(), ExpectedVersion::NoStream)
            .await
            .unwrap();
        e
    }

    fn key(e: &Engine, stream_type: StreamType) -> String {
        e.stream_key::<Account>(stream_type, "default", &Id::from("acc-1"), &[])
    }

    fn conflicting(events: &[AccountEvent]) -> Conflicting<Account> {
        let mut scratch = EntityFactory::<Account>::new().create("default", "acc-1".into(), vec![]);
        for ev in events {
            scratch.apply(ev.clone());
        }
        Conflicting::from_entity(&scratch)
    }

    #[tokio::test]
    async fn throw_rejects() {
        let e = engine(Arc::new(MemoryStore::new()));
        let clean = seeded(&e, &[AccountEvent::Deposited { amount: 1 }]).await;
        let err = ThrowResolver
            .resolve(&e, clean, conflicting(&[]), &CommitContext::new(), &Cancellation::none())
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Rejected));
    }

    #[tokio::test]
    async fn strong_merge_catches_up_and_replays() {
        let store = Arc::new(MemoryStore::new());
        let e = engine(store.clone());
        let stale = seeded(&e, &[AccountEvent::Deposited { amount: 1 }]).await;

        // A remote writer moves the stream on.
        let mut remote = stale.clone();
        remote.apply(AccountEvent::Deposited { amount: 10 });
        e.persist(&mut remote, &CommitContext::new(), ExpectedVersion::Exact(1))
            .await
            .unwrap();

        let local = conflicting(&[AccountEvent::Withdrawn { amount: 5 }]);
        let resolved = StrongResolver
            .resolve(&e, stale, local, &CommitContext::new(), &Cancellation::none())
            .await
            .unwrap();
        let Resolution::Committed(merged) = resolved else {
            panic!("expected a committed merge");
        };
        assert_eq!(merged.committed_version(), 3);
        assert_eq!(merged.state().balance, 6);
    }

    #[tokio::test]
    async fn strong_merge_fails_hard_on_unhandled_and_abandon() {
        let e = engine(Arc::new(MemoryStore::new()));
        let clean = seeded(&e, &[AccountEvent::Deposited { amount: 1 }]).await;
        let err = StrongResolver
            .resolve(
                &e,
                clean.clone(),
                conflicting(&[AccountEvent::Noted { text: "x".into() }]),
                &CommitContext::new(),
                &Cancellation::none(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Unhandled { ref event_type } if event_type == "Noted"));

        let err = StrongResolver
            .resolve(
                &e,
                clean,
                conflicting(&[AccountEvent::Withdrawn { amount: 100 }]),
                &CommitContext::new(),
                &Cancellation::none(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Abandoned { .. }));
    }

    #[tokio::test]
    async fn strong_merge_drops_discarded_events() {
        let store = Arc::new(MemoryStore::new());
        let e = engine(store.clone());
        let clean = seeded(&e, &[AccountEvent::Deposited { amount: 1 }]).await;
        let local = conflicting(&[AccountEvent::Closed, AccountEvent::Deposited { amount: 2 }]);
        let Resolution::Committed(merged) = StrongResolver
            .resolve(&e, clean, local, &CommitContext::new(), &Cancellation::none())
            .await
            .unwrap()
        else {
            panic!("expected a committed merge");
        };
        assert!(!merged.state().closed);
        assert_eq!(merged.committed_version(), 2);
    }

    #[tokio::test]
    async fn freeze_is_released_after_failed_merge() {
        let store = Arc::new(MemoryStore::new());
        let e = engine(store.clone());
        let clean = seeded(&e, &[AccountEvent::Deposited { amount: 1 }]).await;
        let _ = StrongResolver
            .resolve(
                &e,
                clean,
                conflicting(&[AccountEvent::Noted { text: "x".into() }]),
                &CommitContext::new(),
                &Cancellation::none(),
            )
            .await;
        let key = key(&e, StreamType::Domain);
        store
            .freeze(&key, Uuid::new_v4(), Duration::from_secs(1))
            .await
            .expect("freeze was released");
    }

    #[tokio::test(start_paused = true)]
    async fn busy_stream_gives_up_after_attempts() {
        let store = Arc::new(MemoryStore::new());
        let e = engine(store.clone());
        let clean = seeded(&e, &[AccountEvent::Deposited { amount: 1 }]).await;
        let key = key(&e, StreamType::Domain);
        store.freeze(&key, Uuid::new_v4(), Duration::from_secs(60)).await.unwrap();

        let err = StrongResolver
            .resolve(
                &e,
                clean,
                conflicting(&[AccountEvent::Deposited { amount: 2 }]),
                &CommitContext::new(),
                &Cancellation::none(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Frozen { .. }));
    }

    #[tokio::test]
    async fn cancelled_unit_of_work_stops_waiting_for_freeze() {
        let store = Arc::new(MemoryStore::new());
        let e = engine(store.clone());
        let clean = seeded(&e, &[AccountEvent::Deposited { amount: 1 }]).await;
        let (handle, signal) = crate::cancel::CancelHandle::new();
        handle.cancel();
        let err = StrongResolver
            .resolve(
                &e,
                clean,
                conflicting(&[AccountEvent::Deposited { amount: 2 }]),
                &CommitContext::new(),
                &signal,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Cancelled));
    }

    #[tokio::test]
    async fn weak_defers_until_threshold() {
        let store = Arc::new(MemoryStore::new());
        let e = engine(store.clone());
        let clean = seeded(&e, &[AccountEvent::Deposited { amount: 1 }]).await;
        let resolved = WeakResolver
            .resolve(
                &e,
                clean,
                conflicting(&[AccountEvent::Deposited { amount: 2 }]),
                &CommitContext::new(),
                &Cancellation::none(),
            )
            .await
            .unwrap();
        let Resolution::Deferred(entity) = resolved else {
            panic!("expected deferral");
        };
        assert_eq!(entity.committed_version(), 1);
        let queue = key(&e, StreamType::Delayed);
        assert_eq!(store.all_events(&queue).len(), 1);
    }

    #[tokio::test]
    async fn weak_with_zero_threshold_merges_everything_deferred() {
        let store = Arc::new(MemoryStore::new());
        let e = EngineBuilder::new(store.clone())
            .start_sweeper(false)
            .weak_config(WeakConfig {
                threshold: Duration::ZERO,
            })
            .open();
        let clean = seeded(&e, &[AccountEvent::Deposited { amount: 1 }]).await;

        // Something deferred earlier by another unit of work.
        let queue = key(&e, StreamType::Delayed);
        let earlier = conflicting(&[AccountEvent::Deposited { amount: 5 }]);
        let proposed = vec![propose(&earlier.domain[0], Uuid::new_v4()).unwrap()];
        e.delayed().defer(&queue, proposed, &Headers::new()).await.unwrap();

        let Resolution::Committed(merged) = WeakResolver
            .resolve(
                &e,
                clean,
                conflicting(&[AccountEvent::Deposited { amount: 2 }]),
                &CommitContext::new(),
                &Cancellation::none(),
            )
            .await
            .unwrap()
        else {
            panic!("expected a committed merge");
        };
        assert_eq!(merged.committed_version(), 3);
        assert_eq!(merged.state().balance, 8);
        assert!(e.delayed().pending(&queue).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn weak_merge_skips_events_merged_before_a_lost_acknowledgement() {
        let store = Arc::new(MemoryStore::new());
        let e = EngineBuilder::new(store.clone())
            .start_sweeper(false)
            .weak_config(WeakConfig {
                threshold: Duration::ZERO,
            })
            .open();
        seeded(&e, &[AccountEvent::Deposited { amount: 1 }]).await;

        let queue = key(&e, StreamType::Delayed);
        let earlier = conflicting(&[AccountEvent::Deposited { amount: 5 }]);
        let deferred = propose(&earlier.domain[0], Uuid::new_v4()).unwrap();
        e.delayed()
            .defer(&queue, vec![deferred.clone()], &Headers::new())
            .await
            .unwrap();

        // An earlier merge wrote the deferred event but never truncated the queue.
        let stream = key(&e, StreamType::Domain);
        store
            .write_events(&stream, vec![deferred], &Headers::new(), ExpectedVersion::Exact(1))
            .await
            .unwrap();
        let clean = e
            .load::<Account>("default", &Id::from("acc-1"), &[], false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(clean.state().balance, 6);

        let Resolution::Committed(merged) = WeakResolver
            .resolve(
                &e,
                clean,
                conflicting(&[AccountEvent::Deposited { amount: 2 }]),
                &CommitContext::new(),
                &Cancellation::none(),
            )
            .await
            .unwrap()
        else {
            panic!("expected a committed merge");
        };
        assert_eq!(merged.committed_version(), 3);
        assert_eq!(merged.state().balance, 8);
        assert_eq!(store.all_events(&stream).len(), 3);
        assert!(e.delayed().pending(&queue).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn merged_deferred_events_keep_their_queued_ids() {
        let store = Arc::new(MemoryStore::new());
        let e = EngineBuilder::new(store.clone())
            .start_sweeper(false)
            .weak_config(WeakConfig {
                threshold: Duration::ZERO,
            })
            .open();
        let clean = seeded(&e, &[AccountEvent::Deposited { amount: 1 }]).await;
        let queue = key(&e, StreamType::Delayed);

        WeakResolver
            .resolve(
                &e,
                clean,
                conflicting(&[AccountEvent::Deposited { amount: 2 }]),
                &CommitContext::new(),
                &Cancellation::none(),
            )
            .await
            .unwrap();

        let stream = key(&e, StreamType::Domain);
        let queued = store.all_events(&queue);
        let written = store.all_events(&stream);
        assert_eq!(written.len(), 2);
        assert_eq!(written[1].event_id, queued[0].event_id);
    }
}
