//! Per-entity-type unit of work.
//!
//! A [`Repository`] tracks the entities loaded or created during one unit
//! of work and commits them. Each tracked entity is committed on its own
//! with the version it was loaded at as expected version; a version
//! conflict hands a clean copy plus the local events to the configured
//! [`ConflictResolver`].

use std::collections::HashMap;
use std::sync::Arc;

use tracing::Instrument;

use crate::cancel::Cancellation;
use crate::context::CommitContext;
use crate::engine::{CommitError, Engine};
use crate::entity::Entity;
use crate::error::{RepositoryError, StoreError};
use crate::event::StreamType;
use crate::factory::EntityFactory;
use crate::id::{Id, Parent};
use crate::resolver::{ConflictResolver, Conflicting, Resolution};
use crate::state::State;
use crate::store::ExpectedVersion;

/// What committing one entity did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Events (or a snapshot) were written; the entity is now at `version`.
    Written {
        /// Committed version after the write.
        version: u64,
    },
    /// Nothing to write. Out-of-band events, if any, were published.
    Unchanged,
    /// The store already held this commit; nothing was written twice.
    Duplicate,
    /// A version conflict was merged and written.
    Resolved {
        /// Committed version after the merge.
        version: u64,
    },
    /// A version conflict was parked in the delayed queue.
    Deferred,
    /// A version conflict was resolved by dropping the local events.
    Discarded,
}

/// Per-stream outcomes of [`Repository::commit`], in tracking order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReport {
    /// `(stream key, outcome)` pairs.
    pub outcomes: Vec<(String, CommitOutcome)>,
}

impl CommitReport {
    /// Outcome for the stream `key`, if it was tracked.
    pub fn outcome(&self, key: &str) -> Option<CommitOutcome> {
        self.outcomes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, outcome)| *outcome)
    }
}

/// Unit of work over entities of type `S`.
///
/// Obtained from [`Engine::repository`]. Entities are tracked by stream key
/// until [`commit`](Repository::commit) or [`abandon`](Repository::abandon);
/// a second `get` of the same entity returns the tracked instance, so reads
/// within one unit of work always see its own writes.
///
/// There is no atomicity across entities: a failed commit of one entity
/// does not roll back entities committed before it.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use eventfold_uow::{CommitContext, EngineBuilder, MemoryStore, Route, State};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Default, Serialize, Deserialize)]
/// struct Counter {
///     value: u64,
/// }
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// #[serde(tag = "type", content = "data")]
/// enum CounterEvent {
///     Incremented,
/// }
///
/// impl State for Counter {
///     const ENTITY_TYPE: &'static str = "counter";
///     type Event = CounterEvent;
///
///     fn apply(&mut self, event: &CounterEvent) -> Route {
///         match event {
///             CounterEvent::Incremented => self.value += 1,
///         }
///         Route::Handled
///     }
/// }
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let engine = EngineBuilder::new(Arc::new(MemoryStore::new())).open();
/// let mut repo = engine.repository::<Counter>();
/// let counter = repo.create("default", "c-1").unwrap();
/// counter.apply(CounterEvent::Incremented);
/// repo.commit(&CommitContext::new()).await.unwrap();
///
/// let mut repo = engine.repository::<Counter>();
/// assert_eq!(repo.get("default", "c-1").await.unwrap().state().value, 1);
/// # });
/// ```
pub struct Repository<S: State> {
    engine: Engine,
    resolver: Arc<dyn ConflictResolver<S>>,
    tracked: HashMap<String, Entity<S>>,
    order: Vec<String>,
    cancel: Cancellation,
}

impl<S: State> std::fmt::Debug for Repository<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("entity_type", &S::ENTITY_TYPE)
            .field("tracked", &self.order)
            .finish_non_exhaustive()
    }
}

impl<S: State> Repository<S> {
    pub(crate) fn new(engine: Engine, resolver: Arc<dyn ConflictResolver<S>>) -> Self {
        Self {
            engine,
            resolver,
            tracked: HashMap::new(),
            order: Vec::new(),
            cancel: Cancellation::none(),
        }
    }

    /// Bind a cancellation signal to this unit of work.
    ///
    /// Once the signal fires, [`commit`](Repository::commit) writes nothing
    /// and conflict resolution stops waiting for a frozen stream.
    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    /// Load the root entity `id` in `bucket`.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::NotFound`] if the entity has no events and
    /// no snapshot, or [`RepositoryError::Persistence`] if the store fails.
    pub async fn get(
        &mut self,
        bucket: &str,
        id: impl Into<Id>,
    ) -> Result<&mut Entity<S>, RepositoryError> {
        self.get_child(bucket, id, &[]).await
    }

    /// Load the entity `id` under `parents` (root first) in `bucket`.
    ///
    /// # Errors
    ///
    /// Same as [`get`](Repository::get).
    pub async fn get_child(
        &mut self,
        bucket: &str,
        id: impl Into<Id>,
        parents: &[Parent],
    ) -> Result<&mut Entity<S>, RepositoryError> {
        let id = id.into();
        let (key, found) = self.load_tracked(bucket, &id, parents).await?;
        if !found {
            return Err(RepositoryError::NotFound { stream: key });
        }
        self.tracked_mut(&key)
    }

    /// Like [`get`](Repository::get), but a missing entity is `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Persistence`] if the store fails.
    pub async fn try_get(
        &mut self,
        bucket: &str,
        id: impl Into<Id>,
    ) -> Result<Option<&mut Entity<S>>, RepositoryError> {
        self.try_get_child(bucket, id, &[]).await
    }

    /// Like [`get_child`](Repository::get_child), but a missing entity is
    /// `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Persistence`] if the store fails.
    pub async fn try_get_child(
        &mut self,
        bucket: &str,
        id: impl Into<Id>,
        parents: &[Parent],
    ) -> Result<Option<&mut Entity<S>>, RepositoryError> {
        let id = id.into();
        let (key, found) = self.load_tracked(bucket, &id, parents).await?;
        Ok(if found { self.tracked.get_mut(&key) } else { None })
    }

    /// Start tracking a brand-new root entity.
    ///
    /// The store is not consulted: if the stream already has events, the
    /// collision surfaces on commit as
    /// [`RepositoryError::EntityAlreadyExists`].
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::EntityAlreadyExists`] if this unit of work
    /// already tracks the entity.
    pub fn create(
        &mut self,
        bucket: &str,
        id: impl Into<Id>,
    ) -> Result<&mut Entity<S>, RepositoryError> {
        self.create_child(bucket, id, vec![])
    }

    /// Start tracking a brand-new entity under `parents`.
    ///
    /// # Errors
    ///
    /// Same as [`create`](Repository::create).
    pub fn create_child(
        &mut self,
        bucket: &str,
        id: impl Into<Id>,
        parents: Vec<Parent>,
    ) -> Result<&mut Entity<S>, RepositoryError> {
        let id = id.into();
        let key = self
            .engine
            .stream_key::<S>(StreamType::Domain, bucket, &id, &parents);
        if self.tracked.contains_key(&key) {
            return Err(RepositoryError::EntityAlreadyExists { stream: key });
        }
        let entity = EntityFactory::<S>::new().create(bucket, id, parents);
        self.track(key.clone(), entity);
        self.tracked_mut(&key)
    }

    /// Load the root entity `id`, creating it if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Persistence`] if the store fails.
    pub async fn get_or_create(
        &mut self,
        bucket: &str,
        id: impl Into<Id>,
    ) -> Result<&mut Entity<S>, RepositoryError> {
        let id = id.into();
        let (key, found) = self.load_tracked(bucket, &id, &[]).await?;
        if !found {
            let entity = EntityFactory::<S>::new().create(bucket, id, vec![]);
            self.track(key.clone(), entity);
        }
        self.tracked_mut(&key)
    }

    /// Whether the entity with stream key `key` is tracked.
    pub fn is_tracked(&self, key: &str) -> bool {
        self.tracked.contains_key(key)
    }

    /// Number of tracked entities.
    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    /// Drop every tracked entity without writing.
    pub fn abandon(&mut self) {
        if !self.tracked.is_empty() {
            tracing::debug!(
                entity_type = S::ENTITY_TYPE,
                count = self.tracked.len(),
                "unit of work abandoned"
            );
        }
        self.tracked.clear();
        self.order.clear();
    }

    /// Commit every tracked entity, in tracking order.
    ///
    /// Entities stay tracked afterwards, so the unit of work can continue
    /// and commit again.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Commit id and headers shared by every write of this commit.
    ///   Reusing a context whose events were already written is detected
    ///   and reported as [`CommitOutcome::Duplicate`].
    ///
    /// # Returns
    ///
    /// The outcome per stream key.
    ///
    /// # Errors
    ///
    /// - [`RepositoryError::Cancelled`] if the unit of work was cancelled;
    ///   every tracked entity is dropped and nothing is written.
    /// - [`RepositoryError::EntityAlreadyExists`] if a new entity collided
    ///   with an existing stream.
    /// - [`RepositoryError::ConflictResolutionFailed`] if the resolver
    ///   could not merge a version conflict.
    /// - [`RepositoryError::StaleRead`] if an unchanged entity was modified
    ///   by another writer since it was loaded.
    /// - [`RepositoryError::Persistence`] or [`RepositoryError::Dispatch`]
    ///   on infrastructure failures.
    ///
    /// The failing entity keeps its uncommitted events.
    pub async fn commit(&mut self, ctx: &CommitContext) -> Result<CommitReport, RepositoryError> {
        if self.cancel.is_cancelled() {
            tracing::info!(
                entity_type = S::ENTITY_TYPE,
                dropped = self.tracked.len(),
                "unit of work cancelled before commit"
            );
            self.abandon();
            return Err(RepositoryError::Cancelled);
        }

        let mut report = CommitReport::default();
        for key in self.order.clone() {
            let span = tracing::info_span!(
                "commit",
                entity_type = S::ENTITY_TYPE,
                stream = %key,
                commit_id = %ctx.commit_id
            );
            let outcome = self.commit_one(&key, ctx).instrument(span).await?;
            report.outcomes.push((key, outcome));
        }
        Ok(report)
    }

    async fn commit_one(
        &mut self,
        key: &str,
        ctx: &CommitContext,
    ) -> Result<CommitOutcome, RepositoryError> {
        let engine = &self.engine;
        let entity = self
            .tracked
            .get_mut(key)
            .ok_or_else(|| RepositoryError::NotFound { stream: key.to_owned() })?;

        if !entity.is_dirty() {
            if engine.verify_reads() && !entity.is_new() {
                let actual = engine.store().stream_version(key).await?.unwrap_or(0);
                if actual != entity.committed_version() {
                    tracing::warn!(
                        expected = entity.committed_version(),
                        actual,
                        "stale read detected"
                    );
                    engine.cache().evict(key);
                    return Err(RepositoryError::StaleRead {
                        stream: key.to_owned(),
                        expected: entity.committed_version(),
                        actual,
                    });
                }
            }
            if !entity.oob_events().is_empty() {
                engine.persist(entity, ctx, ExpectedVersion::Any).await?;
            }
            return Ok(CommitOutcome::Unchanged);
        }

        let expected = ExpectedVersion::from_loaded(entity.committed_version());
        match engine.persist(entity, ctx, expected).await {
            Ok(p) if p.duplicate => return Ok(CommitOutcome::Duplicate),
            Ok(p) => return Ok(CommitOutcome::Written { version: p.version }),
            Err(CommitError::Store(StoreError::VersionConflict { expected, actual, .. })) => {
                // Whatever this process cached for the stream is behind the store.
                engine.cache().evict(key);
                if entity.is_new() {
                    tracing::warn!("new entity collides with an existing stream");
                    return Err(RepositoryError::EntityAlreadyExists {
                        stream: key.to_owned(),
                    });
                }
                tracing::warn!(
                    expected = %expected,
                    actual = ?actual,
                    uncommitted = entity.uncommitted().len(),
                    "version conflict; resolving"
                );
            }
            Err(e) => return Err(e.into()),
        }

        let clean = match engine
            .load::<S>(entity.bucket(), entity.id(), entity.parents(), false)
            .await?
        {
            Some(clean) => clean,
            None => EntityFactory::<S>::new().create(
                entity.bucket(),
                entity.id().clone(),
                entity.parents().to_vec(),
            ),
        };
        let conflicting = Conflicting::from_entity(entity);
        let resolution = self
            .resolver
            .resolve(engine, clean, conflicting, ctx, &self.cancel)
            .await
            .map_err(|source| RepositoryError::ConflictResolutionFailed {
                stream: key.to_owned(),
                source,
            })?;

        let (resolved, outcome) = match resolution {
            Resolution::Committed(e) => {
                let version = e.committed_version();
                (e, CommitOutcome::Resolved { version })
            }
            Resolution::Deferred(e) => (e, CommitOutcome::Deferred),
            Resolution::Discarded(e) => (e, CommitOutcome::Discarded),
        };
        *entity = resolved;
        Ok(outcome)
    }

    /// Make sure the entity is tracked if it exists.
    ///
    /// Returns its stream key and whether it is now tracked.
    async fn load_tracked(
        &mut self,
        bucket: &str,
        id: &Id,
        parents: &[Parent],
    ) -> Result<(String, bool), RepositoryError> {
        let key = self
            .engine
            .stream_key::<S>(StreamType::Domain, bucket, id, parents);
        if self.tracked.contains_key(&key) {
            return Ok((key, true));
        }
        match self.engine.load::<S>(bucket, id, parents, true).await? {
            Some(entity) => {
                tracing::debug!(
                    stream = %key,
                    version = entity.committed_version(),
                    "entity tracked"
                );
                self.track(key.clone(), entity);
                Ok((key, true))
            }
            None => Ok((key, false)),
        }
    }

    fn track(&mut self, key: String, entity: Entity<S>) {
        self.order.push(key.clone());
        self.tracked.insert(key, entity);
    }

    fn tracked_mut(&mut self, key: &str) -> Result<&mut Entity<S>, RepositoryError> {
        self.tracked
            .get_mut(key)
            .ok_or_else(|| RepositoryError::NotFound { stream: key.to_owned() })
    }
}
