//! Top-level entry point that wires the log store, cache, snapshot store,
//! dispatcher and delayed queue into a single [`Engine`].
//!
//! The engine is opened via [`EngineBuilder`]. It is cheap to clone and is
//! shared by every unit of work; each unit of work gets its own
//! [`Repository`] from [`Engine::repository`].

use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheConfig, SweeperHandle, TieredCache};
use crate::context::CommitContext;
use crate::delayed::DelayedQueue;
use crate::dispatch::{Dispatcher, NullDispatcher, OutgoingEvent};
use crate::entity::Entity;
use crate::error::{DispatchError, RepositoryError, ResolveError, StoreError};
use crate::event::{ProposedEvent, StreamType, encode_event, event_id, propose};
use crate::factory::EntityFactory;
use crate::id::{Id, Parent};
use crate::repository::Repository;
use crate::resolver::{ConflictResolver, ConflictStrategy, FreezeConfig, WeakConfig, resolver_for};
use crate::snapshot::SnapshotStore;
use crate::state::State;
use crate::store::{EventStore, ExpectedVersion};
use crate::stream::{StreamIdentity, StreamKeyFn, default_stream_key};

/// Failure of the shared write path.
#[derive(Debug)]
pub(crate) enum CommitError {
    Store(StoreError),
    Dispatch(DispatchError),
}

impl From<StoreError> for CommitError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<serde_json::Error> for CommitError {
    fn from(e: serde_json::Error) -> Self {
        Self::Store(StoreError::Serialization(e))
    }
}

impl From<CommitError> for ResolveError {
    fn from(e: CommitError) -> Self {
        match e {
            CommitError::Store(e) => Self::Store(e),
            CommitError::Dispatch(e) => Self::Dispatch(e),
        }
    }
}

impl From<CommitError> for RepositoryError {
    fn from(e: CommitError) -> Self {
        match e {
            CommitError::Store(e) => Self::Persistence(e),
            CommitError::Dispatch(e) => Self::Dispatch(e),
        }
    }
}

/// Out-of-band events of one commit bound for one side stream.
struct SideStream {
    key: String,
    dispatched: Vec<ProposedEvent>,
    stored: Vec<ProposedEvent>,
    days_to_live: Option<u32>,
}

impl SideStream {
    fn new(key: String) -> Self {
        Self {
            key,
            dispatched: Vec::new(),
            stored: Vec::new(),
            days_to_live: None,
        }
    }
}

/// Result of the shared write path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Persisted {
    /// Committed version of the entity after the write.
    pub version: u64,
    /// The store already held this commit's domain events.
    pub duplicate: bool,
}

struct Shared {
    store: Arc<dyn EventStore>,
    cache: Arc<TieredCache>,
    snapshots: SnapshotStore,
    keys: StreamKeyFn,
    dispatcher: Arc<dyn Dispatcher>,
    delayed: DelayedQueue,
    freeze: FreezeConfig,
    weak: WeakConfig,
    verify_reads: bool,
    sweeper: Option<SweeperHandle>,
}

/// Shared services of the persistence engine.
///
/// `Clone` is cheap -- all internal state is `Arc`-wrapped.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

// Manual `Debug` because the trait objects are not `Debug`.
impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("cache", &self.shared.cache)
            .field("freeze", &self.shared.freeze)
            .field("weak", &self.shared.weak)
            .field("verify_reads", &self.shared.verify_reads)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Start configuring an engine over `store`.
    pub fn builder(store: Arc<dyn EventStore>) -> EngineBuilder {
        EngineBuilder::new(store)
    }

    /// A repository for `S` using [`State::conflict_strategy`].
    pub fn repository<S: State>(&self) -> Repository<S> {
        self.repository_with_strategy(S::conflict_strategy())
    }

    /// A repository for `S` using `strategy` on version conflicts.
    pub fn repository_with_strategy<S: State>(&self, strategy: ConflictStrategy) -> Repository<S> {
        self.repository_with_resolver(resolver_for::<S>(strategy))
    }

    /// A repository for `S` using a custom resolver.
    pub fn repository_with_resolver<S: State>(
        &self,
        resolver: Arc<dyn ConflictResolver<S>>,
    ) -> Repository<S> {
        Repository::new(self.clone(), resolver)
    }

    /// The log store.
    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.shared.store
    }

    /// The read cache.
    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.shared.cache
    }

    /// The snapshot store.
    pub fn snapshots(&self) -> &SnapshotStore {
        &self.shared.snapshots
    }

    /// The delayed queue used by the weak resolver.
    pub fn delayed(&self) -> &DelayedQueue {
        &self.shared.delayed
    }

    /// Freeze acquisition settings.
    pub fn freeze_config(&self) -> &FreezeConfig {
        &self.shared.freeze
    }

    /// Weak resolver settings.
    pub fn weak_config(&self) -> &WeakConfig {
        &self.shared.weak
    }

    /// Whether read-only entities are checked against the store on commit.
    pub fn verify_reads(&self) -> bool {
        self.shared.verify_reads
    }

    /// Stream key of one of the streams of an `S` entity.
    pub fn stream_key<S: State>(
        &self,
        stream_type: StreamType,
        bucket: &str,
        id: &Id,
        parents: &[Parent],
    ) -> String {
        (self.shared.keys)(&StreamIdentity {
            entity_type: S::ENTITY_TYPE,
            stream_type,
            bucket,
            id,
            parents,
        })
    }

    /// Stream key of one of the streams of `entity`.
    pub(crate) fn entity_stream_key<S: State>(
        &self,
        stream_type: StreamType,
        entity: &Entity<S>,
    ) -> String {
        self.stream_key::<S>(stream_type, entity.bucket(), entity.id(), entity.parents())
    }

    /// Stream key of the out-of-band side stream `oob_id` of an `S` entity.
    ///
    /// The side stream is keyed as a child named `oob_id` of the entity.
    pub fn oob_stream_key<S: State>(
        &self,
        bucket: &str,
        id: &Id,
        parents: &[Parent],
        oob_id: &str,
    ) -> String {
        let mut lineage = parents.to_vec();
        lineage.push(Parent::new(S::ENTITY_TYPE, id.clone()));
        let oob = Id::from(oob_id);
        (self.shared.keys)(&StreamIdentity {
            entity_type: S::ENTITY_TYPE,
            stream_type: StreamType::Oob,
            bucket,
            id: &oob,
            parents: &lineage,
        })
    }

    /// Stop the background cache sweeper, if this engine started one.
    pub async fn shutdown(&self) {
        if let Some(sweeper) = &self.shared.sweeper {
            sweeper.shutdown().await;
        }
    }

    /// Load an entity from cache, snapshot and log.
    ///
    /// Returns `Ok(None)` when the entity has neither a snapshot nor events.
    /// With `use_cache == false` both the entity and the snapshot are read
    /// from the store.
    pub(crate) async fn load<S: State>(
        &self,
        bucket: &str,
        id: &Id,
        parents: &[Parent],
        use_cache: bool,
    ) -> Result<Option<Entity<S>>, StoreError> {
        let key = self.stream_key::<S>(StreamType::Domain, bucket, id, parents);
        if use_cache && let Some(entity) = self.shared.cache.retrieve::<Entity<S>>(&key) {
            tracing::debug!(stream = %key, "entity served from cache");
            return Ok(Some(entity));
        }

        let snapshot = self
            .shared
            .snapshots
            .load::<S>(bucket, id, parents, use_cache)
            .await?;
        let from = snapshot.as_ref().map(|s| s.version + 1);
        let events = self.shared.store.get_events(&key, from, None).await?;
        if snapshot.is_none() && events.is_empty() {
            return Ok(None);
        }

        let entity = EntityFactory::<S>::new().hydrate(
            bucket,
            id.clone(),
            parents.to_vec(),
            snapshot,
            &events,
        );
        if use_cache {
            self.shared.cache.cache(&key, entity.clone(), None);
        }
        Ok(Some(entity))
    }

    /// Write everything the entity holds for this unit of work.
    ///
    /// Domain events go to the domain stream with `expected`; the cache
    /// entry is evicted as soon as that write is through. Stored
    /// out-of-band events then go to their side streams, every event is
    /// dispatched, the entity is marked committed and, if its policy
    /// fires, a snapshot is written.
    ///
    /// On error the entity is left untouched.
    pub(crate) async fn persist<S: State>(
        &self,
        entity: &mut Entity<S>,
        ctx: &CommitContext,
        expected: ExpectedVersion,
    ) -> Result<Persisted, CommitError> {
        let key = self.entity_stream_key(StreamType::Domain, entity);
        let commit_headers = ctx.commit_headers();
        let store = &self.shared.store;

        let domain = entity
            .uncommitted()
            .iter()
            .enumerate()
            .map(|(i, full)| {
                propose(full, full.event_id.unwrap_or_else(|| event_id(ctx.commit_id, i)))
            })
            .collect::<Result<Vec<ProposedEvent>, _>>()?;

        let mut persisted = Persisted {
            version: entity.version(),
            duplicate: false,
        };
        if !domain.is_empty() {
            match store
                .write_events(&key, domain.clone(), &commit_headers, expected)
                .await
            {
                Ok(version) => persisted.version = version,
                Err(StoreError::DuplicateCommit { .. }) => {
                    tracing::info!(
                        stream = %key,
                        commit_id = %ctx.commit_id,
                        "commit already written"
                    );
                    persisted.duplicate = true;
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.shared.cache.evict(&key);

        // Out-of-band events: one side stream per oob id, in raise order.
        let mut side_streams: Vec<SideStream> = Vec::new();
        for (j, oob) in entity.oob_events().iter().enumerate() {
            let side_key = self.oob_stream_key::<S>(
                entity.bucket(),
                entity.id(),
                entity.parents(),
                &oob.oob_id,
            );
            let (event_type, payload) = encode_event(&oob.event)?;
            let proposed = ProposedEvent {
                event_id: event_id(ctx.commit_id, domain.len() + j),
                event_type,
                payload,
                descriptor: entity.descriptor(
                    StreamType::Oob,
                    entity.version(),
                    oob.tagged_headers(),
                ),
            };
            let idx = match side_streams.iter().position(|s| s.key == side_key) {
                Some(i) => i,
                None => {
                    side_streams.push(SideStream::new(side_key));
                    side_streams.len() - 1
                }
            };
            let side = &mut side_streams[idx];
            if !oob.transient {
                side.stored.push(proposed.clone());
                if let Some(days) = oob.days_to_live {
                    side.days_to_live = Some(side.days_to_live.map_or(days, |d| d.max(days)));
                }
            }
            side.dispatched.push(proposed);
        }
        for side in &side_streams {
            if side.stored.is_empty() {
                continue;
            }
            match store
                .write_events(&side.key, side.stored.clone(), &commit_headers, ExpectedVersion::Any)
                .await
            {
                Ok(_) | Err(StoreError::DuplicateCommit { .. }) => {}
                Err(e) => return Err(e.into()),
            }
            if let Some(days) = side.days_to_live {
                store
                    .set_max_age(&side.key, Duration::from_secs(u64::from(days) * 86_400))
                    .await?;
            }
        }

        if !domain.is_empty() {
            let outgoing: Vec<OutgoingEvent> = domain
                .iter()
                .map(|p| OutgoingEvent::from_proposed(p, &commit_headers))
                .collect();
            self.dispatch(&key, &outgoing).await?;
        }
        for side in &side_streams {
            let outgoing: Vec<OutgoingEvent> = side
                .dispatched
                .iter()
                .map(|p| OutgoingEvent::from_proposed(p, &commit_headers))
                .collect();
            self.dispatch(&side.key, &outgoing).await?;
        }

        entity.mark_committed(persisted.version);
        tracing::debug!(
            stream = %key,
            version = persisted.version,
            duplicate = persisted.duplicate,
            oob = side_streams.len(),
            "entity persisted"
        );

        if !persisted.duplicate && entity.snapshot_pending() {
            let snapshot = entity.capture_snapshot();
            match self.shared.snapshots.write_snapshot(&snapshot, &commit_headers).await {
                Ok(()) => entity.set_snapshot(snapshot),
                Err(e) => tracing::warn!(
                    stream = %key,
                    version = snapshot.version,
                    error = %e,
                    "snapshot write failed; entity will replay from events"
                ),
            }
        }
        Ok(persisted)
    }

    async fn dispatch(&self, stream: &str, events: &[OutgoingEvent]) -> Result<(), CommitError> {
        self.shared
            .dispatcher
            .dispatch(stream, events)
            .await
            .map_err(|e| {
                tracing::error!(
                    stream = %stream,
                    count = events.len(),
                    error = %e,
                    "dispatch failed"
                );
                CommitError::Dispatch(e)
            })
    }
}

/// Builder for configuring and opening an [`Engine`].
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use eventfold_uow::{EngineBuilder, MemoryStore};
///
/// let engine = EngineBuilder::new(Arc::new(MemoryStore::new()))
///     .verify_reads(false)
///     .start_sweeper(false)
///     .open();
/// assert!(!engine.verify_reads());
/// ```
pub struct EngineBuilder {
    store: Arc<dyn EventStore>,
    cache: Option<Arc<TieredCache>>,
    cache_config: CacheConfig,
    keys: StreamKeyFn,
    dispatcher: Arc<dyn Dispatcher>,
    freeze: FreezeConfig,
    weak: WeakConfig,
    verify_reads: bool,
    start_sweeper: bool,
}

impl EngineBuilder {
    /// Create a builder with default settings over `store`.
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            cache: None,
            cache_config: CacheConfig::default(),
            keys: Arc::new(default_stream_key),
            dispatcher: Arc::new(NullDispatcher),
            freeze: FreezeConfig::default(),
            weak: WeakConfig::default(),
            verify_reads: true,
            start_sweeper: true,
        }
    }

    /// Use an existing cache, e.g. one shared with another engine.
    ///
    /// Overrides [`cache_config`](EngineBuilder::cache_config). Only one of
    /// the engines sharing a cache should start its sweeper.
    pub fn cache(mut self, cache: Arc<TieredCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Sweep cadence of the cache the engine creates.
    pub fn cache_config(mut self, config: CacheConfig) -> Self {
        self.cache_config = config;
        self
    }

    /// Replace the stream-key derivation.
    ///
    /// # Arguments
    ///
    /// * `keys` - Deterministic function from stream identity to key. Must
    ///   not collide across entity types sharing a bucket.
    pub fn stream_keys(
        mut self,
        keys: impl Fn(&StreamIdentity<'_>) -> String + Send + Sync + 'static,
    ) -> Self {
        self.keys = Arc::new(keys);
        self
    }

    /// Publisher for committed events. Defaults to [`NullDispatcher`].
    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Freeze acquisition settings for strong and weak resolution.
    pub fn freeze_config(mut self, config: FreezeConfig) -> Self {
        self.freeze = config;
        self
    }

    /// Weak resolver settings.
    pub fn weak_config(mut self, config: WeakConfig) -> Self {
        self.weak = config;
        self
    }

    /// Check read-only entities against the store on commit. Default `true`.
    pub fn verify_reads(mut self, verify: bool) -> Self {
        self.verify_reads = verify;
        self
    }

    /// Run the periodic cache sweep in the background. Default `true`.
    ///
    /// Without a tokio runtime the sweeper is not started; call
    /// [`TieredCache::sweep`] yourself.
    pub fn start_sweeper(mut self, start: bool) -> Self {
        self.start_sweeper = start;
        self
    }

    /// Open the engine.
    pub fn open(self) -> Engine {
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(TieredCache::new(self.cache_config)));
        let sweeper = if self.start_sweeper {
            match tokio::runtime::Handle::try_current() {
                Ok(_) => Some(cache.spawn_sweeper()),
                Err(_) => {
                    tracing::warn!("no tokio runtime; cache sweeper not started");
                    None
                }
            }
        } else {
            None
        };

        Engine {
            shared: Arc::new(Shared {
                snapshots: SnapshotStore::new(self.store.clone(), cache.clone(), self.keys.clone()),
                delayed: DelayedQueue::new(self.store.clone()),
                store: self.store,
                cache,
                keys: self.keys,
                dispatcher: self.dispatcher,
                freeze: self.freeze,
                weak: self.weak,
                verify_reads: self.verify_reads,
                sweeper,
            }),
        }
    }
}
