//! Event-sourced entity: a [`State`] plus version bookkeeping and the
//! events raised during the current unit of work.

use uuid::Uuid;

use crate::error::ConflictError;
use crate::event::{
    EventDescriptor, FullEvent, Headers, RecordedEvent, StreamType, decode_recorded, now_millis,
};
use crate::id::{Id, Parent};
use crate::snapshot::Snapshot;
use crate::state::{Route, State};

/// Version of an entity whose stream has no events yet.
///
/// Stream versions are 1-based, so the first committed event has version 1.
pub const NEW_VERSION: u64 = 0;

/// Header naming the side stream of an out-of-band event.
pub const OOB_ID_HEADER: &str = "Aggregates.OobId";
/// Header marking an out-of-band event as dispatch-only.
pub const OOB_TRANSIENT_HEADER: &str = "Aggregates.Transient";
/// Header carrying the retention of an out-of-band event, in days.
pub const OOB_DAYS_TO_LIVE_HEADER: &str = "Aggregates.DaysToLive";

/// An out-of-band event raised on an entity.
///
/// OOB events are published alongside the entity but never replayed into
/// its state, so they never advance its version.
#[derive(Debug, Clone)]
pub struct OobEvent<E> {
    /// The event.
    pub event: E,
    /// Name of the side stream the event belongs to.
    pub oob_id: String,
    /// Transient events are dispatched but not stored.
    pub transient: bool,
    /// Retention of the stored event, in days. `None` keeps it forever.
    pub days_to_live: Option<u32>,
    /// Per-event headers.
    pub headers: Headers,
}

impl<E> OobEvent<E> {
    /// Per-event headers plus the out-of-band parameters.
    pub(crate) fn tagged_headers(&self) -> Headers {
        let mut headers = self.headers.clone();
        headers.insert(OOB_ID_HEADER.into(), self.oob_id.clone());
        headers.insert(OOB_TRANSIENT_HEADER.into(), self.transient.to_string());
        if let Some(days) = self.days_to_live {
            headers.insert(OOB_DAYS_TO_LIVE_HEADER.into(), days.to_string());
        }
        headers
    }
}

/// An entity tracked by a [`Repository`](crate::Repository).
///
/// Wraps exactly one state. Applying an event changes the state at once
/// and records the event as uncommitted; committing hands the uncommitted
/// events to the log store with the version the entity was loaded at as
/// expected version.
///
/// # Versions
///
/// - [`committed_version`](Entity::committed_version) is the version of the
///   last event read from or written to the store ([`NEW_VERSION`] for a
///   stream without events).
/// - [`version`](Entity::version) additionally counts uncommitted domain
///   events: `N` applies on a fresh load give `committed_version() + N`.
#[derive(Debug, Clone)]
pub struct Entity<S: State> {
    id: Id,
    bucket: String,
    parents: Vec<Parent>,
    committed_version: u64,
    state: S,
    snapshot: Option<Snapshot<S>>,
    uncommitted: Vec<FullEvent<S::Event>>,
    oob: Vec<OobEvent<S::Event>>,
}

impl<S: State> Entity<S> {
    pub(crate) fn new(bucket: String, id: Id, parents: Vec<Parent>) -> Self {
        Self {
            id,
            bucket,
            parents,
            committed_version: NEW_VERSION,
            state: S::default(),
            snapshot: None,
            uncommitted: Vec::new(),
            oob: Vec::new(),
        }
    }

    /// Start from a snapshot: the state is a copy of its payload.
    pub(crate) fn from_snapshot(
        bucket: String,
        id: Id,
        parents: Vec<Parent>,
        snapshot: Snapshot<S>,
    ) -> Self {
        let mut entity = Self::new(bucket, id, parents);
        entity.committed_version = snapshot.version;
        entity.state = snapshot.payload.clone();
        entity.snapshot = Some(snapshot);
        entity
    }

    /// Entity identifier.
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Logical namespace.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Ancestors, root first.
    pub fn parents(&self) -> &[Parent] {
        &self.parents
    }

    /// Current state.
    pub fn state(&self) -> &S {
        &self.state
    }

    /// Version including uncommitted domain events.
    pub fn version(&self) -> u64 {
        self.committed_version + self.uncommitted.len() as u64
    }

    /// Version of the last event known to be in the store.
    pub fn committed_version(&self) -> u64 {
        self.committed_version
    }

    /// `true` while the stream has no committed events.
    pub fn is_new(&self) -> bool {
        self.committed_version == NEW_VERSION
    }

    /// Uncommitted domain events, in apply order.
    pub fn uncommitted(&self) -> &[FullEvent<S::Event>] {
        &self.uncommitted
    }

    /// Uncommitted out-of-band events, in raise order.
    pub fn oob_events(&self) -> &[OobEvent<S::Event>] {
        &self.oob
    }

    /// Newest snapshot this entity was loaded from or wrote.
    pub fn snapshot(&self) -> Option<&Snapshot<S>> {
        self.snapshot.as_ref()
    }

    /// `true` if the state's snapshot policy fires at the current version.
    pub fn snapshot_pending(&self) -> bool {
        let version = self.version();
        version > NEW_VERSION
            && self
                .snapshot
                .as_ref()
                .is_none_or(|s| s.version < version)
            && self
                .state
                .should_snapshot(version, self.snapshot.as_ref().map(|s| s.version))
    }

    /// `true` if there are uncommitted domain events or a pending snapshot.
    ///
    /// Out-of-band events do not make an entity dirty.
    pub fn is_dirty(&self) -> bool {
        !self.uncommitted.is_empty() || self.snapshot_pending()
    }

    /// Apply a domain event.
    ///
    /// The state changes immediately and the event is recorded as
    /// uncommitted with the next version. An event the state has no
    /// handler for is recorded anyway and only logged.
    pub fn apply(&mut self, event: S::Event) {
        self.apply_with(event, Headers::new());
    }

    /// Apply a domain event carrying per-event headers.
    pub fn apply_with(&mut self, event: S::Event, headers: Headers) {
        self.record(event, headers, None);
    }

    fn record(&mut self, event: S::Event, headers: Headers, event_id: Option<Uuid>) {
        if self.state.apply(&event) == Route::Unhandled {
            tracing::debug!(
                entity_type = S::ENTITY_TYPE,
                stream_id = %self.id,
                event = ?event,
                "no apply handler; state unchanged"
            );
        }
        let descriptor = self.descriptor(StreamType::Domain, self.version() + 1, headers);
        self.uncommitted.push(FullEvent {
            event_id,
            descriptor,
            event,
        });
    }

    /// Raise an out-of-band event.
    ///
    /// The event does not touch the state or the version. On commit it is
    /// written to the side stream named `oob_id` (unless `transient`) and
    /// dispatched.
    ///
    /// # Arguments
    ///
    /// * `event` - The event to publish.
    /// * `oob_id` - Name of the side stream.
    /// * `transient` - Dispatch only, never store.
    /// * `days_to_live` - Retention of the stored event; `None` keeps it.
    pub fn raise(
        &mut self,
        event: S::Event,
        oob_id: impl Into<String>,
        transient: bool,
        days_to_live: Option<u32>,
    ) {
        self.oob.push(OobEvent {
            event,
            oob_id: oob_id.into(),
            transient,
            days_to_live,
            headers: Headers::new(),
        });
    }

    pub(crate) fn raise_oob(&mut self, oob: OobEvent<S::Event>) {
        self.oob.push(oob);
    }

    /// Fold one event read from the store into the state.
    ///
    /// Events the state cannot decode still advance the version so that the
    /// next write uses the store's expected version.
    pub(crate) fn fold_committed(&mut self, recorded: &RecordedEvent) {
        debug_assert!(self.uncommitted.is_empty());
        match decode_recorded::<S::Event>(recorded) {
            Some(full) => {
                if self.state.apply(&full.event) == Route::Unhandled {
                    tracing::debug!(
                        entity_type = S::ENTITY_TYPE,
                        event_type = %recorded.event_type,
                        "no apply handler during replay"
                    );
                }
            }
            None => tracing::warn!(
                entity_type = S::ENTITY_TYPE,
                stream = %recorded.stream,
                event_type = %recorded.event_type,
                version = recorded.stream_version,
                "unknown event type; skipped during replay"
            ),
        }
        self.committed_version = recorded.stream_version;
    }

    /// Replay a conflicting local event through the state's conflict
    /// handler, then apply it if accepted.
    ///
    /// An event that already has an id keeps it, so writing it twice is
    /// caught as a duplicate commit.
    pub(crate) fn apply_conflicting(
        &mut self,
        event: FullEvent<S::Event>,
    ) -> Result<(), ConflictError> {
        self.state.conflict(&event.event)?;
        self.record(event.event, event.descriptor.headers, event.event_id);
        Ok(())
    }

    /// Record a successful write: everything uncommitted is now in the store.
    pub(crate) fn mark_committed(&mut self, version: u64) {
        self.committed_version = version;
        self.uncommitted.clear();
        self.oob.clear();
    }

    /// Capture the state at the committed version.
    pub(crate) fn capture_snapshot(&self) -> Snapshot<S> {
        Snapshot {
            bucket: self.bucket.clone(),
            stream_id: self.id.clone(),
            parents: self.parents.clone(),
            version: self.committed_version,
            entity_type: S::ENTITY_TYPE.to_owned(),
            timestamp: now_millis(),
            payload: self.state.clone(),
        }
    }

    pub(crate) fn set_snapshot(&mut self, snapshot: Snapshot<S>) {
        self.snapshot = Some(snapshot);
    }

    pub(crate) fn descriptor(
        &self,
        stream_type: StreamType,
        version: u64,
        headers: Headers,
    ) -> EventDescriptor {
        EventDescriptor {
            entity_type: S::ENTITY_TYPE.to_owned(),
            stream_type,
            bucket: self.bucket.clone(),
            stream_id: self.id.clone(),
            parents: self.parents.clone(),
            version,
            timestamp: now_millis(),
            headers,
            commit_headers: Headers::new(),
        }
    }
}
