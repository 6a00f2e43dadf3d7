//! Snapshot records and their persistence in the log store.
//!
//! Each entity has a snapshot side stream. A snapshot is appended to it
//! with `ExpectedVersion::Any` and the stream is then truncated so only
//! the newest record stays readable. Reads fetch the last event backward
//! and go through the [`TieredCache`].

use std::sync::Arc;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::cache::TieredCache;
use crate::error::StoreError;
use crate::event::{EventDescriptor, Headers, ProposedEvent, StreamType};
use crate::id::{Id, Parent};
use crate::state::State;
use crate::store::{EventStore, ExpectedVersion};
use crate::stream::{StreamIdentity, StreamKeyFn};

/// Event type tag of snapshot records.
pub const SNAPSHOT_EVENT_TYPE: &str = "Snapshot";

/// A point-in-time capture of an entity's state.
///
/// `version` is the version of the last event folded into `payload`;
/// events with version `<= version` are redundant for replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "S: Serialize", deserialize = "S: DeserializeOwned"))]
pub struct Snapshot<S> {
    /// Logical namespace of the entity.
    pub bucket: String,
    /// Entity identifier.
    pub stream_id: Id,
    /// Ancestors, root first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<Parent>,
    /// Version of the last event reflected in `payload`.
    pub version: u64,
    /// Entity type name.
    pub entity_type: String,
    /// Capture time, Unix epoch milliseconds.
    pub timestamp: u64,
    /// The captured state.
    pub payload: S,
}

/// Reads and writes snapshots through an [`EventStore`].
#[derive(Clone)]
pub struct SnapshotStore {
    store: Arc<dyn EventStore>,
    cache: Arc<TieredCache>,
    keys: StreamKeyFn,
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore").finish_non_exhaustive()
    }
}

impl SnapshotStore {
    /// Create a snapshot store over `store`, caching in `cache`.
    pub fn new(store: Arc<dyn EventStore>, cache: Arc<TieredCache>, keys: StreamKeyFn) -> Self {
        Self { store, cache, keys }
    }

    /// Stream key of the snapshot stream of an entity.
    pub fn stream_key<S: State>(&self, bucket: &str, id: &Id, parents: &[Parent]) -> String {
        (self.keys)(&StreamIdentity {
            entity_type: S::ENTITY_TYPE,
            stream_type: StreamType::Snapshot,
            bucket,
            id,
            parents,
        })
    }

    /// Newest snapshot of an entity, if any.
    ///
    /// A record that no longer deserializes into `S` is logged and treated
    /// as absent, so the entity is rebuilt from its events.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store read fails.
    pub async fn get_snapshot<S: State>(
        &self,
        bucket: &str,
        id: &Id,
        parents: &[Parent],
    ) -> Result<Option<Snapshot<S>>, StoreError> {
        self.load(bucket, id, parents, true).await
    }

    pub(crate) async fn load<S: State>(
        &self,
        bucket: &str,
        id: &Id,
        parents: &[Parent],
        use_cache: bool,
    ) -> Result<Option<Snapshot<S>>, StoreError> {
        let key = self.stream_key::<S>(bucket, id, parents);
        if use_cache && let Some(cached) = self.cache.retrieve::<Option<Snapshot<S>>>(&key) {
            return Ok(cached);
        }

        let latest = self.store.get_events_backward(&key, None, Some(1)).await?;
        let snapshot = match latest.first() {
            Some(record) => match serde_json::from_value::<Snapshot<S>>(record.payload.clone()) {
                Ok(snap) => Some(snap),
                Err(e) => {
                    tracing::warn!(
                        stream = %key,
                        error = %e,
                        "failed to deserialize snapshot; replaying from events"
                    );
                    None
                }
            },
            None => None,
        };
        if use_cache {
            self.cache.cache(&key, snapshot.clone(), None);
        }
        Ok(snapshot)
    }

    /// Persist `snapshot` as the newest snapshot of its entity.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if encoding or the store write fails.
    pub async fn write_snapshot<S: State>(
        &self,
        snapshot: &Snapshot<S>,
        commit_headers: &Headers,
    ) -> Result<(), StoreError> {
        let key = self.stream_key::<S>(&snapshot.bucket, &snapshot.stream_id, &snapshot.parents);
        let proposed = ProposedEvent {
            event_id: Uuid::new_v4(),
            event_type: SNAPSHOT_EVENT_TYPE.to_owned(),
            payload: serde_json::to_value(snapshot)?,
            descriptor: EventDescriptor {
                entity_type: snapshot.entity_type.clone(),
                stream_type: StreamType::Snapshot,
                bucket: snapshot.bucket.clone(),
                stream_id: snapshot.stream_id.clone(),
                parents: snapshot.parents.clone(),
                version: snapshot.version,
                timestamp: snapshot.timestamp,
                headers: Headers::new(),
                commit_headers: Headers::new(),
            },
        };
        let written = self
            .store
            .write_events(&key, vec![proposed], commit_headers, ExpectedVersion::Any)
            .await?;
        self.cache.evict(&key);
        self.store.set_truncate_before(&key, written).await?;
        tracing::debug!(stream = %key, version = snapshot.version, "snapshot written");
        Ok(())
    }
}
