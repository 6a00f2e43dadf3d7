//! Entity factory: creates new entities and rebuilds existing ones.

use std::marker::PhantomData;

use crate::entity::Entity;
use crate::event::RecordedEvent;
use crate::id::{Id, Parent};
use crate::snapshot::Snapshot;
use crate::state::State;

/// Builds [`Entity`] values for one state type.
///
/// Stateless; construction is free.
#[derive(Debug)]
pub struct EntityFactory<S>(PhantomData<fn() -> S>);

impl<S> Default for EntityFactory<S> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<S> Clone for EntityFactory<S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for EntityFactory<S> {}

impl<S: State> EntityFactory<S> {
    /// Create a factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// A brand-new entity at [`NEW_VERSION`](crate::NEW_VERSION) with
    /// default state.
    pub fn create(&self, bucket: &str, id: Id, parents: Vec<Parent>) -> Entity<S> {
        Entity::new(bucket.to_owned(), id, parents)
    }

    /// Rebuild an entity from an optional snapshot plus the events after it.
    ///
    /// `events` must be in version order. Events at or below the snapshot
    /// version are skipped, so passing the whole stream is safe.
    ///
    /// # Arguments
    ///
    /// * `bucket` - Logical namespace.
    /// * `id` - Entity identifier.
    /// * `parents` - Ancestors, root first.
    /// * `snapshot` - Newest known snapshot, if any.
    /// * `events` - Recorded events of the domain stream.
    pub fn hydrate(
        &self,
        bucket: &str,
        id: Id,
        parents: Vec<Parent>,
        snapshot: Option<Snapshot<S>>,
        events: &[RecordedEvent],
    ) -> Entity<S> {
        let mut entity = match snapshot {
            Some(snap) => Entity::from_snapshot(bucket.to_owned(), id, parents, snap),
            None => Entity::new(bucket.to_owned(), id, parents),
        };
        let floor = entity.committed_version();
        for recorded in events.iter().filter(|e| e.stream_version > floor) {
            entity.fold_committed(recorded);
        }
        tracing::debug!(
            entity_type = S::ENTITY_TYPE,
            stream_id = %entity.id(),
            version = entity.committed_version(),
            replayed = events.len(),
            "entity hydrated"
        );
        entity
    }
}
