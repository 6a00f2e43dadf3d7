//! The `State` trait: how events project onto an entity's fields.

use serde::{Serialize, de::DeserializeOwned};

use crate::error::ConflictError;
use crate::resolver::ConflictStrategy;

/// Result of routing one event to a state's handler table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// A handler existed and ran.
    Handled,
    /// The state has no handler for this event; nothing changed.
    Unhandled,
}

/// In-memory projection of an entity's events onto its fields.
///
/// The implementing type is the state itself. Routing is an explicit
/// `match` over [`Event`](State::Event): one arm per event type, built at
/// compile time.
///
/// # Contract
///
/// - [`apply`](State::apply) folds one event into the state. It is not
///   idempotent; the entity's version bookkeeping guarantees each event is
///   applied once. Returning [`Route::Unhandled`] is allowed and only logged.
/// - [`conflict`](State::conflict) is consulted for every local event that
///   is replayed on top of newer remote events during strong or weak
///   conflict resolution. It sees the merged state but cannot change it:
///   `Ok(())` accepts the event (it is then applied normally),
///   [`ConflictError::Discard`] drops it, and [`ConflictError::Abandon`]
///   aborts the whole resolution. The default
///   returns [`ConflictError::Unhandled`], which fails resolution hard.
/// - [`should_snapshot`](State::should_snapshot) is evaluated after every
///   successful write.
pub trait State: Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Identifies this entity type (e.g. `"account"`). Part of every stream key.
    const ENTITY_TYPE: &'static str;

    /// The set of events this state can apply.
    type Event: Serialize + DeserializeOwned + Clone + std::fmt::Debug + Send + Sync + 'static;

    /// Apply one event.
    fn apply(&mut self, event: &Self::Event) -> Route;

    /// React to a local event that conflicts with concurrent remote events.
    fn conflict(&self, event: &Self::Event) -> Result<(), ConflictError> {
        let _ = event;
        Err(ConflictError::Unhandled)
    }

    /// Whether a snapshot should be taken at `version`.
    ///
    /// `last_snapshot` is the version of the newest known snapshot.
    fn should_snapshot(&self, version: u64, last_snapshot: Option<u64>) -> bool {
        let _ = (version, last_snapshot);
        false
    }

    /// Conflict strategy used by repositories of this type unless overridden.
    fn conflict_strategy() -> ConflictStrategy {
        ConflictStrategy::Throw
    }
}
