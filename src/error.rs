//! Crate-level error types for log-store access, commits and conflict
//! resolution.

/// Error returned by an [`EventStore`](crate::EventStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Expected version mismatch.
    ///
    /// The central, expected error of optimistic concurrency: another
    /// writer appended to the stream since it was read. `actual` is `None`
    /// when the stream does not exist.
    #[error("version conflict on {stream}: expected {expected}, actual {actual:?}")]
    VersionConflict {
        /// Stream key.
        stream: String,
        /// Expected version sent with the write.
        expected: String,
        /// Version found in the store.
        actual: Option<u64>,
    },

    /// The events of this commit were already durably written.
    #[error("commit already written to {stream}")]
    DuplicateCommit {
        /// Stream key.
        stream: String,
    },

    /// Another owner holds the freeze marker on the stream.
    #[error("stream {stream} is frozen by another writer")]
    Frozen {
        /// Stream key.
        stream: String,
    },

    /// Transient store or I/O failure unrelated to versioning.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// An event or snapshot could not be encoded.
    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error returned by a [`Dispatcher`](crate::Dispatcher).
#[derive(Debug, thiserror::Error)]
#[error("dispatch failed: {0}")]
pub struct DispatchError(pub String);

/// Signal returned by a state's conflict handler.
///
/// Distinct from the routing failure [`ResolveError::Unhandled`]:
/// `Abandon` is a deliberate decision by user code.
#[derive(Debug, thiserror::Error)]
pub enum ConflictError {
    /// No conflict handler for this event type.
    #[error("no conflict handler")]
    Unhandled,

    /// Drop this event from the merge.
    #[error("event discarded")]
    Discard,

    /// Stop the whole resolution.
    #[error("conflict abandoned: {reason}")]
    Abandon {
        /// Why user code gave up.
        reason: String,
    },
}

/// Error returned when a conflict resolver cannot produce a committable
/// result.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// The Throw strategy refuses every conflict.
    #[error("conflicts are not resolved for this entity type")]
    Rejected,

    /// A conflicting event had no conflict handler.
    #[error("no conflict handler for event {event_type}")]
    Unhandled {
        /// Type tag of the event.
        event_type: String,
    },

    /// A conflict handler abandoned the resolution.
    #[error("conflict abandoned: {reason}")]
    Abandoned {
        /// Reason given by the handler.
        reason: String,
    },

    /// The freeze marker could not be acquired within the retry budget.
    #[error("stream {stream} stayed frozen by another resolver")]
    Frozen {
        /// Stream key.
        stream: String,
    },

    /// The unit of work was cancelled while waiting.
    #[error("resolution cancelled")]
    Cancelled,

    /// The store failed during resolution.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Merged events were written but could not be dispatched.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Error returned by [`Repository`](crate::Repository) operations.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// The entity has no events and no snapshot.
    ///
    /// Expected and recoverable; callers doing get-or-create catch it.
    #[error("entity {stream} not found")]
    NotFound {
        /// Stream key.
        stream: String,
    },

    /// A brand-new entity collided with an existing stream.
    #[error("entity {stream} already exists")]
    EntityAlreadyExists {
        /// Stream key.
        stream: String,
    },

    /// The conflict resolver could not produce a committable result.
    #[error("conflict resolution failed for {stream}: {source}")]
    ConflictResolutionFailed {
        /// Stream key.
        stream: String,
        /// Underlying cause.
        #[source]
        source: ResolveError,
    },

    /// Transient store failure. Not retried here.
    #[error(transparent)]
    Persistence(#[from] StoreError),

    /// A read-only entity was changed by another writer before commit.
    #[error("stale read of {stream}: loaded at {expected}, store at {actual}")]
    StaleRead {
        /// Stream key.
        stream: String,
        /// Version the entity was loaded at.
        expected: u64,
        /// Version currently in the store.
        actual: u64,
    },

    /// Events were written but could not be dispatched.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// The unit of work was cancelled before commit.
    #[error("unit of work cancelled")]
    Cancelled,
}

impl RepositoryError {
    /// Whether this is [`RepositoryError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
