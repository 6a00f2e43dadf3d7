//! The log store interface consumed by the engine.
//!
//! Every durable byte lives behind [`EventStore`]: domain streams, the
//! out-of-band side streams, snapshot streams and the delayed queue. The
//! engine only needs append-with-expected-version, forward and backward
//! reads, two pieces of stream metadata and an advisory freeze marker.
//! [`MemoryStore`](crate::MemoryStore) is the in-process implementation.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::event::{Headers, ProposedEvent, RecordedEvent};

/// Expected stream version for optimistic concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Accept any current stream version (no concurrency check).
    Any,
    /// The stream must not exist yet (first write).
    NoStream,
    /// The stream must be at exactly this version.
    Exact(u64),
}

impl ExpectedVersion {
    /// Expected version for an entity loaded at `version`.
    ///
    /// [`NEW_VERSION`](crate::NEW_VERSION) maps to [`ExpectedVersion::NoStream`].
    pub fn from_loaded(version: u64) -> Self {
        if version == crate::entity::NEW_VERSION {
            Self::NoStream
        } else {
            Self::Exact(version)
        }
    }

    /// Whether a stream at `current` (`None` if absent) satisfies this
    /// expectation.
    pub fn matches(self, current: Option<u64>) -> bool {
        match self {
            Self::Any => true,
            Self::NoStream => current.is_none(),
            Self::Exact(v) => current == Some(v),
        }
    }
}

impl std::fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Any => f.write_str("any"),
            Self::NoStream => f.write_str("no-stream"),
            Self::Exact(v) => write!(f, "{v}"),
        }
    }
}

/// Append-only, versioned log store.
///
/// Stream versions are 1-based: the first event of a stream has version 1.
/// A stream exists once it has had at least one event appended, even if
/// metadata later hides every event from reads.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append `events` to `stream` if its version matches `expected`.
    ///
    /// `commit_headers` are stamped onto every event's descriptor. Events
    /// are appended atomically, in order.
    ///
    /// # Returns
    ///
    /// The stream version after the append.
    ///
    /// # Errors
    ///
    /// - [`StoreError::DuplicateCommit`] if the first event id is already in
    ///   the stream (checked before the version).
    /// - [`StoreError::VersionConflict`] on an expected-version mismatch.
    /// - [`StoreError::Persistence`] on transient failures.
    async fn write_events(
        &self,
        stream: &str,
        events: Vec<ProposedEvent>,
        commit_headers: &Headers,
        expected: ExpectedVersion,
    ) -> Result<u64, StoreError>;

    /// Read events with version `>= from` (from the start if `None`),
    /// oldest first, at most `count`.
    ///
    /// A missing stream reads as empty.
    async fn get_events(
        &self,
        stream: &str,
        from: Option<u64>,
        count: Option<usize>,
    ) -> Result<Vec<RecordedEvent>, StoreError>;

    /// Read events with version `<= from` (from the end if `None`), newest
    /// first, at most `count`.
    async fn get_events_backward(
        &self,
        stream: &str,
        from: Option<u64>,
        count: Option<usize>,
    ) -> Result<Vec<RecordedEvent>, StoreError>;

    /// Current version of `stream`, `None` if it has no events.
    async fn stream_version(&self, stream: &str) -> Result<Option<u64>, StoreError>;

    /// Hide events older than `max_age` from reads.
    async fn set_max_age(&self, stream: &str, max_age: Duration) -> Result<(), StoreError>;

    /// Hide events with version `< version` from reads.
    async fn set_truncate_before(&self, stream: &str, version: u64) -> Result<(), StoreError>;

    /// Mark `stream` as owned by `owner` for at most `ttl`.
    ///
    /// Re-freezing by the same owner extends the marker.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Frozen`] if another owner holds an unexpired
    /// marker.
    async fn freeze(&self, stream: &str, owner: Uuid, ttl: Duration) -> Result<(), StoreError>;

    /// Release the freeze marker if `owner` holds it.
    async fn unfreeze(&self, stream: &str, owner: Uuid) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_loaded_maps_new_to_no_stream() {
        assert_eq!(ExpectedVersion::from_loaded(0), ExpectedVersion::NoStream);
        assert_eq!(ExpectedVersion::from_loaded(3), ExpectedVersion::Exact(3));
    }

    #[test]
    fn matches_current_version() {
        assert!(ExpectedVersion::Any.matches(None));
        assert!(ExpectedVersion::Any.matches(Some(9)));
        assert!(ExpectedVersion::NoStream.matches(None));
        assert!(!ExpectedVersion::NoStream.matches(Some(1)));
        assert!(ExpectedVersion::Exact(2).matches(Some(2)));
        assert!(!ExpectedVersion::Exact(2).matches(Some(3)));
        assert!(!ExpectedVersion::Exact(2).matches(None));
    }

    #[test]
    fn display_is_readable() {
        assert_eq!(ExpectedVersion::NoStream.to_string(), "no-stream");
        assert_eq!(ExpectedVersion::Exact(4).to_string(), "4");
    }
}
