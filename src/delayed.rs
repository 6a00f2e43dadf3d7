//! Durable queue of deferred conflicting events.
//!
//! The weak resolver parks conflicting events in a per-entity side stream
//! instead of merging them at once. Once they are merged, the queue is
//! truncated behind the last merged event.

use std::sync::Arc;
use std::time::Duration;

use crate::error::StoreError;
use crate::event::{Headers, ProposedEvent, RecordedEvent, now_millis};
use crate::store::{EventStore, ExpectedVersion};

/// Delayed queue stored in the log store.
#[derive(Clone)]
pub struct DelayedQueue {
    store: Arc<dyn EventStore>,
}

impl std::fmt::Debug for DelayedQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayedQueue").finish_non_exhaustive()
    }
}

impl DelayedQueue {
    /// Create a queue over `store`.
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Append events to the queue at `key`.
    ///
    /// Re-deferring the same commit is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub async fn defer(
        &self,
        key: &str,
        events: Vec<ProposedEvent>,
        commit_headers: &Headers,
    ) -> Result<(), StoreError> {
        let count = events.len();
        match self
            .store
            .write_events(key, events, commit_headers, ExpectedVersion::Any)
            .await
        {
            Ok(_) => {
                tracing::debug!(stream = %key, count, "events deferred");
                Ok(())
            }
            Err(StoreError::DuplicateCommit { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Age of the oldest queued event, `None` if the queue is empty.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    pub async fn oldest_age(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let oldest = self.store.get_events(key, None, Some(1)).await?;
        Ok(oldest
            .first()
            .map(|e| Duration::from_millis(now_millis().saturating_sub(e.recorded_at))))
    }

    /// Every queued event, oldest first. The queue is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    pub async fn pending(&self, key: &str) -> Result<Vec<RecordedEvent>, StoreError> {
        self.store.get_events(key, None, None).await
    }

    /// Remove every queued event up to and including `version`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the truncation fails.
    pub async fn acknowledge(&self, key: &str, version: u64) -> Result<(), StoreError> {
        self.store.set_truncate_before(key, version + 1).await
    }
}
