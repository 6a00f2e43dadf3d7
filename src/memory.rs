//! In-process [`EventStore`] implementation.
//!
//! Holds every stream in a `HashMap` behind a mutex. Used by tests and
//! demos, and as the reference for what a networked store must do:
//! duplicate-commit detection before the version check, 1-based versions,
//! read-side max-age and truncate-before, and expiring freeze markers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::StoreError;
use crate::event::{Headers, ProposedEvent, RecordedEvent, now_millis};
use crate::store::{EventStore, ExpectedVersion};

#[derive(Debug, Default)]
struct StreamData {
    events: Vec<RecordedEvent>,
    ids: HashSet<Uuid>,
    max_age: Option<Duration>,
    truncate_before: u64,
    frozen: Option<(Uuid, Instant)>,
}

impl StreamData {
    fn version(&self) -> Option<u64> {
        self.events.last().map(|e| e.stream_version)
    }

    fn visible(&self, event: &RecordedEvent, now: u64) -> bool {
        if event.stream_version < self.truncate_before {
            return false;
        }
        match self.max_age {
            Some(age) => {
                let age = u64::try_from(age.as_millis()).unwrap_or(u64::MAX);
                now.saturating_sub(event.recorded_at) <= age
            }
            None => true,
        }
    }
}

/// Thread-safe in-memory log store.
///
/// # Examples
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), eventfold_uow::StoreError> {
/// use eventfold_uow::{EventStore, MemoryStore};
///
/// let store = MemoryStore::new();
/// assert_eq!(store.stream_version("missing").await?, None);
/// assert!(store.get_events("missing", None, None).await?.is_empty());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    streams: Mutex<HashMap<String, StreamData>>,
    reads: AtomicU64,
    writes: AtomicU64,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<String, StreamData>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of read calls served so far.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of write calls received so far, including rejected ones.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Make every subsequent write fail with [`StoreError::Persistence`].
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Every event of `stream`, ignoring metadata. Does not count as a read.
    pub fn all_events(&self, stream: &str) -> Vec<RecordedEvent> {
        self.streams()
            .get(stream)
            .map(|s| s.events.clone())
            .unwrap_or_default()
    }

    /// Keys of all streams that have events, sorted.
    pub fn stream_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .streams()
            .iter()
            .filter(|(_, s)| !s.events.is_empty())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    fn read(
        &self,
        stream: &str,
        forward: bool,
        from: Option<u64>,
        count: Option<usize>,
    ) -> Vec<RecordedEvent> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let streams = self.streams();
        let Some(data) = streams.get(stream) else {
            return Vec::new();
        };
        let now = now_millis();
        let limit = count.unwrap_or(usize::MAX);
        let visible = data.events.iter().filter(|e| data.visible(e, now));
        if forward {
            let from = from.unwrap_or(0);
            visible
                .filter(|e| e.stream_version >= from)
                .take(limit)
                .cloned()
                .collect()
        } else {
            let from = from.unwrap_or(u64::MAX);
            visible
                .rev()
                .filter(|e| e.stream_version <= from)
                .take(limit)
                .cloned()
                .collect()
        }
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn write_events(
        &self,
        stream: &str,
        events: Vec<ProposedEvent>,
        commit_headers: &Headers,
        expected: ExpectedVersion,
    ) -> Result<u64, StoreError> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(StoreError::Persistence("injected write failure".into()));
        }

        let mut streams = self.streams();
        let data = streams.entry(stream.to_owned()).or_default();

        if let Some(first) = events.first()
            && data.ids.contains(&first.event_id)
        {
            return Err(StoreError::DuplicateCommit {
                stream: stream.to_owned(),
            });
        }

        let current = data.version();
        if !expected.matches(current) {
            return Err(StoreError::VersionConflict {
                stream: stream.to_owned(),
                expected: expected.to_string(),
                actual: current,
            });
        }

        let mut version = current.unwrap_or(0);
        let recorded_at = now_millis();
        for proposed in events {
            version += 1;
            let mut descriptor = proposed.descriptor;
            descriptor.commit_headers.extend(
                commit_headers
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
            data.ids.insert(proposed.event_id);
            data.events.push(RecordedEvent {
                event_id: proposed.event_id,
                stream: stream.to_owned(),
                stream_version: version,
                event_type: proposed.event_type,
                payload: proposed.payload,
                descriptor,
                recorded_at,
            });
        }
        Ok(version)
    }

    async fn get_events(
        &self,
        stream: &str,
        from: Option<u64>,
        count: Option<usize>,
    ) -> Result<Vec<RecordedEvent>, StoreError> {
        Ok(self.read(stream, true, from, count))
    }

    async fn get_events_backward(
        &self,
        stream: &str,
        from: Option<u64>,
        count: Option<usize>,
    ) -> Result<Vec<RecordedEvent>, StoreError> {
        Ok(self.read(stream, false, from, count))
    }

    async fn stream_version(&self, stream: &str) -> Result<Option<u64>, StoreError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.streams().get(stream).and_then(StreamData::version))
    }

    async fn set_max_age(&self, stream: &str, max_age: Duration) -> Result<(), StoreError> {
        self.streams().entry(stream.to_owned()).or_default().max_age = Some(max_age);
        Ok(())
    }

    async fn set_truncate_before(&self, stream: &str, version: u64) -> Result<(), StoreError> {
        let mut streams = self.streams();
        let data = streams.entry(stream.to_owned()).or_default();
        data.truncate_before = data.truncate_before.max(version);
        Ok(())
    }

    async fn freeze(&self, stream: &str, owner: Uuid, ttl: Duration) -> Result<(), StoreError> {
        let mut streams = self.streams();
        let data = streams.entry(stream.to_owned()).or_default();
        let now = Instant::now();
        if let Some((holder, until)) = data.frozen
            && holder != owner
            && until > now
        {
            return Err(StoreError::Frozen {
                stream: stream.to_owned(),
            });
        }
        data.frozen = Some((owner, now + ttl));
        Ok(())
    }

    async fn unfreeze(&self, stream: &str, owner: Uuid) -> Result<(), StoreError> {
        if let Some(data) = self.streams().get_mut(stream)
            && data.frozen.is_some_and(|(holder, _)| holder == owner)
        {
            data.frozen = None;
        }
        Ok(())
    }
}
