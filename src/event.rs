//! Event envelopes, descriptors, and the encoding of domain events.
//!
//! Domain events are plain serde enums using adjacently tagged
//! serialization (`#[serde(tag = "type", content = "data")]`). On the way
//! to the log store the `"type"` tag becomes [`ProposedEvent::event_type`]
//! and the `"data"` part becomes the JSON payload. No I/O happens here.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::id::{Id, Parent};

/// String-keyed headers carried on events and commits.
pub type Headers = BTreeMap<String, String>;

/// Which stream of an entity an event (or key) belongs to.
///
/// `Domain` events rebuild state; `Oob` events are published alongside the
/// entity but never replayed. `Snapshot` and `Delayed` name the side
/// streams used by the snapshot store and the weak conflict resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamType {
    /// Events that are replayed to rebuild state.
    Domain,
    /// Out-of-band events, published but excluded from replay.
    Oob,
    /// Snapshot records.
    Snapshot,
    /// Conflicting events parked by the weak resolver.
    Delayed,
}

impl StreamType {
    /// Short lowercase tag used in stream keys and headers.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Domain => "domain",
            Self::Oob => "oob",
            Self::Snapshot => "snapshot",
            Self::Delayed => "delayed",
        }
    }
}

/// Everything known about an event besides its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDescriptor {
    /// Entity type name (e.g. `"account"`).
    pub entity_type: String,
    /// Stream the event belongs to.
    pub stream_type: StreamType,
    /// Logical namespace of the entity.
    pub bucket: String,
    /// Entity identifier.
    pub stream_id: Id,
    /// Ancestors of the entity, root first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<Parent>,
    /// Version of this event within its stream (1-based).
    pub version: u64,
    /// Creation time, Unix epoch milliseconds.
    pub timestamp: u64,
    /// Per-event headers.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: Headers,
    /// Headers of the commit that persisted the event.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub commit_headers: Headers,
}

impl EventDescriptor {
    /// Flatten the descriptor into a single header map for dispatch.
    ///
    /// Well-known fields use the `"Aggregates."` prefix, per-event headers
    /// are copied verbatim and commit headers get a `"Commit."` prefix.
    pub fn to_headers(&self) -> Headers {
        let mut out = Headers::new();
        out.insert("Aggregates.EntityType".into(), self.entity_type.clone());
        out.insert("Aggregates.StreamType".into(), self.stream_type.as_str().into());
        out.insert("Aggregates.Bucket".into(), self.bucket.clone());
        out.insert("Aggregates.StreamId".into(), self.stream_id.to_string());
        out.insert("Aggregates.Version".into(), self.version.to_string());
        out.insert("Aggregates.Timestamp".into(), self.timestamp.to_string());
        if !self.parents.is_empty() {
            let parents = self
                .parents
                .iter()
                .map(|p| format!("{}:{}", p.entity_type, p.id))
                .collect::<Vec<_>>()
                .join(",");
            out.insert("Aggregates.Parents".into(), parents);
        }
        for (k, v) in &self.headers {
            out.insert(k.clone(), v.clone());
        }
        for (k, v) in &self.commit_headers {
            out.insert(format!("Commit.{k}"), v.clone());
        }
        out
    }
}

/// A typed domain event with its descriptor.
///
/// `event_id` is `None` while the event is uncommitted; ids are derived
/// from the commit id when the event is persisted.
#[derive(Debug, Clone)]
pub struct FullEvent<E> {
    /// Globally unique id, assigned at commit.
    pub event_id: Option<Uuid>,
    /// Descriptor of the event.
    pub descriptor: EventDescriptor,
    /// The domain event itself.
    pub event: E,
}

/// An event about to be written to the log store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedEvent {
    /// Id derived from the commit id, see [`event_id`].
    pub event_id: Uuid,
    /// Event type tag (e.g. `"Deposited"`).
    pub event_type: String,
    /// JSON payload (the `"data"` part of the tagged enum).
    pub payload: Value,
    /// Descriptor stamped on the event.
    pub descriptor: EventDescriptor,
}

/// An event as read back from the log store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Client-assigned event id.
    pub event_id: Uuid,
    /// Stream key the event was written to.
    pub stream: String,
    /// Store-assigned version within the stream (1-based).
    pub stream_version: u64,
    /// Event type tag.
    pub event_type: String,
    /// JSON payload.
    pub payload: Value,
    /// Descriptor written with the event.
    pub descriptor: EventDescriptor,
    /// Store-assigned timestamp, Unix epoch milliseconds.
    pub recorded_at: u64,
}

/// Derive the id of the `index`-th event of a commit.
///
/// Ids are `commit_id + index` in 128-bit arithmetic, so the events of one
/// commit get distinct, strictly ordered, reproducible ids. Re-sending the
/// same commit reproduces the same ids, which is what lets the store
/// detect duplicate commits.
///
/// # Examples
///
/// ```
/// use eventfold_uow::event_id;
/// use uuid::Uuid;
///
/// let commit = Uuid::new_v4();
/// assert!(event_id(commit, 0) < event_id(commit, 1));
/// assert_eq!(event_id(commit, 3), event_id(commit, 3));
/// ```
pub fn event_id(commit_id: Uuid, index: usize) -> Uuid {
    Uuid::from_u128(commit_id.as_u128().wrapping_add(index as u128))
}

/// Current time in Unix epoch milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Split an adjacently tagged domain event into `(event_type, payload)`.
///
/// Unit variants have no `"data"` key and encode to a null payload.
///
/// # Errors
///
/// Returns `serde_json::Error` if the event cannot be serialized or does
/// not serialize to an object with a string `"type"` field.
pub fn encode_event<E: Serialize>(event: &E) -> serde_json::Result<(String, Value)> {
    let value = serde_json::to_value(event)?;
    let Value::Object(mut obj) = value else {
        return Err(serde::ser::Error::custom(
            "domain event must serialize to a JSON object",
        ));
    };
    let Some(Value::String(event_type)) = obj.remove("type") else {
        return Err(serde::ser::Error::custom(
            "domain event must carry a string 'type' tag",
        ));
    };
    let payload = obj.remove("data").unwrap_or(Value::Null);
    Ok((event_type, payload))
}

/// Rebuild a domain event from its type tag and payload.
///
/// Returns `None` for unknown or malformed events so that older code can
/// still load streams written by newer code.
pub fn decode_event<E: DeserializeOwned>(event_type: &str, payload: &Value) -> Option<E> {
    let tagged = if payload.is_null() {
        serde_json::json!({ "type": event_type })
    } else {
        serde_json::json!({ "type": event_type, "data": payload })
    };
    serde_json::from_value(tagged).ok()
}

/// Encode a typed event into a [`ProposedEvent`] with the given id.
pub(crate) fn propose<E: Serialize>(
    full: &FullEvent<E>,
    event_id: Uuid,
) -> serde_json::Result<ProposedEvent> {
    let (event_type, payload) = encode_event(&full.event)?;
    Ok(ProposedEvent {
        event_id,
        event_type,
        payload,
        descriptor: full.descriptor.clone(),
    })
}

/// Decode a recorded event into a typed [`FullEvent`], if the type is known.
pub(crate) fn decode_recorded<E: DeserializeOwned>(
    recorded: &RecordedEvent,
) -> Option<FullEvent<E>> {
    let event = decode_event::<E>(&recorded.event_type, &recorded.payload)?;
    let mut descriptor = recorded.descriptor.clone();
    descriptor.version = recorded.stream_version;
    Some(FullEvent {
        event_id: Some(recorded.event_id),
        descriptor,
        event,
    })
}
