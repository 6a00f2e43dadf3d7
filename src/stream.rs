//! Stream identity and stream-key derivation.
//!
//! Every stream an entity touches (domain, OOB, snapshot, delayed) is
//! addressed by a string key derived from a [`StreamIdentity`]. The
//! derivation is a pluggable function configured once on the
//! [`EngineBuilder`](crate::EngineBuilder); it must be deterministic and
//! must not collide across entity types that share a bucket.

use std::fmt::Write as _;
use std::sync::Arc;

use uuid::Uuid;

use crate::event::StreamType;
use crate::id::{Id, Parent};

/// Fixed namespace UUID for [`uuid_stream_key`].
const STREAM_NAMESPACE: Uuid = Uuid::from_bytes([
    0x3c, 0x51, 0x8e, 0x07, 0xa2, 0x6d, 0x4f, 0x19, 0x9b, 0x44, 0x0e, 0xd7, 0x25, 0x6a, 0xf3, 0x81,
]);

/// Borrowed description of one stream.
#[derive(Debug, Clone, Copy)]
pub struct StreamIdentity<'a> {
    /// Entity type name.
    pub entity_type: &'a str,
    /// Which stream of the entity.
    pub stream_type: StreamType,
    /// Logical namespace.
    pub bucket: &'a str,
    /// Entity identifier.
    pub id: &'a Id,
    /// Ancestors, root first.
    pub parents: &'a [Parent],
}

/// Shared stream-key derivation function.
pub type StreamKeyFn = Arc<dyn Fn(&StreamIdentity<'_>) -> String + Send + Sync>;

/// Escape every character the key layout gives a meaning to, so that no
/// component can forge another's boundaries or the numeric-id marker.
fn push_component(out: &mut String, component: &str) {
    for ch in component.chars() {
        if matches!(ch, '\\' | '|' | '/' | ':' | '#') {
            out.push('\\');
        }
        out.push(ch);
    }
}

/// Default key: `bucket|entity_type|stream_type|parent_type:parent_id/..|id`.
///
/// Numeric ids are prefixed with `#`. Inside string components the
/// characters `\ | / : #` are escaped with a backslash, so distinct
/// identities always map to distinct keys: `Id::Int(7)` gives `#7` while
/// `Id::Str("#7")` gives `\#7`.
///
/// # Examples
///
/// ```
/// use eventfold_uow::{Id, StreamIdentity, StreamType, default_stream_key};
///
/// let id = Id::from("acc-1");
/// let key = default_stream_key(&StreamIdentity {
///     entity_type: "account",
///     stream_type: StreamType::Domain,
///     bucket: "default",
///     id: &id,
///     parents: &[],
/// });
/// assert_eq!(key, "default|account|domain||acc-1");
/// ```
pub fn default_stream_key(identity: &StreamIdentity<'_>) -> String {
    let mut key = String::new();
    push_component(&mut key, identity.bucket);
    key.push('|');
    push_component(&mut key, identity.entity_type);
    key.push('|');
    key.push_str(identity.stream_type.as_str());
    key.push('|');
    for (i, parent) in identity.parents.iter().enumerate() {
        if i > 0 {
            key.push('/');
        }
        push_component(&mut key, &parent.entity_type);
        key.push(':');
        push_id(&mut key, &parent.id);
    }
    key.push('|');
    push_id(&mut key, identity.id);
    key
}

fn push_id(out: &mut String, id: &Id) {
    match id {
        Id::Int(v) => {
            let _ = write!(out, "#{v}");
        }
        Id::Str(s) => push_component(out, s),
    }
}

/// UUID v5 key derived from the [`default_stream_key`].
///
/// For log stores that only accept UUID stream ids. Same identity, same
/// UUID, in every process.
pub fn uuid_stream_key(identity: &StreamIdentity<'_>) -> String {
    let name = default_stream_key(identity);
    Uuid::new_v5(&STREAM_NAMESPACE, name.as_bytes()).to_string()
}
