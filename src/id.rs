//! Entity identifiers and parent links.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque entity identifier: either a 64-bit integer or a string.
///
/// Serialized untagged, so `Id::Int(7)` becomes `7` and `Id::Str("a")`
/// becomes `"a"`. Equality and hashing are structural, which keeps them
/// stable across a serde round-trip.
///
/// # Examples
///
/// ```
/// use eventfold_uow::Id;
///
/// assert_eq!(Id::from(7), Id::Int(7));
/// assert_eq!(Id::from("acc-1").to_string(), "acc-1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    /// Numeric identifier.
    Int(i64),
    /// String identifier.
    Str(String),
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Id {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Id {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

impl From<String> for Id {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

/// One ancestor of a hierarchical entity: the ancestor's entity type and id.
///
/// An entity's parents are ordered from the root down to the direct parent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Parent {
    /// Entity type name of the ancestor (e.g. `"account"`).
    pub entity_type: String,
    /// Identifier of the ancestor.
    pub id: Id,
}

impl Parent {
    /// Build a parent link.
    pub fn new(entity_type: impl Into<String>, id: impl Into<Id>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }
}
