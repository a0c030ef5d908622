//! Newtype identifiers shared across the engine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a partition key range, as reported by the topology
/// metadata endpoint. Opaque; ordering of ranges comes from their key
/// boundaries, never from this id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RangeId(pub String);

impl RangeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RangeId {
    fn from(s: &str) -> Self {
        RangeId(s.to_string())
    }
}

/// Document resource id. Used as the deterministic tie-break in the
/// order-by comparator; unique per document within a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rid(pub String);

impl Rid {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Rid {
    fn from(s: &str) -> Self {
        Rid(s.to_string())
    }
}

/// Identifier of a collection (a horizontally partitioned container of
/// documents).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionId(pub String);

impl CollectionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CollectionId {
    fn from(s: &str) -> Self {
        CollectionId(s.to_string())
    }
}
