//! Partition topology: key ranges, the metadata collaborator trait,
//! and range resolution for a query.
//!
//! # Partition key hashing
//!
//! Partition keys are hashed with xxHash3-64 and rendered as a
//! fixed-width uppercase hex string; range boundaries collate on those
//! strings. This gives uniform distribution for any key and a stable
//! total order over the hash space.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::types::{CollectionId, RangeId};

/// Upper bound of the partition key hash space, exclusive of nothing —
/// the last range's `max_exclusive` is this sentinel.
pub const MAX_RANGE_BOUND: &str = "FFFFFFFFFFFFFFFF";

/// A contiguous slice of the partition key hash space owned by one
/// storage shard. Immutable once read from topology; ranges are
/// non-overlapping and totally ordered by `min_inclusive`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionKeyRange {
    pub id: RangeId,
    #[serde(rename = "minInclusive")]
    pub min_inclusive: String,
    #[serde(rename = "maxExclusive")]
    pub max_exclusive: String,
}

impl PartitionKeyRange {
    pub fn new(id: impl Into<String>, min: impl Into<String>, max: impl Into<String>) -> Self {
        Self {
            id: RangeId(id.into()),
            min_inclusive: min.into(),
            max_exclusive: max.into(),
        }
    }

    /// True when `key_hash` falls inside `[min_inclusive, max_exclusive)`.
    pub fn contains(&self, key_hash: &str) -> bool {
        self.min_inclusive.as_str() <= key_hash && key_hash < self.max_exclusive.as_str()
    }
}

/// Hash a partition key into its position in the range space:
/// xxHash3-64 rendered as a 16-char uppercase hex string.
pub fn hash_partition_key(key: &str) -> String {
    format!("{:016X}", xxh3_64(key.as_bytes()))
}

/// Collaborator that serves partitioning metadata for a collection.
///
/// Failures are reported as `MetadataUnavailable`; the resolver never
/// retries internally — callers retry.
pub trait TopologyProvider: Send + Sync {
    fn partition_key_ranges(
        &self,
        collection: &CollectionId,
    ) -> KestrelResult<Vec<PartitionKeyRange>>;
}

/// Maps a query's partition key (or "all ranges" request) to the
/// ordered set of ranges the query must touch.
pub struct RangeResolver {
    provider: Arc<dyn TopologyProvider>,
}

impl RangeResolver {
    pub fn new(provider: Arc<dyn TopologyProvider>) -> Self {
        Self { provider }
    }

    /// Resolve the active range set for a query.
    ///
    /// - `partition_key` given: exactly the one range containing the
    ///   key's hash.
    /// - `explicit_range_id` given (internal/diagnostic path): that
    ///   single range, deliberately *not* validated against current
    ///   topology; a stale id surfaces later as `RangeGone` from the
    ///   fetch layer.
    /// - neither: all ranges, ascending by `min_inclusive`.
    pub fn resolve(
        &self,
        collection: &CollectionId,
        partition_key: Option<&str>,
        explicit_range_id: Option<&RangeId>,
    ) -> KestrelResult<Vec<PartitionKeyRange>> {
        if let Some(range_id) = explicit_range_id {
            return Ok(vec![PartitionKeyRange {
                id: range_id.clone(),
                min_inclusive: String::new(),
                max_exclusive: MAX_RANGE_BOUND.to_string(),
            }]);
        }

        let mut ranges = self.provider.partition_key_ranges(collection)?;
        if ranges.is_empty() {
            return Err(KestrelError::MetadataUnavailable(format!(
                "collection {collection} has no partition key ranges"
            )));
        }
        ranges.sort_by(|a, b| a.min_inclusive.cmp(&b.min_inclusive));

        if let Some(pk) = partition_key {
            let key_hash = hash_partition_key(pk);
            let range = ranges
                .into_iter()
                .find(|r| r.contains(&key_hash))
                .ok_or_else(|| {
                    KestrelError::internal_bug(
                        "E-TOPO-001",
                        "partition key hash falls in no range",
                        format!("collection={collection}, key_hash={key_hash}"),
                    )
                })?;
            tracing::debug!(range_id = %range.id, key_hash = %key_hash, "resolved single range");
            return Ok(vec![range]);
        }

        tracing::debug!(count = ranges.len(), "resolved all ranges");
        Ok(ranges)
    }
}

/// Filter `ranges` down to those overlapping `[min, max]` with the
/// given inclusivity flags. Used to map a continuation token's embedded
/// range back onto current topology.
pub fn overlapping_ranges<'a>(
    ranges: &'a [PartitionKeyRange],
    min: &str,
    max: &str,
    min_inclusive: bool,
    max_inclusive: bool,
) -> Vec<&'a PartitionKeyRange> {
    ranges
        .iter()
        .filter(|r| {
            // Range ends before the window starts.
            if r.max_exclusive.as_str() < min
                || (r.max_exclusive.as_str() == min && !min_inclusive)
            {
                return false;
            }
            // Window ends before the range starts.
            if max < r.min_inclusive.as_str()
                || (max == r.min_inclusive.as_str() && !max_inclusive)
            {
                return false;
            }
            true
        })
        .collect()
}
