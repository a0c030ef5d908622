//! Client-side cross-partition query execution engine.
//!
//! A collection in a partitioned document store is split into partition
//! key ranges. A single logical query (optionally with ORDER BY, TOP,
//! or OFFSET/LIMIT) is fanned out to the relevant ranges, the partial
//! per-range result streams are merged under a global ordering policy,
//! and the merged stream is exposed as a sequence of pages, each with a
//! composite continuation token that can resume the exact logical
//! position — possibly in a different process.
//!
//! Transport to individual partitions is a collaborator behind the
//! [`PageFetcher`] trait; topology metadata behind [`TopologyProvider`].

pub mod continuation;
pub mod engine;
pub mod fanout;
pub mod merge;
pub mod metrics;
pub mod pipeline;
pub mod query;
pub mod source;
pub mod topology;

pub use continuation::{
    CompositeContinuationToken, OffsetContinuationToken, OrderByContinuationToken, OrderByItem,
    TakeContinuationToken, TokenRange,
};
pub use engine::{CancelHandle, QueryEngine, QueryExecution};
pub use merge::MergeItem;
pub use metrics::{QueryMetrics, RangeMetrics};
pub use pipeline::{ExecutionState, QueryPage};
pub use query::{OrderByKey, QuerySpec, SortOrder};
pub use source::{FetchedPage, PageFetcher, PageRequest, RangeCursor, RangePageSource};
pub use topology::{hash_partition_key, PartitionKeyRange, RangeResolver, TopologyProvider};
