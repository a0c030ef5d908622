//! Execution front door: validates a query against configuration and
//! topology, decodes an incoming continuation into per-range cursor
//! state, and hands back a resumable [`QueryExecution`].
//!
//! Token nesting mirrors the query shape from the outside in: a
//! declared TOP/LIMIT wraps everything in a take counter, a declared
//! OFFSET wraps the rest in a skip counter, and the innermost token is
//! either the plain composite set (unordered) or the order-by resume
//! token. Decoding peels the same layers in the same order; a token
//! that does not match the query shape is a decode failure, never
//! silently ignored.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use kestrel_common::config::KestrelConfig;
use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::types::{CollectionId, RangeId};

use crate::continuation::{
    try_decode_composite_set, CompositeContinuationToken, OffsetContinuationToken,
    OrderByContinuationToken, TakeContinuationToken,
};
pub use crate::fanout::CancelHandle;
use crate::metrics::QueryMetrics;
use crate::pipeline::{ExecutionState, Pipeline, PipelineConfig, QueryPage, ResumePoint};
use crate::query::QuerySpec;
use crate::source::{PageFetcher, RangePageSource};
use crate::topology::{overlapping_ranges, PartitionKeyRange, RangeResolver, TopologyProvider};

/// Decoded continuation, unwrapped down to per-range cursor state.
struct DecodedContinuation {
    take: Option<u64>,
    offset: Option<u64>,
    resume_point: Option<ResumePoint>,
    /// Unordered: one entry per unfinished range.
    composite_set: Option<Vec<CompositeContinuationToken>>,
    /// Ordered: the single range the stream stopped in.
    ordered_composite: Option<CompositeContinuationToken>,
}

/// Client-side cross-partition query engine. One instance per
/// collection endpoint; executions are independent.
pub struct QueryEngine {
    fetcher: Arc<dyn PageFetcher>,
    resolver: RangeResolver,
    config: KestrelConfig,
}

impl fmt::Debug for QueryEngine {
    // Collaborators are trait objects, so no derive.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl QueryEngine {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        topology: Arc<dyn TopologyProvider>,
        config: KestrelConfig,
    ) -> KestrelResult<Self> {
        config
            .execution
            .validate()
            .map_err(KestrelError::BadRequest)?;
        Ok(Self {
            fetcher,
            resolver: RangeResolver::new(topology),
            config,
        })
    }

    /// Validate the query, resolve its range set, decode any incoming
    /// continuation, and return a paging handle positioned either at
    /// the start or at the token's logical position.
    pub fn execute(
        &self,
        collection: &CollectionId,
        spec: QuerySpec,
    ) -> KestrelResult<QueryExecution> {
        if spec.effective_top().is_some() && (spec.offset.is_some() || spec.limit.is_some()) {
            return Err(KestrelError::BadRequest(
                "TOP cannot be combined with OFFSET/LIMIT".into(),
            ));
        }

        let ranges = self
            .resolver
            .resolve(collection, spec.partition_key.as_deref(), None)?;
        if ranges.len() > 1 && !spec.cross_partition_enabled {
            return Err(KestrelError::BadRequest(format!(
                "query spans {} partition key ranges but cross-partition execution \
                 is disabled; enable it or supply a partition key",
                ranges.len()
            )));
        }

        let decoded = self.decode_continuation(&spec)?;
        let sources = build_sources(&ranges, &decoded)?;

        let exec_cfg = &self.config.execution;
        let pipeline_config = PipelineConfig {
            page_size: if spec.max_item_count > 0 {
                spec.max_item_count as usize
            } else {
                exec_cfg.default_page_size
            },
            degree_of_parallelism: spec
                .max_degree_of_parallelism
                .unwrap_or(exec_cfg.max_degree_of_parallelism),
            page_timeout_ms: exec_cfg.page_timeout_ms,
            max_empty_fetches: exec_cfg.max_empty_fetches_per_range,
        };

        tracing::debug!(
            collection = %collection,
            ranges = sources.len(),
            ordered = !spec.order_by.is_empty(),
            resuming = spec.continuation.is_some(),
            dop = pipeline_config.degree_of_parallelism,
            "starting query execution"
        );

        let pipeline = Pipeline::new(
            spec.query_text,
            sources,
            spec.order_by,
            decoded.resume_point,
            decoded.take,
            decoded.offset,
            pipeline_config,
        );
        Ok(QueryExecution {
            pipeline: Mutex::new(pipeline),
            fetcher: Arc::clone(&self.fetcher),
            cancel: CancelHandle::new(),
        })
    }

    /// Peel the wrapper layers the query shape declares, then decode
    /// the inner position token for the query's merge policy.
    fn decode_continuation(&self, spec: &QuerySpec) -> KestrelResult<DecodedContinuation> {
        let mut decoded = DecodedContinuation {
            take: spec.effective_top().or(spec.limit),
            offset: spec.offset,
            resume_point: None,
            composite_set: None,
            ordered_composite: None,
        };
        let Some(raw) = &spec.continuation else {
            return Ok(decoded);
        };

        let mut inner = raw.clone();
        if spec.has_take() {
            let take = TakeContinuationToken::try_decode(&inner)
                .map_err(|e| e.with_context("take layer of continuation"))?;
            decoded.take = Some(take.take_count);
            inner = take.source_token;
        }
        if spec.offset.is_some() {
            let offset = OffsetContinuationToken::try_decode(&inner)
                .map_err(|e| e.with_context("offset layer of continuation"))?;
            decoded.offset = Some(offset.offset);
            inner = offset.source_token;
        }

        if spec.order_by.is_empty() {
            decoded.composite_set = Some(try_decode_composite_set(&inner)?);
        } else {
            let token = OrderByContinuationToken::try_decode(&inner)?;
            if token.order_by_items.len() != spec.order_by.len() {
                return Err(KestrelError::BadRequest(format!(
                    "continuation carries {} order-by values but the query declares {} keys",
                    token.order_by_items.len(),
                    spec.order_by.len()
                )));
            }
            decoded.resume_point = Some(ResumePoint {
                order_by_items: token.order_by_items.iter().map(|i| i.item.clone()).collect(),
                rid: token.rid,
                inclusive: token.inclusive,
            });
            decoded.ordered_composite = Some(token.composite_token);
        }
        Ok(decoded)
    }
}

/// Match a token window to a live range by exact boundaries. A token
/// minted against a topology that has since split or merged has no
/// exact match; the engine reports how many current ranges the stale
/// window overlaps rather than guessing which of them to resume.
fn find_range<'a>(
    ranges: &'a [PartitionKeyRange],
    token: &CompositeContinuationToken,
) -> KestrelResult<&'a PartitionKeyRange> {
    ranges
        .iter()
        .find(|r| r.min_inclusive == token.range.min && r.max_exclusive == token.range.max)
        .ok_or_else(|| {
            let overlapping = overlapping_ranges(
                ranges,
                &token.range.min,
                &token.range.max,
                token.range.min_inclusive,
                token.range.max_inclusive,
            );
            KestrelError::range_gone(
                RangeId(format!("[{},{})", token.range.min, token.range.max)),
                format!(
                    "continuation range has no exact match in current topology; \
                     window overlaps {} current range(s)",
                    overlapping.len()
                ),
            )
        })
}

fn build_sources(
    ranges: &[PartitionKeyRange],
    decoded: &DecodedContinuation,
) -> KestrelResult<Vec<RangePageSource>> {
    if let Some(set) = &decoded.composite_set {
        // Ranges absent from the set were already exhausted; only the
        // listed ones come back.
        let mut sources = Vec::with_capacity(set.len());
        for token in set {
            let range = find_range(ranges, token)?;
            sources.push(RangePageSource::new(
                range.clone(),
                token.sub_token().map(String::from),
            ));
        }
        return Ok(sources);
    }

    if let Some(composite) = &decoded.ordered_composite {
        // The stopped range resumes from its token; every other range
        // restarts and the resume-point filter drops delivered items.
        let target = find_range(ranges, composite)?;
        return Ok(ranges
            .iter()
            .map(|r| {
                let resume = if r.id == target.id {
                    composite.sub_token().map(String::from)
                } else {
                    None
                };
                RangePageSource::new(r.clone(), resume)
            })
            .collect());
    }

    Ok(ranges
        .iter()
        .map(|r| RangePageSource::new(r.clone(), None))
        .collect())
}

/// A positioned, resumable paging handle over one query execution.
/// `Sync`: page production is serialized internally, and the cancel
/// handle can be poked from any thread.
pub struct QueryExecution {
    pipeline: Mutex<Pipeline>,
    fetcher: Arc<dyn PageFetcher>,
    cancel: CancelHandle,
}

impl fmt::Debug for QueryExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pipeline = self.pipeline.lock();
        f.debug_struct("QueryExecution")
            .field("state", &pipeline.state())
            .field("metrics", pipeline.metrics())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl QueryExecution {
    /// Produce the next page. `Ok(None)` after the terminal page.
    pub fn next_page(&self) -> KestrelResult<Option<QueryPage>> {
        let mut pipeline = self.pipeline.lock();
        let result = pipeline.next_page(self.fetcher.as_ref(), &self.cancel);
        if let Err(err) = &result {
            err.log_if_fatal();
        }
        result
    }

    /// Handle for cancelling this execution from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn state(&self) -> ExecutionState {
        self.pipeline.lock().state()
    }

    pub fn metrics(&self) -> QueryMetrics {
        self.pipeline.lock().metrics().clone()
    }
}
