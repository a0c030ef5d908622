//! Page production pipeline: drives per-range sources through the
//! fan-out layer, merges their streams under the query's ordering
//! policy, applies OFFSET/TOP/LIMIT counters, and stamps each client
//! page with a continuation token.
//!
//! Two policies:
//!
//! - **Unordered** (no ORDER BY): ranges drain strictly sequentially
//!   in range order (every page of a range is delivered before the
//!   next range starts; later ranges are at most prefetched), and each
//!   client page carries exactly one backend page's items. Delivery
//!   order is a pure function of the composite-set token (one entry
//!   per unfinished range), so a resumed execution applies OFFSET/TOP
//!   counters to the same stream as an uninterrupted one. Partial or
//!   empty client pages mid-stream are valid.
//! - **Ordered** (ORDER BY): a k-way merge over buffered per-range
//!   items under the `(order-by tuple, rid)` total order. The
//!   continuation names the range the stream stopped in plus the last
//!   seen projection/rid pair; on resume that pair filters out
//!   already-delivered items, so the other ranges can restart from
//!   scratch without duplication.
//!
//! A page production that fails (timeout, cancel, transport) commits
//! nothing observable: fetched-but-undelivered backend pages stay
//! re-fetchable via each cursor's buffer-origin token, and in-process
//! buffers and counters are rolled back to the last page boundary.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde_json::Value;

use kestrel_common::error::{KestrelError, KestrelResult};

use crate::continuation::{
    encode_composite_set, CompositeContinuationToken, OffsetContinuationToken, OrderByItem,
    OrderByContinuationToken, TakeContinuationToken, TokenRange,
};
use crate::fanout::{fetch_all, CancelHandle, FanoutContext, FetchOutcome};
use crate::merge::{compare_merge_items, compare_order_by_tuples, MergeItem};
use crate::metrics::QueryMetrics;
use crate::query::OrderByKey;
use crate::source::{FetchSpec, PageFetcher, RangePageSource};

/// Per-execution state machine. `Fetching` and `Merging` are the
/// transient phases inside one page production; between calls the
/// execution rests in `Idle` (nothing produced yet), `Yielding` (more
/// pages remain), `Draining` (terminal page delivered with
/// fetched-but-unneeded state discarded), or `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Idle,
    Fetching,
    Merging,
    Yielding,
    Draining,
    Done,
}

/// One client-facing page of merged results.
#[derive(Debug, Clone)]
pub struct QueryPage {
    pub items: Vec<Value>,
    /// Token resuming immediately after this page; `None` on the final
    /// page.
    pub continuation: Option<String>,
    /// Backend charge accrued producing this page.
    pub request_charge: f64,
    /// Cumulative execution metrics through this page, including the
    /// per-range breakdown.
    pub metrics: QueryMetrics,
}

/// Decoded resume position for an ordered merge: items collating at or
/// before this point were delivered by a previous execution.
#[derive(Debug, Clone)]
pub struct ResumePoint {
    pub order_by_items: Vec<Option<Value>>,
    pub rid: String,
    /// True re-delivers the boundary item itself. Emitted tokens always
    /// say `false`; the decoder honors either.
    pub inclusive: bool,
}

/// Last (projection, rid) pair popped from the merge, and the source it
/// came from. Skipped items (offset, still-counting) update this too:
/// they were consumed and must not reappear on resume.
#[derive(Debug, Clone)]
struct LastSeen {
    order_by_items: Vec<Option<Value>>,
    rid: String,
    source_index: usize,
}

/// One fetched-but-undelivered backend page held for its source range.
#[derive(Debug)]
struct BufferedPage {
    items: Vec<Value>,
    request_charge: f64,
}

/// Knobs resolved by the engine from config plus per-query overrides.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub page_size: usize,
    pub degree_of_parallelism: i32,
    /// 0 disables the per-page deadline.
    pub page_timeout_ms: u64,
    /// Consecutive empty (but unfinished) backend pages tolerated per
    /// range before the collaborator is declared broken.
    pub max_empty_fetches: u32,
}

pub struct Pipeline {
    query_text: String,
    sources: Vec<RangePageSource>,
    /// Empty = unordered policy.
    order_by: Vec<OrderByKey>,
    config: PipelineConfig,
    state: ExecutionState,
    metrics: QueryMetrics,

    // Counters. `remaining_take` is `Some` iff TOP/LIMIT was declared;
    // `offset_declared` keeps the wrapper emitted once the count hits 0.
    remaining_take: Option<u64>,
    remaining_offset: u64,
    offset_declared: bool,

    // Unordered state. At most one undelivered backend page per
    // source; delivery stays strictly in range order.
    page_buffers: Vec<Option<BufferedPage>>,
    /// Charge from dropped empty backend pages, attributed to the next
    /// delivered page.
    pending_charge: f64,

    // Ordered state.
    item_buffers: Vec<VecDeque<MergeItem>>,
    resume_point: Option<ResumePoint>,
    last_seen: Option<LastSeen>,

    empty_fetches: Vec<u32>,
}

impl Pipeline {
    pub fn new(
        query_text: impl Into<String>,
        sources: Vec<RangePageSource>,
        order_by: Vec<OrderByKey>,
        resume_point: Option<ResumePoint>,
        take: Option<u64>,
        offset: Option<u64>,
        config: PipelineConfig,
    ) -> Self {
        let n = sources.len();
        Self {
            query_text: query_text.into(),
            sources,
            order_by,
            config,
            state: ExecutionState::Idle,
            metrics: QueryMetrics::new(),
            remaining_take: take,
            remaining_offset: offset.unwrap_or(0),
            offset_declared: offset.is_some(),
            page_buffers: (0..n).map(|_| None).collect(),
            pending_charge: 0.0,
            item_buffers: (0..n).map(|_| VecDeque::new()).collect(),
            resume_point,
            last_seen: None,
            empty_fetches: vec![0; n],
        }
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn metrics(&self) -> &QueryMetrics {
        &self.metrics
    }

    fn is_ordered(&self) -> bool {
        !self.order_by.is_empty()
    }

    /// Produce the next client page. `Ok(None)` once the stream is
    /// terminal; an empty result set still yields one empty final page.
    pub fn next_page(
        &mut self,
        fetcher: &dyn PageFetcher,
        cancel: &CancelHandle,
    ) -> KestrelResult<Option<QueryPage>> {
        match self.state {
            ExecutionState::Done => return Ok(None),
            ExecutionState::Draining => {
                self.state = ExecutionState::Done;
                return Ok(None);
            }
            _ => {}
        }
        if self.remaining_take == Some(0) {
            // TOP 0 / LIMIT 0: one empty terminal page, then done.
            self.state = ExecutionState::Done;
            self.metrics.record_page_produced();
            return Ok(Some(QueryPage {
                items: Vec::new(),
                continuation: None,
                request_charge: 0.0,
                metrics: self.metrics.clone(),
            }));
        }

        let entry_state = self.state;
        let started = Instant::now();
        let deadline = (self.config.page_timeout_ms > 0)
            .then(|| started + Duration::from_millis(self.config.page_timeout_ms));

        let result = if self.is_ordered() {
            self.next_page_ordered(fetcher, cancel, started, deadline)
        } else {
            self.next_page_unordered(fetcher, cancel, started, deadline)
        };
        let page = match result {
            Ok(page) => page,
            Err(err) => {
                // Back to the last page boundary, as if this call never
                // happened.
                self.state = entry_state;
                return Err(err);
            }
        };

        match page {
            Some(mut page) => {
                self.metrics.record_page_produced();
                page.metrics = self.metrics.clone();
                Ok(Some(page))
            }
            // Drained without anything to deliver. An execution that
            // never produced a page still owes the caller one empty
            // terminal page.
            None if self.metrics.pages_produced == 0 => {
                self.metrics.record_page_produced();
                Ok(Some(QueryPage {
                    items: Vec::new(),
                    continuation: None,
                    request_charge: std::mem::take(&mut self.pending_charge),
                    metrics: self.metrics.clone(),
                }))
            }
            None => Ok(None),
        }
    }

    // ── Shared fetch/commit ──────────────────────────────────────────────────

    /// Fetch specs gathered from every live cursor that has nothing
    /// buffered.
    fn pending_specs(&self) -> KestrelResult<Vec<(usize, FetchSpec)>> {
        let mut specs = Vec::new();
        for (i, src) in self.sources.iter().enumerate() {
            let has_buffer = if self.is_ordered() {
                !self.item_buffers[i].is_empty()
            } else {
                self.page_buffers[i].is_some()
            };
            if !src.is_exhausted() && !has_buffer {
                specs.push((i, src.begin_fetch()?));
            }
        }
        Ok(specs)
    }

    /// Run one full fan-out over `specs` and commit every cursor. The
    /// guard pass runs before any commit, so this either commits the
    /// whole wave or nothing.
    fn run_wave(
        &mut self,
        fetcher: &dyn PageFetcher,
        cancel: &CancelHandle,
        started: Instant,
        deadline: Option<Instant>,
        specs: &[(usize, FetchSpec)],
    ) -> KestrelResult<Vec<FetchOutcome>> {
        self.state = ExecutionState::Fetching;
        let mut outcomes = {
            let ctx = FanoutContext {
                fetcher,
                query_text: &self.query_text,
                page_size_hint: self.config.page_size,
                started_at: started,
                deadline,
                cancel,
            };
            fetch_all(&ctx, specs, self.config.degree_of_parallelism)?
        };
        outcomes.sort_by_key(|o| o.source_index);

        for o in &outcomes {
            if o.page.items.is_empty() && o.page.continuation.is_some() {
                let seen = self.empty_fetches[o.source_index] + 1;
                if seen > self.config.max_empty_fetches {
                    let range_id = self.sources[o.source_index].range_id();
                    return Err(KestrelError::transport(
                        format!("range {range_id} returned {seen} consecutive empty pages"),
                        None,
                    ));
                }
            }
        }

        for o in &outcomes {
            let src = &mut self.sources[o.source_index];
            src.apply_page(&o.page);
            self.metrics.record_fetch(
                src.range_id(),
                o.page.items.len(),
                o.page.request_charge,
                o.latency_us,
            );
            if o.page.items.is_empty() && !src.is_exhausted() {
                self.empty_fetches[o.source_index] += 1;
            } else {
                self.empty_fetches[o.source_index] = 0;
            }
        }
        Ok(outcomes)
    }

    /// Wrap an inner token with the declared OFFSET and TOP/LIMIT
    /// counters, outermost last.
    fn wrap_counters(&self, inner: String) -> KestrelResult<String> {
        let mut token = inner;
        if self.offset_declared {
            token = OffsetContinuationToken {
                offset: self.remaining_offset,
                source_token: token,
            }
            .encode()?;
        }
        if let Some(take_count) = self.remaining_take {
            token = TakeContinuationToken {
                take_count,
                source_token: token,
            }
            .encode()?;
        }
        Ok(token)
    }

    // ── Unordered policy ─────────────────────────────────────────────────────

    fn next_page_unordered(
        &mut self,
        fetcher: &dyn PageFetcher,
        cancel: &CancelHandle,
        started: Instant,
        deadline: Option<Instant>,
    ) -> KestrelResult<Option<QueryPage>> {
        let source_index = loop {
            if let Some(i) = self.next_deliverable() {
                break i;
            }
            let specs = self.pending_specs()?;
            if specs.is_empty() {
                self.state = ExecutionState::Done;
                return Ok(None);
            }
            let outcomes = self.run_wave(fetcher, cancel, started, deadline, &specs)?;
            for o in outcomes {
                if o.page.items.is_empty() {
                    // Nothing to deliver from this page; its cursor has
                    // advanced and its charge rides the next real page.
                    self.pending_charge += o.page.request_charge;
                } else {
                    self.page_buffers[o.source_index] = Some(BufferedPage {
                        items: o.page.items,
                        request_charge: o.page.request_charge,
                    });
                }
            }
        };

        self.state = ExecutionState::Merging;
        let buf = self.page_buffers[source_index].take().ok_or_else(|| {
            KestrelError::internal_bug(
                "E-PIPE-003",
                "selected page buffer was empty",
                format!("source_index={source_index}"),
            )
        })?;
        let request_charge = buf.request_charge + std::mem::take(&mut self.pending_charge);

        // Counters apply to the merged stream, so to this page's items.
        let mut items = buf.items;
        let skip = (self.remaining_offset as usize).min(items.len());
        if skip > 0 {
            items.drain(..skip);
            self.remaining_offset -= skip as u64;
        }
        if let Some(take) = self.remaining_take {
            if (items.len() as u64) > take {
                items.truncate(take as usize);
            }
            self.remaining_take = Some(take - items.len() as u64);
        }

        let continuation = self.unordered_continuation()?;
        if continuation.is_none() {
            let leftovers = self.page_buffers.iter().any(Option::is_some)
                || self.sources.iter().any(|s| !s.is_exhausted());
            self.state = if leftovers {
                ExecutionState::Draining
            } else {
                ExecutionState::Done
            };
            self.page_buffers.iter_mut().for_each(|b| *b = None);
        } else {
            self.state = ExecutionState::Yielding;
        }
        Ok(Some(QueryPage {
            items,
            continuation,
            request_charge,
            metrics: QueryMetrics::new(),
        }))
    }

    /// First range, in range order, whose buffered page may be
    /// delivered: every earlier range must already be exhausted. A live
    /// earlier range without a buffer blocks delivery until it has been
    /// fetched, which keeps delivery order independent of fetch timing
    /// and so a pure function of the continuation state.
    fn next_deliverable(&self) -> Option<usize> {
        for (i, src) in self.sources.iter().enumerate() {
            if self.page_buffers[i].is_some() {
                return Some(i);
            }
            if !src.is_exhausted() {
                return None;
            }
        }
        None
    }

    /// Composite-set token over every unfinished range: a range with an
    /// undelivered buffered page resumes from the token that fetched
    /// that page; a drained-buffer range resumes from its next-fetch
    /// token; exhausted ranges are omitted.
    fn unordered_continuation(&self) -> KestrelResult<Option<String>> {
        if self.remaining_take == Some(0) {
            return Ok(None);
        }
        let mut set = Vec::new();
        for (i, src) in self.sources.iter().enumerate() {
            let token = if self.page_buffers[i].is_some() {
                src.resume_token_for_buffered_page()
            } else if !src.is_exhausted() {
                src.resume_token_for_next_fetch()
            } else {
                continue;
            };
            let range = src.range();
            set.push(CompositeContinuationToken::new(
                token,
                TokenRange::canonical(range.min_inclusive.clone(), range.max_exclusive.clone()),
            ));
        }
        if set.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.wrap_counters(encode_composite_set(&set)?)?))
    }

    // ── Ordered policy ───────────────────────────────────────────────────────

    fn next_page_ordered(
        &mut self,
        fetcher: &dyn PageFetcher,
        cancel: &CancelHandle,
        started: Instant,
        deadline: Option<Instant>,
    ) -> KestrelResult<Option<QueryPage>> {
        let saved_take = self.remaining_take;
        let saved_offset = self.remaining_offset;
        let saved_last = self.last_seen.clone();
        // Every popped item, delivery flag per entry, so a failed page
        // production can be rolled back to the last page boundary.
        let mut popped: Vec<(usize, MergeItem, bool)> = Vec::new();
        let mut request_charge = 0.0;

        let fill = self.fill_ordered(
            fetcher,
            cancel,
            started,
            deadline,
            &mut popped,
            &mut request_charge,
        );
        if let Err(err) = fill {
            for (i, item, _) in popped.into_iter().rev() {
                self.item_buffers[i].push_front(item);
            }
            self.remaining_take = saved_take;
            self.remaining_offset = saved_offset;
            self.last_seen = saved_last;
            return Err(err);
        }

        let items: Vec<Value> = popped
            .into_iter()
            .filter(|(_, _, delivered)| *delivered)
            .map(|(_, item, _)| item.payload)
            .collect();

        let exhausted = self.sources.iter().all(|s| s.is_exhausted())
            && self.item_buffers.iter().all(|b| b.is_empty());
        let drained = self.remaining_take == Some(0) || exhausted;
        let continuation = if drained {
            self.state = if exhausted {
                ExecutionState::Done
            } else {
                ExecutionState::Draining
            };
            self.item_buffers.iter_mut().for_each(VecDeque::clear);
            None
        } else {
            self.state = ExecutionState::Yielding;
            Some(self.ordered_continuation()?)
        };

        if items.is_empty() && continuation.is_none() {
            return Ok(None);
        }
        Ok(Some(QueryPage {
            items,
            continuation,
            request_charge,
            // Stamped with the live snapshot by `next_page`.
            metrics: QueryMetrics::new(),
        }))
    }

    /// Pop merged items until the page budget (delivered plus
    /// offset-skipped items) is spent, the take counter hits zero, or
    /// every range is drained.
    fn fill_ordered(
        &mut self,
        fetcher: &dyn PageFetcher,
        cancel: &CancelHandle,
        started: Instant,
        deadline: Option<Instant>,
        popped: &mut Vec<(usize, MergeItem, bool)>,
        request_charge: &mut f64,
    ) -> KestrelResult<()> {
        let mut consumed = 0usize;
        loop {
            if consumed >= self.config.page_size || self.remaining_take == Some(0) {
                return Ok(());
            }

            // Refill: the global minimum is only known once every
            // non-exhausted range has at least one buffered item.
            loop {
                let specs = self.pending_specs()?;
                if specs.is_empty() {
                    break;
                }
                let outcomes = self.run_wave(fetcher, cancel, started, deadline, &specs)?;
                for o in outcomes {
                    *request_charge += o.page.request_charge;
                    let range_id = self.sources[o.source_index].range_id().clone();
                    self.item_buffers[o.source_index].extend(
                        o.page
                            .items
                            .into_iter()
                            .map(|doc| MergeItem::project(doc, &self.order_by, &range_id)),
                    );
                }
            }

            self.state = ExecutionState::Merging;
            let min_index = match self.min_buffer_head() {
                Some(i) => i,
                None => return Ok(()), // fully drained
            };
            let item = match self.item_buffers[min_index].pop_front() {
                Some(item) => item,
                None => {
                    return Err(KestrelError::internal_bug(
                        "E-PIPE-001",
                        "merge selected an empty buffer",
                        format!("source_index={min_index}"),
                    ))
                }
            };

            if self.before_resume_point(&item) {
                popped.push((min_index, item, false));
                continue;
            }
            self.last_seen = Some(LastSeen {
                order_by_items: item.order_by_items.clone(),
                rid: item.rid.to_string(),
                source_index: min_index,
            });
            if self.remaining_offset > 0 {
                // Skips spend page budget too, so a huge OFFSET still
                // reaches page boundaries (with the remaining skip
                // persisted in the token) instead of looping unbounded
                // inside a single call.
                self.remaining_offset -= 1;
                consumed += 1;
                popped.push((min_index, item, false));
                continue;
            }
            if let Some(take) = self.remaining_take {
                self.remaining_take = Some(take - 1);
            }
            consumed += 1;
            popped.push((min_index, item, true));
        }
    }

    /// Index of the source whose buffer head is the global minimum.
    fn min_buffer_head(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, buffer) in self.item_buffers.iter().enumerate() {
            let Some(head) = buffer.front() else { continue };
            best = match best {
                None => Some(i),
                Some(j) => {
                    let other = &self.item_buffers[j][0];
                    if compare_merge_items(head, other, &self.order_by).is_lt() {
                        Some(i)
                    } else {
                        Some(j)
                    }
                }
            };
        }
        best
    }

    /// True when a previous execution already consumed this item.
    fn before_resume_point(&self, item: &MergeItem) -> bool {
        let Some(rp) = &self.resume_point else {
            return false;
        };
        let ord = compare_order_by_tuples(&item.order_by_items, &rp.order_by_items, &self.order_by)
            .then_with(|| item.rid.as_str().cmp(rp.rid.as_str()));
        ord.is_lt() || (ord.is_eq() && !rp.inclusive)
    }

    /// Order-by token: the last seen (projection, rid) pair plus the
    /// composite token of the range it came from. That range resumes
    /// from the token that fetched its current page; the others restart
    /// and rely on the pair filter.
    fn ordered_continuation(&self) -> KestrelResult<String> {
        let last = self.last_seen.as_ref().ok_or_else(|| {
            KestrelError::internal_bug(
                "E-PIPE-002",
                "continuation requested before any item was seen",
                format!("sources={}", self.sources.len()),
            )
        })?;
        let src = &self.sources[last.source_index];
        let range = src.range();
        let token = OrderByContinuationToken {
            composite_token: CompositeContinuationToken::new(
                src.resume_token_for_buffered_page(),
                TokenRange::canonical(range.min_inclusive.clone(), range.max_exclusive.clone()),
            ),
            order_by_items: last
                .order_by_items
                .iter()
                .map(|v| match v {
                    Some(value) => OrderByItem::defined(value.clone()),
                    None => OrderByItem::undefined(),
                })
                .collect(),
            rid: last.rid.clone(),
            inclusive: false,
        };
        self.wrap_counters(token.encode()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::continuation::try_decode_composite_set;
    use crate::topology::PartitionKeyRange;

    /// Scripted backend: each range serves a fixed item list in pages
    /// of `backend_page_size`, with positional continuation strings.
    struct ScriptedFetcher {
        ranges: Vec<(String, Vec<Value>)>,
        backend_page_size: usize,
    }

    impl ScriptedFetcher {
        fn new(ranges: Vec<(&str, Vec<Value>)>, backend_page_size: usize) -> Self {
            Self {
                ranges: ranges
                    .into_iter()
                    .map(|(id, items)| (id.to_string(), items))
                    .collect(),
                backend_page_size,
            }
        }
    }

    impl PageFetcher for ScriptedFetcher {
        fn fetch_page(&self, request: crate::source::PageRequest<'_>) -> KestrelResult<FetchedPage> {
            let (_, items) = self
                .ranges
                .iter()
                .find(|(id, _)| id == request.range_id.as_str())
                .ok_or_else(|| KestrelError::transport("unknown range", Some(410)))?;
            let start: usize = match request.continuation {
                Some(c) => c
                    .parse()
                    .map_err(|_| KestrelError::transport("bad continuation", Some(400)))?,
                None => 0,
            };
            let end = (start + self.backend_page_size).min(items.len());
            let continuation = (end < items.len()).then(|| end.to_string());
            Ok(FetchedPage {
                items: items[start..end].to_vec(),
                continuation,
                request_charge: 1.0,
            })
        }
    }

    use crate::source::FetchedPage;

    fn doc(range: &str, n: usize) -> Value {
        json!({"_rid": format!("{range}-{n:03}"), "v": n})
    }

    fn sources_for(ids: &[&str]) -> Vec<RangePageSource> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| {
                RangePageSource::new(
                    PartitionKeyRange::new(*id, format!("{i:02}"), format!("{:02}", i + 1)),
                    None,
                )
            })
            .collect()
    }

    fn config(page_size: usize) -> PipelineConfig {
        PipelineConfig {
            page_size,
            degree_of_parallelism: 0,
            page_timeout_ms: 0,
            max_empty_fetches: 10,
        }
    }

    fn pipeline(
        fetched_ids: &[&str],
        order_by: Vec<OrderByKey>,
        take: Option<u64>,
        offset: Option<u64>,
        page_size: usize,
    ) -> Pipeline {
        Pipeline::new(
            "SELECT * FROM c",
            sources_for(fetched_ids),
            order_by,
            None,
            take,
            offset,
            config(page_size),
        )
    }

    fn drain(pipeline: &mut Pipeline, fetcher: &dyn PageFetcher) -> (Vec<Value>, usize) {
        let cancel = CancelHandle::new();
        let mut all = Vec::new();
        let mut pages = 0;
        while let Some(page) = pipeline.next_page(fetcher, &cancel).unwrap() {
            all.extend(page.items);
            pages += 1;
            if page.continuation.is_none() {
                break;
            }
        }
        (all, pages)
    }

    // ── Unordered ────────────────────────────────────────────────────────────

    #[test]
    fn test_unordered_drains_ranges_in_order_without_splitting_pages() {
        let fetcher = ScriptedFetcher::new(
            vec![
                ("a", (0..5).map(|n| doc("a", n)).collect()),
                ("b", (0..3).map(|n| doc("b", n)).collect()),
            ],
            2,
        );
        let mut p = pipeline(&["a", "b"], vec![], None, None, 100);
        let cancel = CancelHandle::new();

        let first = p.next_page(&fetcher, &cancel).unwrap().unwrap();
        // One backend page exactly, from the first range.
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.items[0]["_rid"], "a-000");
        assert!(first.continuation.is_some());

        let (rest, _) = drain(&mut p, &fetcher);
        let mut all = first.items;
        all.extend(rest);
        // Range a drains completely before range b starts, even though
        // b's first page was prefetched in the opening wave.
        let rids: Vec<&str> = all.iter().map(|d| d["_rid"].as_str().unwrap()).collect();
        assert_eq!(
            rids,
            ["a-000", "a-001", "a-002", "a-003", "a-004", "b-000", "b-001", "b-002"]
        );
        assert_eq!(p.state(), ExecutionState::Done);
    }

    #[test]
    fn test_unordered_continuation_omits_exhausted_ranges() {
        let fetcher = ScriptedFetcher::new(
            vec![
                ("a", vec![doc("a", 0)]),
                ("b", (0..4).map(|n| doc("b", n)).collect()),
            ],
            1,
        );
        let mut p = pipeline(&["a", "b"], vec![], None, None, 100);
        let cancel = CancelHandle::new();

        // Page 1 delivers range a's only page; a is exhausted.
        let page = p.next_page(&fetcher, &cancel).unwrap().unwrap();
        let set = try_decode_composite_set(&page.continuation.unwrap()).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set[0].range.min, "01");
    }

    #[test]
    fn test_unordered_empty_result_set_single_terminal_page() {
        let fetcher = ScriptedFetcher::new(vec![("a", vec![]), ("b", vec![])], 2);
        let mut p = pipeline(&["a", "b"], vec![], None, None, 100);
        let cancel = CancelHandle::new();

        let page = p.next_page(&fetcher, &cancel).unwrap().unwrap();
        assert!(page.items.is_empty());
        assert!(page.continuation.is_none());
        assert!(p.next_page(&fetcher, &cancel).unwrap().is_none());
    }

    #[test]
    fn test_unordered_top_truncates_and_terminates() {
        let fetcher = ScriptedFetcher::new(vec![("a", (0..10).map(|n| doc("a", n)).collect())], 4);
        let mut p = pipeline(&["a"], vec![], Some(6), None, 100);
        let (all, _) = drain(&mut p, &fetcher);
        assert_eq!(all.len(), 6);
        // Range "a" still held items when TOP ran out.
        assert_eq!(p.state(), ExecutionState::Draining);
    }

    #[test]
    fn test_unordered_offset_skips_across_pages() {
        let fetcher = ScriptedFetcher::new(vec![("a", (0..10).map(|n| doc("a", n)).collect())], 4);
        let mut p = pipeline(&["a"], vec![], None, Some(6), 100);
        let (all, _) = drain(&mut p, &fetcher);
        assert_eq!(all.len(), 4);
        assert_eq!(all[0]["v"], 6);
    }

    #[test]
    fn test_take_zero_first_page_is_empty_terminal() {
        let fetcher = ScriptedFetcher::new(vec![("a", (0..3).map(|n| doc("a", n)).collect())], 2);
        let mut p = pipeline(&["a"], vec![], Some(0), None, 100);
        let cancel = CancelHandle::new();
        let page = p.next_page(&fetcher, &cancel).unwrap().unwrap();
        assert!(page.items.is_empty());
        assert!(page.continuation.is_none());
        // No backend fetch was issued at all.
        assert_eq!(p.metrics().total_fetch_count(), 0);
    }

    // ── Ordered ──────────────────────────────────────────────────────────────

    fn ordered_doc(range: &str, n: usize, v: i64) -> Value {
        json!({"_rid": format!("{range}-{n:03}"), "v": v})
    }

    #[test]
    fn test_ordered_merge_is_globally_sorted() {
        let fetcher = ScriptedFetcher::new(
            vec![
                ("a", vec![ordered_doc("a", 0, 1), ordered_doc("a", 1, 5)]),
                ("b", vec![ordered_doc("b", 0, 2), ordered_doc("b", 1, 4)]),
                ("c", vec![ordered_doc("c", 0, 3), ordered_doc("c", 1, 6)]),
            ],
            1,
        );
        let mut p = pipeline(&["a", "b", "c"], vec![OrderByKey::asc("v")], None, None, 10);
        let (all, _) = drain(&mut p, &fetcher);
        let values: Vec<i64> = all.iter().map(|d| d["v"].as_i64().unwrap()).collect();
        assert_eq!(values, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_ordered_descending() {
        let fetcher = ScriptedFetcher::new(
            vec![
                ("a", vec![ordered_doc("a", 0, 5), ordered_doc("a", 1, 1)]),
                ("b", vec![ordered_doc("b", 0, 4), ordered_doc("b", 1, 2)]),
            ],
            2,
        );
        let mut p = pipeline(&["a", "b"], vec![OrderByKey::desc("v")], None, None, 10);
        let (all, _) = drain(&mut p, &fetcher);
        let values: Vec<i64> = all.iter().map(|d| d["v"].as_i64().unwrap()).collect();
        assert_eq!(values, vec![5, 4, 2, 1]);
    }

    #[test]
    fn test_ordered_pages_bounded_by_page_size() {
        let fetcher = ScriptedFetcher::new(
            vec![("a", (0..7).map(|n| ordered_doc("a", n, n as i64)).collect())],
            3,
        );
        let mut p = pipeline(&["a"], vec![OrderByKey::asc("v")], None, None, 2);
        let cancel = CancelHandle::new();
        let page = p.next_page(&fetcher, &cancel).unwrap().unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page.continuation.is_some());
    }

    #[test]
    fn test_ordered_resume_point_filters_consumed_items() {
        // Resume after (v=2, rid=b-000): only strictly later items flow.
        let fetcher = ScriptedFetcher::new(
            vec![
                ("a", vec![ordered_doc("a", 0, 1), ordered_doc("a", 1, 3)]),
                ("b", vec![ordered_doc("b", 0, 2), ordered_doc("b", 1, 4)]),
            ],
            2,
        );
        let mut p = Pipeline::new(
            "SELECT * FROM c",
            sources_for(&["a", "b"]),
            vec![OrderByKey::asc("v")],
            Some(ResumePoint {
                order_by_items: vec![Some(json!(2))],
                rid: "b-000".into(),
                inclusive: false,
            }),
            None,
            None,
            config(10),
        );
        let (all, _) = drain(&mut p, &fetcher);
        let values: Vec<i64> = all.iter().map(|d| d["v"].as_i64().unwrap()).collect();
        assert_eq!(values, vec![3, 4]);
    }

    #[test]
    fn test_ordered_continuation_round_trips_through_codec() {
        let fetcher = ScriptedFetcher::new(
            vec![
                ("a", vec![ordered_doc("a", 0, 1), ordered_doc("a", 1, 3)]),
                ("b", vec![ordered_doc("b", 0, 2), ordered_doc("b", 1, 4)]),
            ],
            1,
        );
        let mut p = pipeline(&["a", "b"], vec![OrderByKey::asc("v")], None, None, 1);
        let cancel = CancelHandle::new();
        let page = p.next_page(&fetcher, &cancel).unwrap().unwrap();
        assert_eq!(page.items[0]["v"], 1);

        let token = OrderByContinuationToken::try_decode(&page.continuation.unwrap()).unwrap();
        assert_eq!(token.rid, "a-000");
        assert_eq!(token.order_by_items[0].item, Some(json!(1)));
        assert!(!token.inclusive);
    }

    #[test]
    fn test_ordered_offset_counts_skipped_items_once() {
        let fetcher = ScriptedFetcher::new(
            vec![
                ("a", (0..5).map(|n| ordered_doc("a", n, n as i64 * 2)).collect()),
                ("b", (0..5).map(|n| ordered_doc("b", n, n as i64 * 2 + 1)).collect()),
            ],
            2,
        );
        let mut p = pipeline(
            &["a", "b"],
            vec![OrderByKey::asc("v")],
            Some(4),
            Some(3),
            10,
        );
        let (all, _) = drain(&mut p, &fetcher);
        let values: Vec<i64> = all.iter().map(|d| d["v"].as_i64().unwrap()).collect();
        // 10 merged values 0..=9; skip 3, take 4.
        assert_eq!(values, vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_ordered_large_offset_emits_mid_skip_pages() {
        // OFFSET larger than the page budget: the first pages deliver
        // nothing but carry a token with the remaining skip persisted.
        let fetcher = ScriptedFetcher::new(
            vec![("a", (0..10).map(|n| ordered_doc("a", n, n as i64)).collect())],
            5,
        );
        let mut p = pipeline(&["a"], vec![OrderByKey::asc("v")], None, Some(8), 3);
        let cancel = CancelHandle::new();

        let page = p.next_page(&fetcher, &cancel).unwrap().unwrap();
        assert!(page.items.is_empty());
        let token = page.continuation.expect("mid-skip page carries a token");
        let offset = OffsetContinuationToken::try_decode(&token).unwrap();
        assert_eq!(offset.offset, 5);

        let (rest, _) = drain(&mut p, &fetcher);
        let values: Vec<i64> = rest.iter().map(|d| d["v"].as_i64().unwrap()).collect();
        assert_eq!(values, vec![8, 9]);
    }

    #[test]
    fn test_failed_page_production_rolls_back_counters() {
        // Fetcher fails on range b; range a fetches fine first in range
        // order, but the failed wave commits neither cursor.
        struct HalfBroken(ScriptedFetcher);
        impl PageFetcher for HalfBroken {
            fn fetch_page(
                &self,
                request: crate::source::PageRequest<'_>,
            ) -> KestrelResult<FetchedPage> {
                if request.range_id.as_str() == "b" {
                    return Err(KestrelError::transport("b is down", Some(503)));
                }
                self.0.fetch_page(request)
            }
        }
        let fetcher = HalfBroken(ScriptedFetcher::new(
            vec![
                ("a", vec![ordered_doc("a", 0, 1)]),
                ("b", vec![ordered_doc("b", 0, 2)]),
            ],
            1,
        ));
        let mut p = pipeline(&["a", "b"], vec![OrderByKey::asc("v")], Some(5), None, 10);
        let cancel = CancelHandle::new();
        let err = p.next_page(&fetcher, &cancel).unwrap_err();
        assert!(matches!(err, KestrelError::Transport { .. }));
        // Nothing delivered, counter untouched, back where it started.
        assert_eq!(p.state(), ExecutionState::Idle);
        assert_eq!(p.remaining_take, Some(5));
    }

    #[test]
    fn test_empty_fetch_guard_trips() {
        // A backend that never finishes and never returns items.
        struct Stuck;
        impl PageFetcher for Stuck {
            fn fetch_page(
                &self,
                _request: crate::source::PageRequest<'_>,
            ) -> KestrelResult<FetchedPage> {
                Ok(FetchedPage {
                    items: vec![],
                    continuation: Some("again".into()),
                    request_charge: 0.5,
                })
            }
        }
        let mut p = pipeline(&["a"], vec![OrderByKey::asc("v")], None, None, 10);
        let cancel = CancelHandle::new();
        let err = p.next_page(&Stuck, &cancel).unwrap_err();
        assert!(matches!(err, KestrelError::Transport { .. }));
        assert!(err.to_string().contains("consecutive empty pages"));
    }
}
