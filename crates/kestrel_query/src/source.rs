//! Per-range page source: wraps the external page-fetch primitive for
//! one partition key range and tracks that range's cursor.
//!
//! Cursor mutation is two-phase: `begin_fetch` snapshots the request
//! (no mutation), and `apply_page` commits the result. The split lets
//! the fan-out layer run fetches concurrently and then *discard* all
//! results on timeout or cancellation without having advanced any
//! cursor — a discarded page is simply re-fetched later.

use serde_json::Value;

use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::types::RangeId;

use crate::topology::PartitionKeyRange;

/// One page-fetch request against a single partition key range.
#[derive(Debug, Clone)]
pub struct PageRequest<'a> {
    pub range_id: &'a RangeId,
    pub query_text: &'a str,
    /// Per-range sub-continuation from the previous page, if any.
    pub continuation: Option<&'a str>,
    pub page_size_hint: usize,
}

/// One page of raw results from a single range.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub items: Vec<Value>,
    /// `None` signals the range is exhausted for this query.
    pub continuation: Option<String>,
    pub request_charge: f64,
}

/// The single collaborator primitive the engine consumes: given a range
/// id, a query, and continuation state, return one page of raw items
/// plus a per-range continuation string and a request charge.
///
/// Implementations own transport concerns (HTTP/TCP, retries,
/// consistency negotiation); the engine adds no retry logic of its own.
pub trait PageFetcher: Send + Sync {
    fn fetch_page(&self, request: PageRequest<'_>) -> KestrelResult<FetchedPage>;
}

/// Per-range cursor state. Owned exclusively by the pipeline driving
/// it; mutated only through `apply_page` after a successful fetch.
#[derive(Debug, Clone)]
pub struct RangeCursor {
    pub range: PartitionKeyRange,
    /// Sub-continuation for the *next* fetch (`None` before the first
    /// page, and meaningless once `exhausted`).
    pub sub_continuation: Option<String>,
    /// Sub-continuation that produced the most recently applied page.
    /// This is the token a resuming process needs while that page's
    /// items have not all been delivered. `None` before the first page
    /// commits, meaning the range resumes from scratch.
    pub buffer_origin: Option<String>,
    pub exhausted: bool,
}

/// Snapshot of everything a concurrent fetch task needs; taking one
/// does not mutate the cursor.
#[derive(Debug, Clone)]
pub struct FetchSpec {
    pub range_id: RangeId,
    pub continuation: Option<String>,
}

/// Drives the page-fetch primitive for one range.
#[derive(Debug)]
pub struct RangePageSource {
    cursor: RangeCursor,
}

impl RangePageSource {
    /// `resume_token` carries a decoded continuation's per-range
    /// sub-token; `None` starts the range from scratch.
    pub fn new(range: PartitionKeyRange, resume_token: Option<String>) -> Self {
        Self {
            cursor: RangeCursor {
                range,
                sub_continuation: resume_token,
                buffer_origin: None,
                exhausted: false,
            },
        }
    }

    pub fn range(&self) -> &PartitionKeyRange {
        &self.cursor.range
    }

    pub fn range_id(&self) -> &RangeId {
        &self.cursor.range.id
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor.exhausted
    }

    /// Sub-continuation a resuming process should use for this range:
    /// the origin of the current (possibly undelivered) page when one
    /// exists, otherwise the next-fetch token.
    pub fn resume_token_for_buffered_page(&self) -> Option<String> {
        self.cursor.buffer_origin.clone()
    }

    pub fn resume_token_for_next_fetch(&self) -> Option<String> {
        self.cursor.sub_continuation.clone()
    }

    /// Snapshot the next fetch request. Calling this on an exhausted
    /// range is a bookkeeping bug, not a recoverable condition.
    pub fn begin_fetch(&self) -> KestrelResult<FetchSpec> {
        if self.cursor.exhausted {
            return Err(KestrelError::internal_bug(
                "E-SRC-001",
                "fetch issued against exhausted range",
                format!("range={}", self.cursor.range.id),
            ));
        }
        Ok(FetchSpec {
            range_id: self.cursor.range.id.clone(),
            continuation: self.cursor.sub_continuation.clone(),
        })
    }

    /// Commit a successfully fetched page to the cursor.
    pub fn apply_page(&mut self, page: &FetchedPage) {
        self.cursor.buffer_origin = self.cursor.sub_continuation.take();
        self.cursor.sub_continuation = page.continuation.clone();
        self.cursor.exhausted = page.continuation.is_none();
    }
}

/// Map a collaborator error for `range_id`: a "gone" signal (HTTP 410)
/// becomes the distinguishable `RangeGone` kind so a caller layer can
/// decide to re-resolve; everything else passes through unchanged.
pub(crate) fn map_fetch_error(range_id: &RangeId, err: KestrelError) -> KestrelError {
    match err {
        KestrelError::Transport {
            reason,
            status_code: Some(410),
        } => KestrelError::range_gone(range_id.clone(), reason),
        other => other,
    }
}
