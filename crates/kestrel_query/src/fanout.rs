//! Concurrent fan-out of page fetches across partition key ranges.
//!
//! Fetches are issued in waves sized by the degree of parallelism:
//! negative = one wave covering every pending range, 0 = strictly
//! sequential, n > 0 = waves of at most n. Results are returned to the
//! caller for commit; nothing here mutates cursor state, so a wave
//! abandoned on timeout or cancellation leaves every cursor where it
//! was.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use kestrel_common::error::{KestrelError, KestrelResult};

use crate::source::{map_fetch_error, FetchSpec, FetchedPage, PageFetcher, PageRequest};

/// Cooperative cancellation flag shared between a caller and an
/// in-flight execution. Checked between waves, not mid-fetch; an
/// individual fetch already on the wire runs to completion and its
/// result is discarded.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Everything a wave of fetches shares: the collaborator, the query,
/// and the deadline/cancel gates.
pub struct FanoutContext<'a> {
    pub fetcher: &'a dyn PageFetcher,
    pub query_text: &'a str,
    pub page_size_hint: usize,
    /// Wall-clock start of the current page production, for timeout
    /// reporting.
    pub started_at: Instant,
    /// Absolute deadline; `None` disables the timeout gate.
    pub deadline: Option<Instant>,
    pub cancel: &'a CancelHandle,
}

impl FanoutContext<'_> {
    /// Gate shared by wave boundaries: cancellation wins over timeout.
    fn check_gates(&self) -> KestrelResult<()> {
        if self.cancel.is_cancelled() {
            return Err(KestrelError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(KestrelError::Timeout {
                    elapsed_ms: self.started_at.elapsed().as_millis() as u64,
                });
            }
        }
        Ok(())
    }
}

/// One completed fetch, tagged with the caller's source index so
/// results can be committed to the right cursor.
#[derive(Debug)]
pub struct FetchOutcome {
    pub source_index: usize,
    pub page: FetchedPage,
    pub latency_us: u64,
}

/// Normalize a degree-of-parallelism knob into a wave size for `n`
/// pending fetches.
fn wave_size(dop: i32, pending: usize) -> usize {
    if dop < 0 {
        pending.max(1)
    } else if dop == 0 {
        1
    } else {
        (dop as usize).min(pending).max(1)
    }
}

fn run_one_fetch(ctx: &FanoutContext<'_>, index: usize, spec: &FetchSpec) -> KestrelResult<FetchOutcome> {
    let started = Instant::now();
    let request = PageRequest {
        range_id: &spec.range_id,
        query_text: ctx.query_text,
        continuation: spec.continuation.as_deref(),
        page_size_hint: ctx.page_size_hint,
    };
    let page = ctx.fetcher.fetch_page(request).map_err(|e| {
        let e = map_fetch_error(&spec.range_id, e);
        tracing::warn!(range_id = %spec.range_id, error = %e, "range fetch failed");
        e
    })?;
    tracing::trace!(
        range_id = %spec.range_id,
        items = page.items.len(),
        exhausted = page.continuation.is_none(),
        "fetched page"
    );
    Ok(FetchOutcome {
        source_index: index,
        page,
        latency_us: started.elapsed().as_micros() as u64,
    })
}

/// Execute every fetch in `specs`, in waves of the given degree of
/// parallelism. Fail-fast: the first fetch error aborts the whole call
/// (remaining waves are not issued), and the caller commits nothing.
///
/// The gates are checked before each wave and once more after the last
/// join, so a page production that blew its deadline mid-wave reports
/// `Timeout` rather than returning data assembled past the deadline.
pub fn fetch_all(
    ctx: &FanoutContext<'_>,
    specs: &[(usize, FetchSpec)],
    dop: i32,
) -> KestrelResult<Vec<FetchOutcome>> {
    let mut outcomes = Vec::with_capacity(specs.len());
    if specs.is_empty() {
        return Ok(outcomes);
    }
    let wave = wave_size(dop, specs.len());

    for chunk in specs.chunks(wave) {
        ctx.check_gates()?;

        if chunk.len() == 1 {
            let (index, spec) = &chunk[0];
            outcomes.push(run_one_fetch(ctx, *index, spec)?);
            continue;
        }

        let mut wave_results: Vec<KestrelResult<FetchOutcome>> =
            std::thread::scope(|scope| {
                let handles: Vec<_> = chunk
                    .iter()
                    .map(|(index, spec)| scope.spawn(move || run_one_fetch(ctx, *index, spec)))
                    .collect();
                handles
                    .into_iter()
                    .map(|h| match h.join() {
                        Ok(result) => result,
                        Err(_) => Err(KestrelError::internal_bug(
                            "E-FAN-001",
                            "fetch worker panicked",
                            format!("wave_size={}", chunk.len()),
                        )),
                    })
                    .collect()
            });

        for result in wave_results.drain(..) {
            outcomes.push(result?);
        }
    }

    ctx.check_gates()?;
    Ok(outcomes)
}
