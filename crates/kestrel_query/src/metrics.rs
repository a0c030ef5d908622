//! Per-execution counters: request charge, item and fetch counts,
//! per-range breakdown. Accumulated by the pipeline as pages commit;
//! cheap enough to keep on always.

use std::collections::HashMap;

use kestrel_common::types::RangeId;

/// Counters for one partition key range within an execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeMetrics {
    pub request_charge: f64,
    pub item_count: u64,
    pub fetch_count: u64,
    pub total_fetch_latency_us: u64,
}

/// Counters for one query execution, across all ranges it touched.
#[derive(Debug, Clone, Default)]
pub struct QueryMetrics {
    per_range: HashMap<RangeId, RangeMetrics>,
    pub total_request_charge: f64,
    pub pages_produced: u64,
}

impl QueryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one committed backend fetch.
    pub fn record_fetch(
        &mut self,
        range_id: &RangeId,
        item_count: usize,
        request_charge: f64,
        latency_us: u64,
    ) {
        let entry = self.per_range.entry(range_id.clone()).or_default();
        entry.request_charge += request_charge;
        entry.item_count += item_count as u64;
        entry.fetch_count += 1;
        entry.total_fetch_latency_us += latency_us;
        self.total_request_charge += request_charge;
    }

    pub fn record_page_produced(&mut self) {
        self.pages_produced += 1;
    }

    pub fn range(&self, range_id: &RangeId) -> Option<&RangeMetrics> {
        self.per_range.get(range_id)
    }

    pub fn ranges_touched(&self) -> usize {
        self.per_range.len()
    }

    pub fn total_fetch_count(&self) -> u64 {
        self.per_range.values().map(|m| m.fetch_count).sum()
    }
}
