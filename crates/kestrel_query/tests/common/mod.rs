#![allow(dead_code)]

//! In-memory backend shared by the integration suites: a fixed
//! topology plus per-range item lists served in backend-sized pages
//! with positional continuation strings.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};

use kestrel_common::config::KestrelConfig;
use kestrel_common::error::KestrelResult;
use kestrel_common::types::CollectionId;
use kestrel_query::topology::MAX_RANGE_BOUND;
use kestrel_query::{
    FetchedPage, PageFetcher, PageRequest, PartitionKeyRange, QueryEngine, QueryPage, QuerySpec,
    TopologyProvider,
};

pub struct TestBackend {
    ranges: Vec<PartitionKeyRange>,
    data: HashMap<String, Vec<Value>>,
    backend_page_size: usize,
}

impl TestBackend {
    /// One entry in `partitions` per range; ranges split the hash space
    /// evenly and take ids "0".."n-1".
    pub fn with_partitions(partitions: Vec<Vec<Value>>, backend_page_size: usize) -> Self {
        let ranges = even_ranges(partitions.len());
        let data = partitions
            .into_iter()
            .enumerate()
            .map(|(i, items)| (i.to_string(), items))
            .collect();
        Self {
            ranges,
            data,
            backend_page_size,
        }
    }

    pub fn with_ranges(
        ranges: Vec<PartitionKeyRange>,
        partitions: Vec<Vec<Value>>,
        backend_page_size: usize,
    ) -> Self {
        let data = ranges
            .iter()
            .zip(partitions)
            .map(|(r, items)| (r.id.as_str().to_string(), items))
            .collect();
        Self {
            ranges,
            data,
            backend_page_size,
        }
    }
}

impl TopologyProvider for TestBackend {
    fn partition_key_ranges(
        &self,
        _collection: &CollectionId,
    ) -> KestrelResult<Vec<PartitionKeyRange>> {
        Ok(self.ranges.clone())
    }
}

impl PageFetcher for TestBackend {
    fn fetch_page(&self, request: PageRequest<'_>) -> KestrelResult<FetchedPage> {
        let items = self
            .data
            .get(request.range_id.as_str())
            .cloned()
            .unwrap_or_default();
        let start: usize = match request.continuation {
            Some(c) => c.parse().expect("test continuation is a position"),
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

/// Split the hash space into `n` even ranges with ids "0".."n-1".
pub fn even_ranges(n: usize) -> Vec<PartitionKeyRange> {
    let step = u64::MAX / n as u64;
    (0..n)
        .map(|i| {
            let min = if i == 0 {
                String::new()
            } else {
                format!("{:016X}", step * i as u64)
            };
            let max = if i == n - 1 {
                MAX_RANGE_BOUND.to_string()
            } else {
                format!("{:016X}", step * (i as u64 + 1))
            };
            PartitionKeyRange::new(i.to_string(), min, max)
        })
        .collect()
}

pub fn doc(rid: &str, v: i64) -> Value {
    json!({"_rid": rid, "v": v})
}

pub fn col() -> CollectionId {
    CollectionId::from("test-col")
}

pub fn engine(backend: Arc<TestBackend>) -> QueryEngine {
    engine_with_config(backend, KestrelConfig::default())
}

pub fn engine_with_config(backend: Arc<TestBackend>, config: KestrelConfig) -> QueryEngine {
    QueryEngine::new(backend.clone(), backend, config).expect("valid test config")
}

/// Drain an execution to the terminal page, collecting every page.
pub fn collect_pages(engine: &QueryEngine, spec: QuerySpec) -> Vec<QueryPage> {
    let exec = engine.execute(&col(), spec).expect("execute");
    let mut pages = Vec::new();
    while let Some(page) = exec.next_page().expect("next_page") {
        let terminal = page.continuation.is_none();
        pages.push(page);
        if terminal {
            break;
        }
    }
    pages
}

pub fn all_items(pages: &[QueryPage]) -> Vec<Value> {
    pages.iter().flat_map(|p| p.items.iter().cloned()).collect()
}

pub fn rids(items: &[Value]) -> Vec<String> {
    items
        .iter()
        .map(|d| d["_rid"].as_str().expect("doc has _rid").to_string())
        .collect()
}

pub fn values(items: &[Value]) -> Vec<i64> {
    items
        .iter()
        .map(|d| d["v"].as_i64().expect("doc has v"))
        .collect()
}

/// Core resumability property: for every page boundary, a fresh
/// execution resumed from that boundary's token delivers exactly the
/// remaining items — nothing duplicated, nothing lost.
pub fn assert_resumable(engine: &QueryEngine, spec: &QuerySpec) {
    let pages = collect_pages(engine, spec.clone());
    let baseline = rids(&all_items(&pages));

    for stop in 0..pages.len() {
        let Some(token) = pages[stop].continuation.clone() else {
            continue;
        };
        let mut combined: Vec<String> = pages[..=stop]
            .iter()
            .flat_map(|p| rids(&p.items))
            .collect();
        let resumed = collect_pages(engine, spec.clone().with_continuation(token));
        combined.extend(rids(&all_items(&resumed)));
        assert_eq!(
            combined, baseline,
            "resume after page {stop} diverged from the uninterrupted drain"
        );
    }
}
