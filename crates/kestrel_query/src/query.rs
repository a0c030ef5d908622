//! Inbound query description: the compiled query plus its declared
//! pagination mode. Query *planning* (parsing SQL text) happens
//! upstream; the engine takes this shape as given.

use serde::{Deserialize, Serialize};

/// Sort direction for one ORDER BY key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// One ORDER BY projection: a document path plus direction.
///
/// Paths are dotted (`"address.city"`) or JSON-pointer style
/// (`"/address/city"`); both resolve the same way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderByKey {
    pub path: String,
    pub order: SortOrder,
}

impl OrderByKey {
    pub fn asc(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            order: SortOrder::Ascending,
        }
    }

    pub fn desc(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            order: SortOrder::Descending,
        }
    }
}

/// A compiled query plus pagination mode, as handed to the engine.
#[derive(Debug, Clone)]
pub struct QuerySpec {
    pub query_text: String,
    /// ORDER BY projection keys; empty = unordered merge.
    pub order_by: Vec<OrderByKey>,
    /// TOP N. Negative = unlimited; `Some(0)` yields zero items but is
    /// NOT "unlimited".
    pub top: Option<i64>,
    /// OFFSET: merged items to discard before yielding.
    pub offset: Option<u64>,
    /// LIMIT: merged items to yield after the offset.
    pub limit: Option<u64>,
    /// Single partition key; `None` = all ranges.
    pub partition_key: Option<String>,
    /// Must be true for a query touching more than one range.
    pub cross_partition_enabled: bool,
    /// Page size; `<= 0` means "use the configured default".
    pub max_item_count: i32,
    /// Degree of per-range fetch parallelism. Negative = unbounded,
    /// 0 = sequential, n > 0 = bounded. `None` = engine default.
    pub max_degree_of_parallelism: Option<i32>,
    /// Continuation token returned by a previous page, if resuming.
    pub continuation: Option<String>,
}

impl QuerySpec {
    pub fn new(query_text: impl Into<String>) -> Self {
        Self {
            query_text: query_text.into(),
            order_by: Vec::new(),
            top: None,
            offset: None,
            limit: None,
            partition_key: None,
            cross_partition_enabled: false,
            max_item_count: -1,
            max_degree_of_parallelism: None,
            continuation: None,
        }
    }

    pub fn with_order_by(mut self, keys: Vec<OrderByKey>) -> Self {
        self.order_by = keys;
        self
    }

    pub fn with_top(mut self, top: i64) -> Self {
        self.top = Some(top);
        self
    }

    pub fn with_offset_limit(mut self, offset: u64, limit: Option<u64>) -> Self {
        self.offset = Some(offset);
        self.limit = limit;
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_partition_key(mut self, pk: impl Into<String>) -> Self {
        self.partition_key = Some(pk.into());
        self
    }

    pub fn cross_partition(mut self, enabled: bool) -> Self {
        self.cross_partition_enabled = enabled;
        self
    }

    pub fn with_max_item_count(mut self, n: i32) -> Self {
        self.max_item_count = n;
        self
    }

    pub fn with_max_degree_of_parallelism(mut self, dop: i32) -> Self {
        self.max_degree_of_parallelism = Some(dop);
        self
    }

    pub fn with_continuation(mut self, token: impl Into<String>) -> Self {
        self.continuation = Some(token.into());
        self
    }

    /// TOP N normalized: negative values mean unlimited.
    pub fn effective_top(&self) -> Option<u64> {
        match self.top {
            Some(n) if n >= 0 => Some(n as u64),
            _ => None,
        }
    }

    /// True when a TOP or LIMIT counter wraps the merge stream.
    pub fn has_take(&self) -> bool {
        self.effective_top().is_some() || self.limit.is_some()
    }
}
