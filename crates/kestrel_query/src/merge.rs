//! Merge comparators and the merged-item representation.
//!
//! The ordered policy's total order is `(order-by tuple, rid)`:
//! undefined/missing projection values sort before all present values
//! regardless of ASC/DESC (direction flips only the defined-value
//! comparison), and the document resource id breaks every remaining
//! tie so the order is total even when projection values collide.

use std::cmp::Ordering;

use serde_json::Value;

use kestrel_common::types::{RangeId, Rid};

use crate::query::{OrderByKey, SortOrder};

/// One document flowing through the ordered merge: the payload, the
/// projected ORDER BY tuple (`None` = undefined/missing), and the
/// source range id for diagnostics.
#[derive(Debug, Clone)]
pub struct MergeItem {
    pub payload: Value,
    pub order_by_items: Vec<Option<Value>>,
    pub rid: Rid,
    pub range_id: RangeId,
}

impl MergeItem {
    /// Project a raw document into a merge item under the given keys.
    pub fn project(payload: Value, keys: &[OrderByKey], range_id: &RangeId) -> Self {
        let order_by_items = keys
            .iter()
            .map(|k| project_path(&payload, &k.path).cloned())
            .collect();
        let rid = extract_rid(&payload);
        Self {
            payload,
            order_by_items,
            rid,
            range_id: range_id.clone(),
        }
    }
}

/// Resolve a dotted or JSON-pointer path inside a document.
/// Returns `None` for a missing path (undefined), which is distinct
/// from a present JSON `null`.
pub fn project_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    if let Some(pointer) = path.strip_prefix('/') {
        return doc.pointer(&format!("/{pointer}"));
    }
    let mut current = doc;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Deterministic tie-break id: the document's `_rid`, falling back to
/// `id`. Documents without either sort together on the empty string
/// (and then nothing distinguishes them, which is acceptable only for
/// stores that always stamp a resource id).
pub fn extract_rid(doc: &Value) -> Rid {
    let rid = doc
        .get("_rid")
        .and_then(Value::as_str)
        .or_else(|| doc.get("id").and_then(Value::as_str))
        .unwrap_or_default();
    Rid(rid.to_string())
}

/// Rank JSON types so cross-type comparisons are total:
/// null < bool < number < string < array < object.
fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Compare two *present* JSON values. Same-type values compare on
/// content; different types compare on rank. Arrays and objects of the
/// same type are not ordered further (the rid tie-break disambiguates).
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let xf = x.as_f64().unwrap_or(f64::NAN);
            let yf = y.as_f64().unwrap_or(f64::NAN);
            xf.partial_cmp(&yf).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Compare one projection slot: undefined-first, then by value with the
/// declared direction applied to defined-vs-defined only.
fn compare_slot(a: Option<&Value>, b: Option<&Value>, order: SortOrder) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(va), Some(vb)) => {
            let ord = compare_values(va, vb);
            match order {
                SortOrder::Ascending => ord,
                SortOrder::Descending => ord.reverse(),
            }
        }
    }
}

/// Compare two projection tuples under the declared key directions,
/// without the rid tie-break.
pub fn compare_order_by_tuples(
    a: &[Option<Value>],
    b: &[Option<Value>],
    keys: &[OrderByKey],
) -> Ordering {
    for (i, key) in keys.iter().enumerate() {
        let ord = compare_slot(
            a.get(i).and_then(Option::as_ref),
            b.get(i).and_then(Option::as_ref),
            key.order,
        );
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Full merge order: projection tuple, then rid ascending. The rid leg
/// never flips with direction; it only has to be deterministic.
pub fn compare_merge_items(a: &MergeItem, b: &MergeItem, keys: &[OrderByKey]) -> Ordering {
    compare_order_by_tuples(&a.order_by_items, &b.order_by_items, keys)
        .then_with(|| a.rid.cmp(&b.rid))
}
