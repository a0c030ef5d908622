//! Continuation token codec.
//!
//! Every token variant is a value type: constructed fresh at a page
//! boundary, serialized to an opaque string, and reconstructed (never
//! mutated in place) on the next call. Equality is round-trip
//! serialization equality.
//!
//! Decoding never panics and never produces a partially-populated
//! token: any missing, extra, or wrongly-typed key is a `Decode`
//! failure, so callers can distinguish "no continuation" from "corrupt
//! continuation". Inner `sourceToken`/`token` strings are opaque to the
//! outer variant and are passed through unchanged.
//!
//! The codec does NOT check a token's embedded range against live
//! topology; that is the engine's job.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use kestrel_common::error::{KestrelError, KestrelResult};

/// Key-space window a composite token applies to. The canonical form
/// produced by the engine is `min_inclusive=false, max_inclusive=true`
/// (half-open, closed on the right).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenRange {
    pub min: String,
    pub max: String,
    #[serde(rename = "minInclusive")]
    pub min_inclusive: bool,
    #[serde(rename = "maxInclusive")]
    pub max_inclusive: bool,
}

impl TokenRange {
    /// Canonical window for a partition key range `[min, max)`.
    pub fn canonical(min: impl Into<String>, max: impl Into<String>) -> Self {
        Self {
            min: min.into(),
            max: max.into(),
            min_inclusive: false,
            max_inclusive: true,
        }
    }

    fn validate(&self) -> KestrelResult<()> {
        if self.min > self.max {
            return Err(KestrelError::decode(format!(
                "range.min {:?} collates after range.max {:?}",
                self.min, self.max
            )));
        }
        Ok(())
    }
}

/// Opaque per-range sub-token paired with the key range it applies to.
///
/// An empty `token` string means "range not yet started" (the wire
/// shape requires a string, so absence is spelled `""`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompositeContinuationToken {
    pub token: String,
    pub range: TokenRange,
}

impl CompositeContinuationToken {
    pub fn new(token: Option<String>, range: TokenRange) -> Self {
        Self {
            token: token.unwrap_or_default(),
            range,
        }
    }

    /// The sub-token as the fetch layer wants it: `None` when the range
    /// has not been started.
    pub fn sub_token(&self) -> Option<&str> {
        if self.token.is_empty() {
            None
        } else {
            Some(&self.token)
        }
    }

    pub fn encode(&self) -> KestrelResult<String> {
        to_token_string(self)
    }

    pub fn try_decode(s: &str) -> KestrelResult<Self> {
        let token: Self = from_token_string(s)?;
        token.range.validate()?;
        Ok(token)
    }
}

/// One ORDER BY projection value inside an order-by token. A present
/// value serializes as `{"item": <value>}`; an undefined/missing
/// projection serializes as `{}` — JSON `null` is a *present* null and
/// sorts differently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrderByItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<Value>,
}

impl OrderByItem {
    pub fn defined(value: Value) -> Self {
        Self { item: Some(value) }
    }

    pub fn undefined() -> Self {
        Self { item: None }
    }
}

/// Resume point for an ORDER BY merge: the composite token of the range
/// the stream stopped in, plus the last yielded (projection, rid) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrderByContinuationToken {
    #[serde(rename = "compositeToken")]
    pub composite_token: CompositeContinuationToken,
    #[serde(rename = "orderByItems")]
    pub order_by_items: Vec<OrderByItem>,
    pub rid: String,
    pub inclusive: bool,
}

impl OrderByContinuationToken {
    pub fn encode(&self) -> KestrelResult<String> {
        to_token_string(self)
    }

    pub fn try_decode(s: &str) -> KestrelResult<Self> {
        let token: Self = from_token_string(s)?;
        token.composite_token.range.validate()?;
        if token.order_by_items.is_empty() {
            return Err(KestrelError::decode(
                "order-by continuation has empty orderByItems",
            ));
        }
        Ok(token)
    }
}

/// Remaining TOP/LIMIT count wrapping an inner continuation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TakeContinuationToken {
    #[serde(rename = "takeCount")]
    pub take_count: u64,
    #[serde(rename = "sourceToken")]
    pub source_token: String,
}

impl TakeContinuationToken {
    pub fn encode(&self) -> KestrelResult<String> {
        to_token_string(self)
    }

    pub fn try_decode(s: &str) -> KestrelResult<Self> {
        from_token_string(s)
    }
}

/// Remaining OFFSET skip count wrapping an inner continuation.
/// Persisting the counter means resuming mid-skip does not re-skip
/// already-skipped items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OffsetContinuationToken {
    pub offset: u64,
    #[serde(rename = "sourceToken")]
    pub source_token: String,
}

impl OffsetContinuationToken {
    pub fn encode(&self) -> KestrelResult<String> {
        to_token_string(self)
    }

    pub fn try_decode(s: &str) -> KestrelResult<Self> {
        from_token_string(s)
    }
}

/// Encode the plain cross-partition continuation: a JSON array holding
/// one composite token per unfinished range.
pub fn encode_composite_set(tokens: &[CompositeContinuationToken]) -> KestrelResult<String> {
    to_token_string(&tokens)
}

/// Decode the plain cross-partition continuation. The array must be
/// non-empty and every element structurally valid.
pub fn try_decode_composite_set(s: &str) -> KestrelResult<Vec<CompositeContinuationToken>> {
    let tokens: Vec<CompositeContinuationToken> = from_token_string(s)?;
    if tokens.is_empty() {
        return Err(KestrelError::decode(
            "composite continuation set is empty",
        ));
    }
    for t in &tokens {
        t.range.validate()?;
    }
    Ok(tokens)
}

fn to_token_string<T: Serialize>(token: &T) -> KestrelResult<String> {
    serde_json::to_string(token).map_err(|e| {
        KestrelError::internal_bug(
            "E-TOKEN-001",
            "continuation token failed to serialize",
            e.to_string(),
        )
    })
}

fn from_token_string<'a, T: Deserialize<'a>>(s: &'a str) -> KestrelResult<T> {
    serde_json::from_str(s).map_err(|e| KestrelError::decode(e.to_string()))
}
