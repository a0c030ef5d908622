use thiserror::Error;

use crate::types::RangeId;

/// Convenience alias for `Result<T, KestrelError>`.
pub type KestrelResult<T> = Result<T, KestrelError>;

/// Error classification for retry/escalation decisions.
///
/// - `UserError`   — malformed query shape or continuation token; fix the request
/// - `Retryable`   — topology moved under us (range split/gone); re-resolve and retry
/// - `Transient`   — timeout, cancellation, collaborator unavailable; client MAY retry
/// - `InternalBug` — should never happen; merge bookkeeping violated an invariant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Retryable,
    Transient,
    InternalBug,
}

/// Top-level error type for the query execution engine.
///
/// Every variant aborts only the *current page production*; a fresh
/// call with a valid (or absent) continuation can still succeed.
#[derive(Error, Debug)]
pub enum KestrelError {
    /// Malformed query shape: cross-partition disabled on a fan-out
    /// query, order-by continuation arity mismatch, and similar.
    /// Surfaced before any fetch is issued.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Continuation token structurally invalid. Never silently treated
    /// as "no continuation".
    #[error("Continuation decode failed: {reason}")]
    Decode { reason: String },

    /// Partitioning metadata could not be obtained from the topology
    /// collaborator. Not retried internally; callers retry.
    #[error("Partition metadata unavailable: {0}")]
    MetadataUnavailable(String),

    /// A range referenced by a continuation or the active topology no
    /// longer exists (split/merge). The engine does not re-resolve on
    /// its own; callers decide.
    #[error("Range {range_id} gone: {reason}")]
    RangeGone { range_id: RangeId, reason: String },

    /// Opaque failure from the page-fetch collaborator, propagated
    /// unchanged. Retries, if any, belong to the transport layer.
    #[error("Transport error: {reason}")]
    Transport {
        reason: String,
        /// HTTP-ish status carried by the collaborator, when it has one.
        status_code: Option<u16>,
    },

    /// End-to-end page-production deadline exceeded. Completed
    /// sub-results are discarded; never reported as an empty page.
    #[error("Query timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// Caller-initiated cancellation, distinguished from completion.
    #[error("Query cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),

    /// Internal bug — should never occur in production.
    /// Always carries a unique `error_code` and `debug_context` for post-mortem.
    #[error("InternalBug [{error_code}]: {message} | context: {debug_context}")]
    InternalBug {
        error_code: &'static str,
        message: String,
        debug_context: String,
    },
}

impl KestrelError {
    /// Classify this error for retry/escalation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            KestrelError::BadRequest(_) => ErrorKind::UserError,
            KestrelError::Decode { .. } => ErrorKind::UserError,

            KestrelError::RangeGone { .. } => ErrorKind::Retryable,

            KestrelError::MetadataUnavailable(_) => ErrorKind::Transient,
            KestrelError::Transport { .. } => ErrorKind::Transient,
            KestrelError::Timeout { .. } => ErrorKind::Transient,
            KestrelError::Cancelled => ErrorKind::Transient,

            KestrelError::Internal(_) => ErrorKind::InternalBug,
            KestrelError::InternalBug { .. } => ErrorKind::InternalBug,
        }
    }

    /// Returns true if this is a user/input error (4xx equivalent).
    pub fn is_user_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::UserError)
    }

    /// Returns true if the caller should re-resolve topology and retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable)
    }

    /// Returns true if this is a transient collaborator/deadline error.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    /// Returns true if this is an internal bug that should never occur.
    pub fn is_internal_bug(&self) -> bool {
        matches!(self.kind(), ErrorKind::InternalBug)
    }

    /// Map to the HTTP status a request-level front end would surface.
    pub fn http_status(&self) -> u16 {
        match self {
            KestrelError::BadRequest(_) => 400,
            KestrelError::Decode { .. } => 400,
            KestrelError::RangeGone { .. } => 410,
            KestrelError::MetadataUnavailable(_) => 503,
            KestrelError::Transport { status_code, .. } => status_code.unwrap_or(503),
            KestrelError::Timeout { .. } => 408,
            KestrelError::Cancelled => 499,
            KestrelError::Internal(_) => 500,
            KestrelError::InternalBug { .. } => 500,
        }
    }

    /// Construct a decode failure.
    pub fn decode(reason: impl Into<String>) -> Self {
        KestrelError::Decode {
            reason: reason.into(),
        }
    }

    /// Construct a transport failure with an optional status code.
    pub fn transport(reason: impl Into<String>, status_code: Option<u16>) -> Self {
        KestrelError::Transport {
            reason: reason.into(),
            status_code,
        }
    }

    /// Construct a range-gone signal.
    pub fn range_gone(range_id: RangeId, reason: impl Into<String>) -> Self {
        KestrelError::RangeGone {
            range_id,
            reason: reason.into(),
        }
    }

    /// Construct an internal bug error with error code and context.
    pub fn internal_bug(
        error_code: &'static str,
        message: impl Into<String>,
        debug_context: impl Into<String>,
    ) -> Self {
        KestrelError::InternalBug {
            error_code,
            message: message.into(),
            debug_context: debug_context.into(),
        }
    }

    /// Add context string to an error, **preserving error classification**.
    ///
    /// Structured variants keep their shape with the context prepended
    /// to the human-readable field; other variants are wrapped as
    /// `Internal` with a context prefix (last resort).
    pub fn with_context(self, ctx: impl Into<String>) -> Self {
        let ctx = ctx.into();
        match self {
            KestrelError::BadRequest(msg) => KestrelError::BadRequest(format!("{ctx}: {msg}")),
            KestrelError::Decode { reason } => KestrelError::Decode {
                reason: format!("{ctx}: {reason}"),
            },
            KestrelError::MetadataUnavailable(msg) => {
                KestrelError::MetadataUnavailable(format!("{ctx}: {msg}"))
            }
            KestrelError::RangeGone { range_id, reason } => KestrelError::RangeGone {
                range_id,
                reason: format!("{ctx}: {reason}"),
            },
            KestrelError::Transport {
                reason,
                status_code,
            } => KestrelError::Transport {
                reason: format!("{ctx}: {reason}"),
                status_code,
            },
            KestrelError::Internal(msg) => KestrelError::Internal(format!("{ctx}: {msg}")),
            KestrelError::InternalBug {
                error_code,
                message,
                debug_context,
            } => KestrelError::InternalBug {
                error_code,
                message: format!("{ctx}: {message}"),
                debug_context,
            },
            // Timeout/Cancelled carry no free-form field worth rewriting.
            other => other,
        }
    }

    /// Emit a structured log entry for InternalBug errors.
    /// Must be called before an InternalBug is returned to the caller.
    pub fn log_if_fatal(&self) {
        if let KestrelError::InternalBug {
            error_code,
            message,
            debug_context,
        } = self
        {
            tracing::error!(
                error_code = error_code,
                http_status = self.http_status(),
                debug_context = debug_context.as_str(),
                "FATAL [{}]: {} | context: {}",
                error_code,
                message,
                debug_context
            );
        }
    }
}

/// Add context to a Result, preserving error classification.
/// Usage: `some_result.ctx("stage=merge, range=3")?`
pub trait ErrorContext<T> {
    fn ctx(self, context: &str) -> Result<T, KestrelError>;
    fn ctx_with(self, f: impl FnOnce() -> String) -> Result<T, KestrelError>;
}

impl<T, E: Into<KestrelError>> ErrorContext<T> for Result<T, E> {
    fn ctx(self, context: &str) -> Result<T, KestrelError> {
        self.map_err(|e| e.into().with_context(context))
    }
    fn ctx_with(self, f: impl FnOnce() -> String) -> Result<T, KestrelError> {
        self.map_err(|e| e.into().with_context(f()))
    }
}
