//! # Error Taxonomy
//!
//! Purpose: Define the single error type every caller-visible radx call
//! returns. Transport and cluster errors are translated into this taxonomy at
//! the request executor boundary, so nothing lower-level leaks out.
//!
//! ## Error Classes
//! 1. **Fatal**: `Connection`, `NotConnected`, `PoolNotFound`, `Validation`.
//! 2. **Expected**: `NotFound` is a normal answer and is not logged as a failure.
//! 3. **Transient**: `Io` is retried internally for idempotent operations.
//! 4. **Caller decides**: `Timeout` and `Cancelled` are never retried automatically.

use std::fmt;
use std::time::Duration;

/// Result alias used across the radx crates.
pub type RadxResult<T> = Result<T, RadxError>;

/// Errors surfaced to radx callers.
///
/// Every variant carries enough context to produce a useful message on its own.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RadxError {
    /// Cluster unreachable, authentication rejected, or connect budget exhausted.
    #[error("connection error: {0}")]
    Connection(String),

    /// The connection is not in the `Connected` state.
    #[error("connection is {state}, cannot {action}")]
    NotConnected { state: String, action: String },

    /// The named pool does not exist.
    #[error("pool not found: {0}")]
    PoolNotFound(String),

    /// The object does not exist.
    #[error("object not found: {0}")]
    NotFound(String),

    /// Transport failure, or a mutation that may have been partially applied.
    #[error("io error: {0}")]
    Io(String),

    /// The operation deadline expired before a reply arrived.
    #[error("{op} timed out after {elapsed:?}")]
    Timeout { op: String, elapsed: Duration },

    /// The caller supplied an invalid argument.
    #[error("validation error: {0}")]
    Validation(String),

    /// The pool quota would be exceeded by the write.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,
}

/// Coarse classification of `RadxError` for matching and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    NotConnected,
    PoolNotFound,
    NotFound,
    Io,
    Timeout,
    Validation,
    QuotaExceeded,
    Cancelled,
}

impl RadxError {
    /// Returns the classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RadxError::Connection(_) => ErrorKind::Connection,
            RadxError::NotConnected { .. } => ErrorKind::NotConnected,
            RadxError::PoolNotFound(_) => ErrorKind::PoolNotFound,
            RadxError::NotFound(_) => ErrorKind::NotFound,
            RadxError::Io(_) => ErrorKind::Io,
            RadxError::Timeout { .. } => ErrorKind::Timeout,
            RadxError::Validation(_) => ErrorKind::Validation,
            RadxError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            RadxError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Returns true for outcomes that are answers rather than failures.
    pub fn is_expected(&self) -> bool {
        matches!(self, RadxError::NotFound(_))
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        RadxError::Validation(message.into())
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Connection => "connection",
            ErrorKind::NotConnected => "not_connected",
            ErrorKind::PoolNotFound => "pool_not_found",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Io => "io",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Validation => "validation",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(RadxError::NotFound("k".into()).kind(), ErrorKind::NotFound);
        assert_eq!(RadxError::Cancelled.kind(), ErrorKind::Cancelled);
        let timeout = RadxError::Timeout {
            op: "read".into(),
            elapsed: Duration::from_millis(1),
        };
        assert_eq!(timeout.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn only_not_found_is_expected() {
        assert!(RadxError::NotFound("k".into()).is_expected());
        assert!(!RadxError::Io("reset".into()).is_expected());
    }

    #[test]
    fn messages_carry_context() {
        let err = RadxError::NotConnected {
            state: "closed".into(),
            action: "open pool".into(),
        };
        assert_eq!(err.to_string(), "connection is closed, cannot open pool");
        assert_eq!(
            RadxError::PoolNotFound("data".into()).to_string(),
            "pool not found: data"
        );
    }
}
