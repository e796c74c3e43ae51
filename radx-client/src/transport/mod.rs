//! # Transport Boundary
//!
//! Purpose: Define the interface between the request executor and whatever
//! actually carries requests to the cluster.
//!
//! ## Design Principles
//! 1. **Strategy Pattern**: A Connection is built over an `Arc<dyn Transport>`,
//!    chosen at construction time.
//! 2. **Raw Errors Stay Here**: `TransportError` never reaches callers; the
//!    executor translates it into `RadxError`.
//! 3. **Request Ids**: every request carries the executor's `tid` so the
//!    transport can cancel it on timeout or caller cancellation.
//!
//! ## Variants
//! - `MemoryTransport`: non-blocking, runs against a `MemoryCluster` in-task.
//! - `BlockingTransport`: drives a synchronous `BlockingBackend` on the blocking pool.
//! - `FaultInjector`: wraps another transport to inject failures and latency.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;

use radx_common::{
    Ack, ClusterConfig, Credentials, ObjectRef, ObjectStat, OpKind, PoolId, PoolInfo, RequestToken,
};

mod blocking;
mod fault;
mod memory;

pub use blocking::{BlockingBackend, BlockingTransport};
pub use fault::FaultInjector;
pub use memory::MemoryTransport;

/// Result type for transport calls.
pub type TransportResult<T> = Result<T, TransportError>;

/// Low-level failures reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Object does not exist.
    #[error("no such object")]
    NoEntry,
    /// Pool does not exist.
    #[error("no such pool: {0}")]
    NoPool(String),
    /// Pool quota would be exceeded.
    #[error("quota exceeded for pool {0}")]
    QuotaExceeded(String),
    /// Cluster refused the session (credentials or identity).
    #[error("rejected: {0}")]
    Rejected(String),
    /// No endpoint answered.
    #[error("unreachable: {0}")]
    Unreachable(String),
    /// Connection dropped mid-request; the request may or may not have been applied.
    #[error("connection reset: {0}")]
    Reset(String),
    /// Cluster rejected the request arguments.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Request was cancelled before it ran.
    #[error("request cancelled")]
    Cancelled,
    /// Transport is not connected.
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Returns true for network-level failures worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Unreachable(_) | TransportError::Reset(_))
    }
}

/// Session established by `Transport::connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    /// Cluster-assigned client instance id, used in request tokens.
    pub instance_id: u64,
}

/// One request as seen by a transport.
#[derive(Debug, Clone)]
pub struct Request {
    /// Executor-assigned request id, stable across retries.
    pub tid: u64,
    pub op: RequestOp,
}

/// Request payloads.
#[derive(Debug, Clone)]
pub enum RequestOp {
    Read {
        object: ObjectRef,
        offset: u64,
        length: u64,
    },
    Write {
        object: ObjectRef,
        offset: u64,
        data: Bytes,
        token: RequestToken,
    },
    WriteFull {
        object: ObjectRef,
        data: Bytes,
        token: RequestToken,
    },
    Append {
        object: ObjectRef,
        data: Bytes,
        token: RequestToken,
    },
    Remove {
        object: ObjectRef,
        token: RequestToken,
    },
    Stat {
        object: ObjectRef,
    },
    PoolLookup {
        name: String,
    },
    PoolName {
        id: PoolId,
    },
    PoolList,
}

impl RequestOp {
    /// Object operation kind, or `None` for pool-level requests.
    pub fn kind(&self) -> Option<OpKind> {
        match self {
            RequestOp::Read { .. } => Some(OpKind::Read),
            RequestOp::Write { .. } => Some(OpKind::Write),
            RequestOp::WriteFull { .. } => Some(OpKind::WriteFull),
            RequestOp::Append { .. } => Some(OpKind::Append),
            RequestOp::Remove { .. } => Some(OpKind::Remove),
            RequestOp::Stat { .. } => Some(OpKind::Stat),
            RequestOp::PoolLookup { .. } | RequestOp::PoolName { .. } | RequestOp::PoolList => None,
        }
    }

    /// Pool-level requests are read-only and always safe to resend.
    pub fn is_idempotent(&self) -> bool {
        self.kind().map(OpKind::is_idempotent).unwrap_or(true)
    }

    pub fn is_mutation(&self) -> bool {
        self.kind().map(OpKind::is_mutation).unwrap_or(false)
    }

    pub fn object(&self) -> Option<&ObjectRef> {
        match self {
            RequestOp::Read { object, .. }
            | RequestOp::Write { object, .. }
            | RequestOp::WriteFull { object, .. }
            | RequestOp::Append { object, .. }
            | RequestOp::Remove { object, .. }
            | RequestOp::Stat { object } => Some(object),
            RequestOp::PoolLookup { .. } | RequestOp::PoolName { .. } | RequestOp::PoolList => None,
        }
    }

    /// Name of the thing the request addresses, for error context.
    pub fn target(&self) -> String {
        match self {
            RequestOp::PoolLookup { name } => name.clone(),
            RequestOp::PoolName { id } => id.to_string(),
            RequestOp::PoolList => "pools".to_string(),
            other => other.object().map(ToString::to_string).unwrap_or_default(),
        }
    }
}

impl fmt::Display for RequestOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestOp::PoolLookup { name } => write!(f, "pool lookup '{}'", name),
            RequestOp::PoolName { id } => write!(f, "pool lookup #{}", id),
            RequestOp::PoolList => f.write_str("pool list"),
            other => match (other.kind(), other.object()) {
                (Some(kind), Some(object)) => write!(f, "{} {}", kind, object),
                _ => f.write_str("request"),
            },
        }
    }
}

/// Successful replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Data(Bytes),
    Stat(ObjectStat),
    Ack(Ack),
    Pool(PoolId),
    PoolName(String),
    Pools(Vec<PoolInfo>),
}

/// Carries requests to a cluster.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establishes a session; called once per connect attempt.
    async fn connect(
        &self,
        config: &ClusterConfig,
        credentials: &Credentials,
    ) -> TransportResult<SessionInfo>;

    /// Executes one request attempt.
    async fn submit(&self, request: Request) -> TransportResult<Reply>;

    /// Best-effort cancellation of request `tid`; the cluster may still apply it.
    fn cancel(&self, tid: u64);

    /// Tears the session down. Called once, after in-flight requests finish.
    async fn disconnect(&self) {}

    /// True when the far side replays the reply of a mutation whose token it
    /// has already applied, which makes mutation retries at-most-once.
    fn dedups_mutations(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object() -> ObjectRef {
        ObjectRef::new(PoolId(2), "k1", None, 64).unwrap()
    }

    #[test]
    fn transient_classification() {
        assert!(TransportError::Reset("eof".into()).is_transient());
        assert!(TransportError::Unreachable("mon".into()).is_transient());
        assert!(!TransportError::NoEntry.is_transient());
        assert!(!TransportError::Rejected("auth".into()).is_transient());
    }

    #[test]
    fn request_classification() {
        let token = RequestToken { client: 1, seq: 1 };
        let read = RequestOp::Read {
            object: object(),
            offset: 0,
            length: 1,
        };
        let append = RequestOp::Append {
            object: object(),
            data: Bytes::from_static(b"x"),
            token,
        };
        assert!(read.is_idempotent());
        assert!(!read.is_mutation());
        assert!(!append.is_idempotent());
        assert!(append.is_mutation());
        assert!(RequestOp::PoolList.is_idempotent());
        assert!(!RequestOp::PoolList.is_mutation());
    }

    #[test]
    fn display_names_target() {
        let stat = RequestOp::Stat { object: object() };
        assert_eq!(stat.to_string(), "stat 2/k1");
        assert_eq!(stat.target(), "2/k1");
        let lookup = RequestOp::PoolLookup {
            name: "data".into(),
        };
        assert_eq!(lookup.to_string(), "pool lookup 'data'");
        assert_eq!(lookup.target(), "data");
    }
}
