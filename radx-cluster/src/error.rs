//! Cluster-side status codes.

/// Result type for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors a cluster answers with.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    /// Object does not exist.
    #[error("no such object")]
    NoEntry,
    /// Pool does not exist.
    #[error("no such pool: {0}")]
    NoPool(String),
    /// Pool name is taken.
    #[error("pool already exists: {0}")]
    PoolExists(String),
    /// Write would push the pool past its byte quota.
    #[error("quota exceeded for pool {0}")]
    QuotaExceeded(String),
    /// Unknown entity or wrong secret.
    #[error("permission denied for {0}")]
    PermissionDenied(String),
    /// Client targeted a different cluster.
    #[error("cluster name mismatch: this is {expected}, client asked for {requested}")]
    WrongCluster { expected: String, requested: String },
    /// None of the client's monitor endpoints belong to this cluster.
    #[error("no reachable monitor among {0:?}")]
    Unreachable(Vec<String>),
    /// Offset or length outside the supported range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
