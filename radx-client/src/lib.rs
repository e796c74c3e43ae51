//! # radx Client
//!
//! Purpose: Provide a small, safe client for a distributed object storage
//! cluster: connect, open a pool, read and write objects, with deadlines,
//! retries and cancellation handled in one place.
//!
//! ## Design Principles
//! 1. **Ownership Encodes Lifetime**: `PoolSession<'c>` borrows its
//!    `Connection`; nothing can outlive the session that issued it.
//! 2. **Single Dispatcher per Connection**: A one-worker runtime drains the
//!    submission queue; operations on different objects run concurrently.
//! 3. **Completion Tokens**: Asynchronous calls return a `Completion<T>` that
//!    can be waited on, awaited or cancelled. Blocking calls wait on one.
//! 4. **Pluggable Transport**: The wire is behind the `Transport` trait;
//!    `MemoryTransport` and `BlockingTransport` run against a simulated cluster.
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use radx_client::{ClusterConfig, Connection, MemoryTransport};
//! use radx_cluster::MemoryCluster;
//!
//! let cluster = Arc::new(MemoryCluster::new("radx", vec!["mon-a:6789".into()]));
//! cluster.create_pool("data")?;
//! let config = ClusterConfig { mon_hosts: vec!["mon-a:6789".into()], ..Default::default() };
//! let conn = Connection::open(config, Arc::new(MemoryTransport::new(cluster)))?;
//! let pool = conn.open_pool("data")?;
//! let obj = pool.object("greeting")?;
//! pool.write(&obj, 0, "hello")?;
//! assert_eq!(&pool.read(&obj, 0, 5)?[..], b"hello");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod connection;
mod dispatcher;
mod executor;
mod operation;
mod session;

pub mod metrics;
pub mod retry;
pub mod transport;

pub use connection::{Connection, ConnectionState};
pub use dispatcher::{Completion, FromReply};
pub use metrics::{LatencySnapshot, MetricsSnapshot};
pub use operation::Operation;
pub use retry::RetryPolicy;
pub use session::PoolSession;
pub use transport::{
    BlockingBackend, BlockingTransport, FaultInjector, MemoryTransport, Reply, Transport,
};

pub use radx_common::{
    Ack, ClusterConfig, ErrorKind, ObjectRef, ObjectStat, OpKind, PoolId, PoolInfo, RadxError,
    RadxResult,
};
