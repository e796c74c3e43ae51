//! # Simulated Cluster
//!
//! Purpose: Provide an in-process stand-in for a storage cluster so the radx
//! client can be exercised end to end without a network.
//!
//! ## Design Principles
//! 1. **Sharded Locks**: Objects live in per-shard maps so unrelated objects
//!    never contend on the same lock.
//! 2. **Cluster Semantics, Not Storage**: Pools, quotas, auth, object versions
//!    and request-token replay are modeled; persistence and replication are not.
//! 3. **Errno-Style Errors**: `ClusterError` mirrors the status codes a real
//!    cluster answers with; translating them is the transport's job.

mod error;
mod memory;
mod replies;

pub use error::{ClusterError, ClusterResult};
pub use memory::{MemoryCluster, MAX_OBJECT_SIZE};
pub use replies::ReplyCache;
