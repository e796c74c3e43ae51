//! # Pool Session
//!
//! Purpose: Bind a Connection to one pool and issue object operations in it.
//!
//! ## Design Principles
//! 1. **Borrowed Parent**: A session holds `&Connection`, so the borrow checker
//!    guarantees it never outlives the connection.
//! 2. **Values In, Tokens Out**: Objects are plain `ObjectRef` values; every
//!    `aio_*` call returns a `Completion` and the blocking twin just waits on it.
//! 3. **Checked Before Queueing**: Pool mismatches and bad ranges fail before
//!    anything reaches the dispatcher.

use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;

use radx_common::{Ack, ObjectRef, ObjectStat, PoolId, RadxError, RadxResult};

use crate::connection::Connection;
use crate::dispatcher::{Completion, FromReply};
use crate::operation::Operation;
use crate::transport::Reply;

/// A Connection bound to one pool.
pub struct PoolSession<'c> {
    conn: &'c Connection,
    pool: PoolId,
    name: String,
    op_timeout: Option<Duration>,
}

impl<'c> PoolSession<'c> {
    pub(crate) fn new(conn: &'c Connection, pool: PoolId, name: String) -> Self {
        tracing::debug!(pool = %pool, name = %name, "pool session opened");
        PoolSession {
            conn,
            pool,
            name,
            op_timeout: None,
        }
    }

    pub fn pool_id(&self) -> PoolId {
        self.pool
    }

    pub fn pool_name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> &'c Connection {
        self.conn
    }

    /// Default deadline for operations issued through this session.
    pub fn set_op_timeout(&mut self, timeout: Duration) {
        self.op_timeout = Some(timeout);
    }

    /// Builds a reference to `key` in the default namespace.
    pub fn object(&self, key: impl Into<Bytes>) -> RadxResult<ObjectRef> {
        ObjectRef::new(
            self.pool,
            key,
            None,
            self.conn.config().max_object_name_len,
        )
    }

    /// Builds a reference to `key` in `namespace`; an empty namespace is the default one.
    pub fn object_in(&self, namespace: &str, key: impl Into<Bytes>) -> RadxResult<ObjectRef> {
        ObjectRef::new(
            self.pool,
            key,
            Some(namespace),
            self.conn.config().max_object_name_len,
        )
    }

    /// Submits a hand-built operation.
    pub fn submit(&self, op: Operation) -> Completion<Reply> {
        self.dispatch(op)
    }

    fn dispatch<T: FromReply>(&self, op: Operation) -> Completion<T> {
        if op.object().pool() != self.pool {
            return Completion::failed(RadxError::Validation(format!(
                "object {} is not in pool {} ({})",
                op.object(),
                self.name,
                self.pool
            )));
        }
        if let Err(err) = op.validate() {
            return Completion::failed(err);
        }

        let inner = self.conn.inner();
        let default_timeout = self
            .op_timeout
            .unwrap_or_else(|| inner.config().op_timeout());
        let deadline = op.deadline(Instant::now(), default_timeout);
        let request = op.into_request(|| inner.next_token());
        inner.submit(request, deadline)
    }

    pub fn aio_read(&self, object: &ObjectRef, offset: u64, length: u64) -> Completion<Bytes> {
        self.dispatch(Operation::read(object.clone(), offset, length))
    }

    pub fn aio_write(&self, object: &ObjectRef, offset: u64, data: impl Into<Bytes>) -> Completion<Ack> {
        self.dispatch(Operation::write(object.clone(), offset, data))
    }

    pub fn aio_write_full(&self, object: &ObjectRef, data: impl Into<Bytes>) -> Completion<Ack> {
        self.dispatch(Operation::write_full(object.clone(), data))
    }

    pub fn aio_append(&self, object: &ObjectRef, data: impl Into<Bytes>) -> Completion<Ack> {
        self.dispatch(Operation::append(object.clone(), data))
    }

    pub fn aio_remove(&self, object: &ObjectRef) -> Completion<Ack> {
        self.dispatch(Operation::remove(object.clone()))
    }

    pub fn aio_stat(&self, object: &ObjectRef) -> Completion<ObjectStat> {
        self.dispatch(Operation::stat(object.clone()))
    }

    /// Reads up to `length` bytes at `offset`. Past the end yields fewer bytes, possibly none.
    pub fn read(&self, object: &ObjectRef, offset: u64, length: u64) -> RadxResult<Bytes> {
        self.aio_read(object, offset, length).wait()
    }

    /// Writes at `offset`, extending the object and zero-filling any gap.
    pub fn write(&self, object: &ObjectRef, offset: u64, data: impl Into<Bytes>) -> RadxResult<Ack> {
        self.aio_write(object, offset, data).wait()
    }

    /// Replaces the whole object.
    pub fn write_full(&self, object: &ObjectRef, data: impl Into<Bytes>) -> RadxResult<Ack> {
        self.aio_write_full(object, data).wait()
    }

    pub fn append(&self, object: &ObjectRef, data: impl Into<Bytes>) -> RadxResult<Ack> {
        self.aio_append(object, data).wait()
    }

    pub fn remove(&self, object: &ObjectRef) -> RadxResult<Ack> {
        self.aio_remove(object).wait()
    }

    pub fn stat(&self, object: &ObjectRef) -> RadxResult<ObjectStat> {
        self.aio_stat(object).wait()
    }

    /// Releases the pool binding. The connection stays open.
    pub fn close(self) {}
}

impl Drop for PoolSession<'_> {
    fn drop(&mut self) {
        tracing::debug!(pool = %self.pool, name = %self.name, "pool session closed");
    }
}

impl fmt::Debug for PoolSession<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolSession")
            .field("pool", &self.pool)
            .field("name", &self.name)
            .field("op_timeout", &self.op_timeout)
            .finish()
    }
}
