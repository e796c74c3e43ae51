//! # Connection Manager
//!
//! Purpose: Own one session with a cluster, its configuration, and the
//! dispatch runtime that executes every operation issued through it.
//!
//! ## Design Principles
//! 1. **Explicit Lifecycle**: `Unconnected -> Connected -> ShuttingDown -> Closed`;
//!    states only move forward.
//! 2. **One Lock for Admission**: The submission queue and the state share a
//!    mutex, so a submission either lands before shutdown drains the queue or
//!    is rejected with `NotConnected`.
//! 3. **No Globals**: Runtime, transport, metrics and config all hang off the
//!    Connection; two connections share nothing.
//! 4. **Blocking and Async Twins**: Every blocking call has an `_async`
//!    counterpart; blocking calls must not be made from inside an async context.

use std::collections::VecDeque;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Runtime;
use tokio::sync::{oneshot, watch, Notify};

use radx_common::{ClusterConfig, PoolId, PoolInfo, RadxError, RadxResult, RequestToken};

use crate::dispatcher::{dispatch_loop, Completion, FromReply, OpControl, Submission};
use crate::executor;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::operation::deadline_after;
use crate::session::PoolSession;
use crate::transport::{RequestOp, Transport};

/// Lifecycle of a Connection. Ordered by progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    Unconnected,
    Connected,
    ShuttingDown,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Unconnected => "unconnected",
            ConnectionState::Connected => "connected",
            ConnectionState::ShuttingDown => "shutting down",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

pub(crate) struct Core {
    pub(crate) state: ConnectionState,
    pub(crate) queue: VecDeque<Submission>,
    connecting: bool,
    session_open: bool,
}

/// State shared between the Connection handle and its dispatch runtime.
pub(crate) struct ConnInner {
    pub(crate) core: Mutex<Core>,
    pub(crate) wakeup: Notify,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) metrics: Metrics,
    config: RwLock<Arc<ClusterConfig>>,
    next_tid: AtomicU64,
    next_seq: AtomicU64,
    instance_id: AtomicU64,
    closed: watch::Sender<bool>,
}

fn not_connected(state: ConnectionState, action: impl Into<String>) -> RadxError {
    RadxError::NotConnected {
        state: state.to_string(),
        action: action.into(),
    }
}

impl ConnInner {
    pub(crate) fn config(&self) -> Arc<ClusterConfig> {
        Arc::clone(&self.config.read())
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.core.lock().state
    }

    /// Next token for a mutation; unique per connection and stable across retries.
    pub(crate) fn next_token(&self) -> RequestToken {
        RequestToken {
            client: self.instance_id.load(Ordering::Acquire),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Queues a request for the dispatcher.
    pub(crate) fn submit<T: FromReply>(&self, op: RequestOp, deadline: Instant) -> Completion<T> {
        let tid = self.next_tid.fetch_add(1, Ordering::Relaxed);
        let control = Arc::new(OpControl::new());
        let (reply, rx) = oneshot::channel();

        {
            let mut core = self.core.lock();
            if core.state != ConnectionState::Connected {
                let state = core.state;
                drop(core);
                return Completion::failed(not_connected(state, op.to_string()));
            }
            tracing::trace!(tid, op = %op, queued = core.queue.len(), "operation queued");
            core.queue.push_back(Submission {
                tid,
                op,
                deadline,
                control: Arc::clone(&control),
                reply,
            });
        }
        self.wakeup.notify_one();
        Completion::new(tid, control, rx)
    }

    async fn connect(&self) -> RadxResult<()> {
        let config = self.config();
        let result = match config.validate().and_then(|()| config.resolve_credentials()) {
            Ok(credentials) => executor::establish(self.transport.as_ref(), &config, &credentials).await,
            Err(err) => Err(err),
        };

        let outcome = {
            let mut core = self.core.lock();
            core.connecting = false;
            match result {
                Ok(session) if core.state == ConnectionState::Unconnected => {
                    core.state = ConnectionState::Connected;
                    core.session_open = true;
                    self.instance_id.store(session.instance_id, Ordering::Release);
                    Ok(session.instance_id)
                }
                Ok(_) => Err(not_connected(core.state, "connect")),
                Err(err) => return Err(err),
            }
        };

        match outcome {
            Ok(instance) => {
                tracing::info!(
                    cluster = %config.cluster_name,
                    entity = %config.entity(),
                    instance,
                    "connected"
                );
                Ok(())
            }
            Err(err) => {
                // Shutdown won the race; close the session this attempt opened.
                self.transport.disconnect().await;
                Err(err)
            }
        }
    }

    /// Stops admission and cancels queued operations. False if already stopping.
    fn begin_shutdown(&self) -> bool {
        let drained = {
            let mut core = self.core.lock();
            match core.state {
                ConnectionState::Unconnected | ConnectionState::Connected => {
                    core.state = ConnectionState::ShuttingDown;
                    std::mem::take(&mut core.queue)
                }
                ConnectionState::ShuttingDown | ConnectionState::Closed => return false,
            }
        };

        if !drained.is_empty() {
            tracing::debug!(cancelled = drained.len(), "cancelling queued operations");
        }
        for submission in drained {
            submission.control.cancel();
            self.metrics.record_cancelled_pending();
            submission.reject(RadxError::Cancelled);
        }
        self.wakeup.notify_one();
        true
    }

    /// Final step of the dispatch loop: close the session and publish `Closed`.
    pub(crate) async fn finish_shutdown(&self) {
        let session_open = std::mem::replace(&mut self.core.lock().session_open, false);
        if session_open {
            self.transport.disconnect().await;
        }
        self.core.lock().state = ConnectionState::Closed;
        self.closed.send_replace(true);
        tracing::info!("connection closed");
    }
}

/// A session with one cluster.
///
/// Pool sessions borrow the Connection, so it cannot be dropped while any of
/// them is alive. Dropping the Connection shuts it down; when dropped inside an
/// async context the teardown does not wait for in-flight operations, which
/// then resolve with `Cancelled`.
pub struct Connection {
    inner: Arc<ConnInner>,
    runtime: Option<Runtime>,
}

impl Connection {
    /// Creates an unconnected Connection and starts its dispatcher thread.
    pub fn new(config: ClusterConfig, transport: Arc<dyn Transport>) -> RadxResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("radx-dispatch")
            .enable_all()
            .build()
            .map_err(|err| RadxError::Connection(format!("failed to start dispatcher: {}", err)))?;

        let (closed, _) = watch::channel(false);
        let inner = Arc::new(ConnInner {
            core: Mutex::new(Core {
                state: ConnectionState::Unconnected,
                queue: VecDeque::new(),
                connecting: false,
                session_open: false,
            }),
            wakeup: Notify::new(),
            transport,
            metrics: Metrics::new(),
            config: RwLock::new(Arc::new(config)),
            next_tid: AtomicU64::new(1),
            next_seq: AtomicU64::new(1),
            instance_id: AtomicU64::new(0),
            closed,
        });
        runtime.spawn(dispatch_loop(Arc::clone(&inner)));

        Ok(Connection {
            inner,
            runtime: Some(runtime),
        })
    }

    /// Creates a Connection and connects it.
    pub fn open(config: ClusterConfig, transport: Arc<dyn Transport>) -> RadxResult<Self> {
        let conn = Self::new(config, transport)?;
        conn.connect()?;
        Ok(conn)
    }

    pub async fn open_async(config: ClusterConfig, transport: Arc<dyn Transport>) -> RadxResult<Self> {
        let conn = Self::new(config, transport)?;
        conn.connect_async().await?;
        Ok(conn)
    }

    fn runtime(&self) -> RadxResult<&Runtime> {
        self.runtime
            .as_ref()
            .ok_or_else(|| not_connected(ConnectionState::Closed, "use dispatcher"))
    }

    fn ensure_configurable(&self, option: &str) -> RadxResult<()> {
        let core = self.inner.core.lock();
        if core.state != ConnectionState::Unconnected || core.connecting {
            return Err(RadxError::Validation(format!(
                "cannot change {} after connect (connection is {})",
                option, core.state
            )));
        }
        Ok(())
    }

    /// Sets one configuration option. Only allowed before `connect`.
    pub fn conf_set(&self, option: &str, value: &str) -> RadxResult<()> {
        self.ensure_configurable(option)?;
        let mut config = self.inner.config.write();
        let mut updated = ClusterConfig::clone(&config);
        updated.set(option, value)?;
        *config = Arc::new(updated);
        Ok(())
    }

    /// Replaces the configuration with the contents of a TOML or JSON file.
    pub fn conf_read_file(&self, path: impl AsRef<Path>) -> RadxResult<()> {
        self.ensure_configurable("configuration")?;
        let loaded = ClusterConfig::from_file(path)?;
        *self.inner.config.write() = Arc::new(loaded);
        Ok(())
    }

    /// Establishes the session. A no-op when already connected.
    pub fn connect(&self) -> RadxResult<()> {
        self.runtime()?.block_on(self.connect_async())
    }

    pub async fn connect_async(&self) -> RadxResult<()> {
        let runtime = self.runtime()?;
        {
            let mut core = self.inner.core.lock();
            match core.state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Unconnected if core.connecting => {
                    return Err(RadxError::Connection("connect already in progress".to_string()))
                }
                ConnectionState::Unconnected => core.connecting = true,
                state => return Err(not_connected(state, "connect")),
            }
        }

        let inner = Arc::clone(&self.inner);
        match runtime.spawn(async move { inner.connect().await }).await {
            Ok(result) => result,
            Err(err) => {
                self.inner.core.lock().connecting = false;
                Err(RadxError::Connection(format!("connect task failed: {}", err)))
            }
        }
    }

    /// Cancels queued operations, waits for in-flight ones, then closes the session.
    ///
    /// Idempotent; later submissions fail with `NotConnected`.
    pub fn shutdown(&self) -> RadxResult<()> {
        self.runtime()?.block_on(self.shutdown_async())
    }

    pub async fn shutdown_async(&self) -> RadxResult<()> {
        let mut closed = self.inner.closed.subscribe();
        if self.inner.begin_shutdown() {
            tracing::info!(instance = self.instance_id(), "shutting down connection");
        }
        closed
            .wait_for(|closed| *closed)
            .await
            .map(|_| ())
            .map_err(|_| not_connected(ConnectionState::Closed, "shut down"))
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> Arc<ClusterConfig> {
        self.inner.config()
    }

    /// Cluster-assigned client id; 0 before the first successful connect.
    pub fn instance_id(&self) -> u64 {
        self.inner.instance_id.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub(crate) fn inner(&self) -> &ConnInner {
        &self.inner
    }

    fn request<T: FromReply>(&self, op: RequestOp) -> Completion<T> {
        let deadline = deadline_after(Instant::now(), self.inner.config().op_timeout());
        self.inner.submit(op, deadline)
    }

    fn lookup(&self, name: &str) -> Completion<PoolId> {
        if name.is_empty() {
            return Completion::failed(RadxError::Validation("pool name must not be empty".to_string()));
        }
        self.request(RequestOp::PoolLookup {
            name: name.to_string(),
        })
    }

    /// Resolves a pool name to its id.
    pub fn pool_lookup(&self, name: &str) -> RadxResult<PoolId> {
        self.lookup(name).wait()
    }

    pub async fn pool_lookup_async(&self, name: &str) -> RadxResult<PoolId> {
        self.lookup(name).await
    }

    /// Lists every pool, ordered by id.
    pub fn pool_list(&self) -> RadxResult<Vec<PoolInfo>> {
        self.request(RequestOp::PoolList).wait()
    }

    pub async fn pool_list_async(&self) -> RadxResult<Vec<PoolInfo>> {
        self.request(RequestOp::PoolList).await
    }

    /// Opens a session bound to the named pool.
    pub fn open_pool(&self, name: &str) -> RadxResult<PoolSession<'_>> {
        let id = self.pool_lookup(name)?;
        Ok(PoolSession::new(self, id, name.to_string()))
    }

    pub async fn open_pool_async(&self, name: &str) -> RadxResult<PoolSession<'_>> {
        let id = self.pool_lookup_async(name).await?;
        Ok(PoolSession::new(self, id, name.to_string()))
    }

    /// Opens a session bound to a pool id.
    pub fn open_pool_by_id(&self, id: PoolId) -> RadxResult<PoolSession<'_>> {
        let name: String = self.request(RequestOp::PoolName { id }).wait()?;
        Ok(PoolSession::new(self, id, name))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("instance_id", &self.instance_id())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        if tokio::runtime::Handle::try_current().is_ok() {
            // Blocking here would stall the caller's runtime.
            self.inner.begin_shutdown();
            runtime.shutdown_background();
            return;
        }
        let _ = runtime.block_on(self.shutdown_async());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use radx_cluster::MemoryCluster;

    fn connection() -> Connection {
        let cluster = Arc::new(MemoryCluster::new("radx", vec!["mon-a".to_string()]));
        let config = ClusterConfig {
            mon_hosts: vec!["mon-a".to_string()],
            ..ClusterConfig::default()
        };
        Connection::new(config, Arc::new(MemoryTransport::new(cluster))).unwrap()
    }

    #[test]
    fn lifecycle_moves_forward() {
        let conn = connection();
        assert_eq!(conn.state(), ConnectionState::Unconnected);
        conn.connect().unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(conn.instance_id() > 0);
        conn.connect().unwrap();

        conn.shutdown().unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        conn.shutdown().unwrap();
        assert!(matches!(conn.connect(), Err(RadxError::NotConnected { .. })));
    }

    #[test]
    fn shutdown_before_connect_closes() {
        let conn = connection();
        conn.shutdown().unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(conn.pool_list(), Err(RadxError::NotConnected { .. })));
    }

    #[test]
    fn config_frozen_after_connect() {
        let conn = connection();
        conn.conf_set("op_timeout_ms", "250").unwrap();
        assert_eq!(conn.config().op_timeout_ms, 250);
        conn.connect().unwrap();
        let err = conn.conf_set("op_timeout_ms", "500").unwrap_err();
        assert!(matches!(err, RadxError::Validation(_)));
        assert_eq!(conn.config().op_timeout_ms, 250);
    }

    #[test]
    fn states_are_ordered() {
        assert!(ConnectionState::Unconnected < ConnectionState::Connected);
        assert!(ConnectionState::ShuttingDown < ConnectionState::Closed);
        assert_eq!(ConnectionState::ShuttingDown.to_string(), "shutting down");
    }
}
