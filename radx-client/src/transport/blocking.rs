//! Adapter for synchronous backends.
//!
//! A `BlockingBackend` answers one request at a time on the calling thread.
//! `BlockingTransport` moves each call onto tokio's blocking pool so the
//! dispatcher never stalls, and tracks in-flight requests so `cancel` can stop
//! a request that has not started running yet.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::Mutex;

use radx_cluster::MemoryCluster;
use radx_common::{ClusterConfig, Credentials};

use super::memory::{from_cluster, serve};
use super::{Reply, Request, RequestOp, SessionInfo, Transport, TransportError, TransportResult};

/// Synchronous request handler.
pub trait BlockingBackend: Send + Sync + 'static {
    fn connect(&self, config: &ClusterConfig, credentials: &Credentials) -> TransportResult<SessionInfo>;

    fn call(&self, op: &RequestOp) -> TransportResult<Reply>;

    fn dedups_mutations(&self) -> bool {
        false
    }
}

impl BlockingBackend for MemoryCluster {
    fn connect(&self, config: &ClusterConfig, credentials: &Credentials) -> TransportResult<SessionInfo> {
        let instance_id = self
            .authenticate(&config.cluster_name, &config.mon_hosts, credentials)
            .map_err(from_cluster)?;
        Ok(SessionInfo { instance_id })
    }

    fn call(&self, op: &RequestOp) -> TransportResult<Reply> {
        serve(self, op)
    }

    fn dedups_mutations(&self) -> bool {
        true
    }
}

/// Runs a `BlockingBackend` on the blocking thread pool.
pub struct BlockingTransport<B> {
    backend: Arc<B>,
    inflight: Mutex<HashMap<u64, Arc<AtomicBool>>>,
    connected: AtomicBool,
}

impl<B: BlockingBackend> BlockingTransport<B> {
    pub fn new(backend: Arc<B>) -> Self {
        BlockingTransport {
            backend,
            inflight: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
        }
    }

    /// Requests currently handed to the blocking pool.
    pub fn inflight(&self) -> usize {
        self.inflight.lock().len()
    }
}

impl<B> std::fmt::Debug for BlockingTransport<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingTransport")
            .field("inflight", &self.inflight.lock().len())
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .finish()
    }
}

/// Unregisters a request when `submit` returns or its future is dropped.
///
/// A dropped future also flags the request, so a call still queued on the
/// blocking pool is skipped.
struct InflightGuard<'a> {
    inflight: &'a Mutex<HashMap<u64, Arc<AtomicBool>>>,
    tid: u64,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if let Some(flag) = self.inflight.lock().remove(&self.tid) {
            flag.store(true, Ordering::Release);
        }
    }
}

#[async_trait]
impl<B: BlockingBackend> Transport for BlockingTransport<B> {
    async fn connect(
        &self,
        config: &ClusterConfig,
        credentials: &Credentials,
    ) -> TransportResult<SessionInfo> {
        let backend = Arc::clone(&self.backend);
        let config = config.clone();
        let credentials = credentials.clone();
        let session = tokio::task::spawn_blocking(move || backend.connect(&config, &credentials))
            .await
            .map_err(|err| TransportError::Reset(format!("connect worker failed: {}", err)))??;
        self.connected.store(true, Ordering::Release);
        Ok(session)
    }

    async fn submit(&self, request: Request) -> TransportResult<Reply> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        self.inflight.lock().insert(request.tid, Arc::clone(&cancelled));
        let _guard = InflightGuard {
            inflight: &self.inflight,
            tid: request.tid,
        };

        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || {
            if cancelled.load(Ordering::Acquire) {
                return Err(TransportError::Cancelled);
            }
            backend.call(&request.op)
        })
        .await
        .map_err(|err| TransportError::Reset(format!("request worker failed: {}", err)))?
    }

    fn cancel(&self, tid: u64) {
        if let Some(flag) = self.inflight.lock().get(&tid) {
            flag.store(true, Ordering::Release);
        }
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }

    fn dedups_mutations(&self) -> bool {
        self.backend.dedups_mutations()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use radx_common::{ObjectRef, RequestToken};

    fn connected() -> (Arc<MemoryCluster>, BlockingTransport<MemoryCluster>, ClusterConfig) {
        let cluster = Arc::new(MemoryCluster::new("radx", vec!["mon-a".to_string()]));
        let transport = BlockingTransport::new(Arc::clone(&cluster));
        let config = ClusterConfig {
            mon_hosts: vec!["mon-a".to_string()],
            ..ClusterConfig::default()
        };
        (cluster, transport, config)
    }

    #[tokio::test]
    async fn round_trip_through_blocking_pool() {
        let (cluster, transport, config) = connected();
        let credentials = Credentials {
            entity: config.entity(),
            secret: None,
        };
        transport.connect(&config, &credentials).await.unwrap();

        let pool = cluster.create_pool("data").unwrap();
        let object = ObjectRef::new(pool, "k", None, 64).unwrap();
        let write = Request {
            tid: 1,
            op: RequestOp::WriteFull {
                object: object.clone(),
                data: Bytes::from_static(b"abc"),
                token: RequestToken { client: 1, seq: 1 },
            },
        };
        assert!(matches!(transport.submit(write).await, Ok(Reply::Ack(_))));

        let read = Request {
            tid: 2,
            op: RequestOp::Read {
                object,
                offset: 1,
                length: 10,
            },
        };
        assert_eq!(
            transport.submit(read).await,
            Ok(Reply::Data(Bytes::from_static(b"bc")))
        );
        assert_eq!(transport.inflight(), 0);
        assert!(transport.dedups_mutations());
    }

    #[tokio::test]
    async fn closed_until_connected() {
        let (_cluster, transport, _config) = connected();
        let request = Request {
            tid: 9,
            op: RequestOp::PoolList,
        };
        assert_eq!(transport.submit(request).await, Err(TransportError::Closed));
    }
}
