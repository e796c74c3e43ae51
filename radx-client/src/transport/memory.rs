//! In-process transport over a `MemoryCluster`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use radx_cluster::{ClusterError, MemoryCluster};
use radx_common::{ClusterConfig, Credentials};

use super::{Reply, Request, RequestOp, SessionInfo, Transport, TransportError, TransportResult};

/// Runs every request directly against a shared `MemoryCluster`.
///
/// Requests complete synchronously inside `submit`, so there is never anything
/// left to cancel; `cancel` only records the attempt in the log.
#[derive(Debug)]
pub struct MemoryTransport {
    cluster: Arc<MemoryCluster>,
    connected: AtomicBool,
}

impl MemoryTransport {
    pub fn new(cluster: Arc<MemoryCluster>) -> Self {
        MemoryTransport {
            cluster,
            connected: AtomicBool::new(false),
        }
    }

    pub fn cluster(&self) -> &Arc<MemoryCluster> {
        &self.cluster
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(
        &self,
        config: &ClusterConfig,
        credentials: &Credentials,
    ) -> TransportResult<SessionInfo> {
        let instance_id = self
            .cluster
            .authenticate(&config.cluster_name, &config.mon_hosts, credentials)
            .map_err(from_cluster)?;
        self.connected.store(true, Ordering::Release);
        Ok(SessionInfo { instance_id })
    }

    async fn submit(&self, request: Request) -> TransportResult<Reply> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        serve(&self.cluster, &request.op)
    }

    fn cancel(&self, tid: u64) {
        tracing::trace!(tid, "cancel ignored, memory requests complete inline");
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }

    fn dedups_mutations(&self) -> bool {
        true
    }
}

/// Applies one request to the cluster.
pub(crate) fn serve(cluster: &MemoryCluster, op: &RequestOp) -> TransportResult<Reply> {
    let reply = match op {
        RequestOp::Read {
            object,
            offset,
            length,
        } => Reply::Data(cluster.read(object, *offset, *length)?),
        RequestOp::Write {
            object,
            offset,
            data,
            token,
        } => Reply::Ack(cluster.write(object, *offset, data, Some(*token))?),
        RequestOp::WriteFull {
            object,
            data,
            token,
        } => Reply::Ack(cluster.write_full(object, data, Some(*token))?),
        RequestOp::Append {
            object,
            data,
            token,
        } => Reply::Ack(cluster.append(object, data, Some(*token))?),
        RequestOp::Remove { object, token } => Reply::Ack(cluster.remove(object, Some(*token))?),
        RequestOp::Stat { object } => Reply::Stat(cluster.stat(object)?),
        RequestOp::PoolLookup { name } => Reply::Pool(cluster.pool_lookup(name)?),
        RequestOp::PoolName { id } => Reply::PoolName(cluster.pool_name(*id)?),
        RequestOp::PoolList => Reply::Pools(cluster.pool_list()),
    };
    Ok(reply)
}

pub(crate) fn from_cluster(err: ClusterError) -> TransportError {
    match err {
        ClusterError::NoEntry => TransportError::NoEntry,
        ClusterError::NoPool(pool) => TransportError::NoPool(pool),
        ClusterError::QuotaExceeded(pool) => TransportError::QuotaExceeded(pool),
        ClusterError::PermissionDenied(_) | ClusterError::WrongCluster { .. } => {
            TransportError::Rejected(err.to_string())
        }
        ClusterError::Unreachable(hosts) => TransportError::Unreachable(hosts.join(",")),
        ClusterError::PoolExists(_) | ClusterError::InvalidArgument(_) => {
            TransportError::InvalidRequest(err.to_string())
        }
    }
}

impl From<ClusterError> for TransportError {
    fn from(err: ClusterError) -> Self {
        from_cluster(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use radx_common::ObjectRef;

    fn cluster() -> Arc<MemoryCluster> {
        Arc::new(MemoryCluster::new("radx", vec!["mon-a".to_string()]))
    }

    fn config() -> ClusterConfig {
        ClusterConfig {
            mon_hosts: vec!["mon-a".to_string()],
            ..ClusterConfig::default()
        }
    }

    fn anonymous() -> Credentials {
        Credentials {
            entity: "client.admin".to_string(),
            secret: None,
        }
    }

    #[tokio::test]
    async fn submit_requires_connect() {
        let transport = MemoryTransport::new(cluster());
        let request = Request {
            tid: 1,
            op: RequestOp::PoolList,
        };
        assert_eq!(
            transport.submit(request.clone()).await,
            Err(TransportError::Closed)
        );

        transport.connect(&config(), &anonymous()).await.unwrap();
        assert_eq!(transport.submit(request).await, Ok(Reply::Pools(Vec::new())));
    }

    #[tokio::test]
    async fn unknown_monitor_is_unreachable() {
        let transport = MemoryTransport::new(cluster());
        let config = ClusterConfig {
            mon_hosts: vec!["mon-z".to_string()],
            ..ClusterConfig::default()
        };
        let err = transport.connect(&config, &anonymous()).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn bad_secret_is_rejected() {
        let cluster = cluster();
        cluster.add_user("client.admin", "s3cret");
        let transport = MemoryTransport::new(cluster);
        let err = transport.connect(&config(), &anonymous()).await.unwrap_err();
        assert!(matches!(err, TransportError::Rejected(_)));
    }

    #[test]
    fn serve_maps_missing_object() {
        let cluster = cluster();
        let pool = cluster.create_pool("data").unwrap();
        let object = ObjectRef::new(pool, "nope", None, 64).unwrap();
        assert_eq!(
            serve(&cluster, &RequestOp::Stat { object }),
            Err(TransportError::NoEntry)
        );
    }
}
