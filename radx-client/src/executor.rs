//! Request execution: deadlines, retries and error translation.
//!
//! Every dispatched operation runs through `execute`. The attempt loop in
//! `run_with_retry` is raced against the operation deadline and the caller's
//! cancellation; whichever finishes first decides the outcome, and the losing
//! side is dropped. A dropped attempt is also cancelled at the transport by
//! request id, although the cluster may already have applied it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use radx_common::{Ack, ClusterConfig, Credentials, RadxError, RadxResult};

use crate::connection::ConnInner;
use crate::dispatcher::Submission;
use crate::metrics::Metrics;
use crate::operation::deadline_after;
use crate::retry::RetryPolicy;
use crate::transport::{Reply, Request, RequestOp, SessionInfo, Transport, TransportError};

/// Executes one dispatched operation and sends its result to the completion.
pub(crate) async fn execute(inner: Arc<ConnInner>, submission: Submission) {
    let Submission {
        tid,
        op,
        deadline,
        control,
        reply,
    } = submission;

    let started = Instant::now();
    inner.metrics.record_request_start();
    let policy = RetryPolicy::for_ops(&inner.config());
    let description = op.to_string();
    let request = Request { tid, op };
    let transport = inner.transport.as_ref();

    let result = tokio::select! {
        biased;
        _ = control.token().cancelled() => {
            transport.cancel(tid);
            Err(RadxError::Cancelled)
        }
        attempt = tokio::time::timeout_at(
            tokio::time::Instant::from_std(deadline),
            run_with_retry(transport, &inner.metrics, &request, policy),
        ) => match attempt {
            Ok(result) => result,
            Err(_) => {
                transport.cancel(tid);
                Err(RadxError::Timeout {
                    op: description.clone(),
                    elapsed: started.elapsed(),
                })
            }
        },
    };

    let elapsed = started.elapsed();
    inner.metrics.record_request_end(elapsed);
    match &result {
        Ok(_) => tracing::trace!(tid, op = %description, ?elapsed, "operation complete"),
        Err(err) => {
            inner.metrics.record_failure(err.kind());
            if err.is_expected() {
                tracing::debug!(tid, op = %description, error = %err, "operation answered");
            } else {
                tracing::warn!(tid, op = %description, error = %err, ?elapsed, "operation failed");
            }
        }
    }

    let _ = reply.send(result);
}

/// Issues attempts until one succeeds, a permanent error arrives or the
/// attempt budget is spent.
///
/// Writes are only resent when the transport deduplicates request tokens;
/// otherwise a transient failure is reported at once, because the first
/// attempt may already have been applied. Removes are always resent.
pub(crate) async fn run_with_retry(
    transport: &dyn Transport,
    metrics: &Metrics,
    request: &Request,
    policy: RetryPolicy,
) -> RadxResult<Reply> {
    let dedups = transport.dedups_mutations();
    let resendable = request.op.is_idempotent() || dedups;
    // Without token dedup a resent remove cannot tell "already removed by an
    // earlier attempt" from "never existed"; the earlier attempt wins.
    let settles_remove = matches!(request.op, RequestOp::Remove { .. }) && !dedups;
    let mut backoff = policy.backoff();

    loop {
        let err = match transport.submit(request.clone()).await {
            Ok(reply) => return Ok(reply),
            Err(TransportError::NoEntry) if settles_remove && backoff.failures() > 0 => {
                tracing::debug!(
                    tid = request.tid,
                    op = %request.op,
                    "object gone on resend, treating earlier remove attempt as applied"
                );
                return Ok(Reply::Ack(Ack { version: 0 }));
            }
            Err(err) if err.is_transient() => err,
            Err(err) => return Err(translate(&request.op, err)),
        };

        if !resendable {
            return Err(RadxError::Io(format!(
                "{} failed ({}); object may be partially written",
                request.op, err
            )));
        }

        match backoff.next_wait() {
            Some(wait) => {
                metrics.record_retry();
                tracing::debug!(
                    tid = request.tid,
                    op = %request.op,
                    attempt = backoff.failures(),
                    ?wait,
                    error = %err,
                    "retrying after transient failure"
                );
                tokio::time::sleep(wait).await;
            }
            None => {
                return Err(RadxError::Io(format!(
                    "{} failed after {} attempts: {}",
                    request.op,
                    backoff.failures(),
                    err
                )))
            }
        }
    }
}

/// Maps a transport failure onto the caller-visible taxonomy.
pub(crate) fn translate(op: &RequestOp, err: TransportError) -> RadxError {
    match err {
        TransportError::NoEntry => RadxError::NotFound(op.target()),
        TransportError::NoPool(pool) => RadxError::PoolNotFound(pool),
        TransportError::QuotaExceeded(pool) => {
            RadxError::QuotaExceeded(format!("{} rejected, pool {} is full", op, pool))
        }
        TransportError::Rejected(reason) => RadxError::Connection(reason),
        TransportError::Unreachable(_) | TransportError::Reset(_) => {
            RadxError::Io(format!("{} failed: {}", op, err))
        }
        TransportError::InvalidRequest(reason) => RadxError::Validation(reason),
        TransportError::Cancelled => RadxError::Cancelled,
        TransportError::Closed => RadxError::NotConnected {
            state: "closed".to_string(),
            action: op.to_string(),
        },
    }
}

/// Opens a session, retrying unreachable clusters within the connect budget.
///
/// Rejections (bad credentials, wrong cluster) end the attempt immediately.
pub(crate) async fn establish(
    transport: &dyn Transport,
    config: &ClusterConfig,
    credentials: &Credentials,
) -> RadxResult<SessionInfo> {
    let budget = config.connect_timeout();
    let deadline = tokio::time::Instant::from_std(deadline_after(Instant::now(), budget));
    let mut backoff = RetryPolicy::for_connect(config).backoff();

    loop {
        let attempt = tokio::time::timeout_at(deadline, transport.connect(config, credentials)).await;
        let err = match attempt {
            Ok(Ok(session)) => return Ok(session),
            Ok(Err(err)) if err.is_transient() => err,
            Ok(Err(err)) => {
                return Err(RadxError::Connection(format!(
                    "{} refused by cluster {}: {}",
                    credentials.entity, config.cluster_name, err
                )))
            }
            Err(_) => return Err(timed_out(config, budget)),
        };

        let wait = match backoff.next_wait() {
            Some(wait) => wait,
            None => {
                return Err(RadxError::Connection(format!(
                    "cluster {} unreachable after {} attempts: {}",
                    config.cluster_name,
                    backoff.failures(),
                    err
                )))
            }
        };
        if tokio::time::Instant::now() + wait >= deadline {
            return Err(timed_out(config, budget));
        }
        tracing::warn!(
            cluster = %config.cluster_name,
            attempt = backoff.failures(),
            ?wait,
            error = %err,
            "connect attempt failed, retrying"
        );
        tokio::time::sleep(wait).await;
    }
}

fn timed_out(config: &ClusterConfig, budget: Duration) -> RadxError {
    RadxError::Connection(format!(
        "connect to cluster {} timed out after {:?}",
        config.cluster_name, budget
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{BlockingTransport, FaultInjector, MemoryTransport, TransportResult};
    use radx_cluster::MemoryCluster;
    use radx_common::{ErrorKind, ObjectRef, PoolId, RequestToken};

    fn config() -> ClusterConfig {
        ClusterConfig {
            mon_hosts: vec!["mon-a".to_string()],
            backoff_initial_ms: 1,
            backoff_max_ms: 2,
            ..ClusterConfig::default()
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            entity: "client.admin".to_string(),
            secret: None,
        }
    }

    async fn fault() -> (Arc<MemoryCluster>, FaultInjector<MemoryTransport>) {
        let cluster = Arc::new(MemoryCluster::new("radx", vec!["mon-a".to_string()]));
        let fault = FaultInjector::new(MemoryTransport::new(Arc::clone(&cluster)));
        fault.connect(&config(), &credentials()).await.unwrap();
        (cluster, fault)
    }

    #[test]
    fn translation_covers_taxonomy() {
        let object = ObjectRef::new(PoolId(1), "k", None, 8).unwrap();
        let op = RequestOp::Stat { object };
        assert_eq!(
            translate(&op, TransportError::NoEntry),
            RadxError::NotFound("1/k".to_string())
        );
        assert_eq!(
            translate(&op, TransportError::NoPool("data".into())).kind(),
            ErrorKind::PoolNotFound
        );
        assert_eq!(translate(&op, TransportError::Reset("x".into())).kind(), ErrorKind::Io);
        assert_eq!(
            translate(&op, TransportError::InvalidRequest("x".into())).kind(),
            ErrorKind::Validation
        );
        assert_eq!(translate(&op, TransportError::Closed).kind(), ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn idempotent_requests_are_retried() {
        let (_cluster, fault) = fault().await;
        fault.fail_next(2);
        let metrics = Metrics::new();
        let request = Request {
            tid: 1,
            op: RequestOp::PoolList,
        };
        let reply = run_with_retry(&fault, &metrics, &request, RetryPolicy::for_ops(&config())).await;
        assert_eq!(reply, Ok(Reply::Pools(Vec::new())));
        assert_eq!(metrics.snapshot().retries_total, 2);
    }

    #[tokio::test]
    async fn retries_stop_at_attempt_budget() {
        let (_cluster, fault) = fault().await;
        fault.fail_next(10);
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_wait: Duration::from_millis(1),
            max_wait: Duration::from_millis(1),
        };
        let request = Request {
            tid: 1,
            op: RequestOp::PoolList,
        };
        let err = run_with_retry(&fault, &Metrics::new(), &request, policy)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("after 3 attempts"));
    }

    #[tokio::test]
    async fn lost_mutation_reply_is_applied_once() {
        let (cluster, fault) = fault().await;
        let pool = cluster.create_pool("data").unwrap();
        let object = ObjectRef::new(pool, "log", None, 64).unwrap();
        fault.lose_next_replies(1);

        let request = Request {
            tid: 5,
            op: RequestOp::Append {
                object: object.clone(),
                data: bytes::Bytes::from_static(b"entry;"),
                token: RequestToken { client: 9, seq: 1 },
            },
        };
        let reply = run_with_retry(&fault, &Metrics::new(), &request, RetryPolicy::for_ops(&config())).await;
        assert!(matches!(reply, Ok(Reply::Ack(_))));
        assert_eq!(fault.submitted(), 2);
        assert_eq!(cluster.stat(&object).unwrap().size, 6);
    }

    /// Applies removes without recording their tokens.
    struct NoDedup(Arc<MemoryCluster>);

    impl crate::transport::BlockingBackend for NoDedup {
        fn connect(&self, config: &ClusterConfig, credentials: &Credentials) -> TransportResult<SessionInfo> {
            crate::transport::BlockingBackend::connect(self.0.as_ref(), config, credentials)
        }

        fn call(&self, op: &RequestOp) -> TransportResult<Reply> {
            match op {
                RequestOp::Remove { object, .. } => Ok(Reply::Ack(self.0.remove(object, None)?)),
                other => crate::transport::BlockingBackend::call(self.0.as_ref(), other),
            }
        }
    }

    #[tokio::test]
    async fn resent_remove_after_lost_reply_succeeds() {
        let cluster = Arc::new(MemoryCluster::new("radx", vec!["mon-a".to_string()]));
        let pool = cluster.create_pool("data").unwrap();
        let object = ObjectRef::new(pool, "k", None, 64).unwrap();
        cluster.write_full(&object, b"v", None).unwrap();

        let fault = FaultInjector::new(BlockingTransport::new(Arc::new(NoDedup(Arc::clone(&cluster)))));
        fault.connect(&config(), &credentials()).await.unwrap();
        assert!(!fault.dedups_mutations());
        fault.lose_next_replies(1);

        let request = Request {
            tid: 3,
            op: RequestOp::Remove {
                object: object.clone(),
                token: RequestToken { client: 9, seq: 1 },
            },
        };
        let reply = run_with_retry(&fault, &Metrics::new(), &request, RetryPolicy::for_ops(&config())).await;
        assert_eq!(reply, Ok(Reply::Ack(Ack { version: 0 })));
        assert_eq!(fault.submitted(), 2);
        assert!(cluster.stat(&object).is_err());
    }

    #[tokio::test]
    async fn remove_of_missing_object_without_resend_is_not_found() {
        let cluster = Arc::new(MemoryCluster::new("radx", vec!["mon-a".to_string()]));
        let pool = cluster.create_pool("data").unwrap();
        let object = ObjectRef::new(pool, "missing", None, 64).unwrap();
        let fault = FaultInjector::new(BlockingTransport::new(Arc::new(NoDedup(cluster))));
        fault.connect(&config(), &credentials()).await.unwrap();

        let request = Request {
            tid: 4,
            op: RequestOp::Remove {
                object,
                token: RequestToken { client: 9, seq: 2 },
            },
        };
        let err = run_with_retry(&fault, &Metrics::new(), &request, RetryPolicy::for_ops(&config()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn establish_does_not_retry_rejection() {
        let cluster = Arc::new(MemoryCluster::new("radx", vec!["mon-a".to_string()]));
        let transport = MemoryTransport::new(cluster);
        let wrong = ClusterConfig {
            cluster_name: "other".to_string(),
            ..config()
        };
        let err = establish(&transport, &wrong, &credentials()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[tokio::test]
    async fn establish_retries_unreachable() {
        let cluster = Arc::new(MemoryCluster::new("radx", vec!["mon-a".to_string()]));
        let fault = FaultInjector::new(MemoryTransport::new(cluster));
        fault.fail_next_connects(2);
        assert!(establish(&fault, &config(), &credentials()).await.is_ok());

        fault.fail_next_connects(3);
        let err = establish(&fault, &config(), &credentials()).await.unwrap_err();
        assert!(err.to_string().contains("after 3 attempts"));
    }
}
