//! Fault injection wrapper.
//!
//! Wraps any transport and, on demand, fails requests before they reach it,
//! loses replies after it has applied them, delays requests or fails connect
//! attempts. Every injected failure is a transient `Reset`/`Unreachable`, the
//! same shape a flaky network produces.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use radx_common::{ClusterConfig, Credentials};

use super::{Reply, Request, SessionInfo, Transport, TransportError, TransportResult};

/// Transport decorator that injects transient failures and latency.
#[derive(Debug)]
pub struct FaultInjector<T> {
    inner: T,
    fail_next: AtomicU32,
    lose_next: AtomicU32,
    fail_connects: AtomicU32,
    delay: Mutex<Option<Duration>>,
    connects: AtomicU64,
    submitted: AtomicU64,
    cancelled: AtomicU64,
}

impl<T: Transport> FaultInjector<T> {
    pub fn new(inner: T) -> Self {
        FaultInjector {
            inner,
            fail_next: AtomicU32::new(0),
            lose_next: AtomicU32::new(0),
            fail_connects: AtomicU32::new(0),
            delay: Mutex::new(None),
            connects: AtomicU64::new(0),
            submitted: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Fails the next `n` requests with `Reset` before they reach the inner transport.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Applies the next `n` requests, then reports `Reset` instead of the reply.
    pub fn lose_next_replies(&self, n: u32) {
        self.lose_next.store(n, Ordering::SeqCst);
    }

    /// Fails the next `n` connect attempts with `Unreachable`.
    pub fn fail_next_connects(&self, n: u32) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Delays every request by `delay` before it is forwarded.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Connect attempts seen, including injected failures.
    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Requests that reached the inner transport.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::SeqCst)
    }

    /// Cancel calls seen from the executor.
    pub fn cancels(&self) -> u64 {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Decrements `counter` if positive; returns whether a fault should fire.
fn take(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl<T: Transport> Transport for FaultInjector<T> {
    async fn connect(
        &self,
        config: &ClusterConfig,
        credentials: &Credentials,
    ) -> TransportResult<SessionInfo> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if take(&self.fail_connects) {
            return Err(TransportError::Unreachable(config.mon_hosts.join(",")));
        }
        self.inner.connect(config, credentials).await
    }

    async fn submit(&self, request: Request) -> TransportResult<Reply> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if take(&self.fail_next) {
            tracing::debug!(tid = request.tid, "injected failure before send");
            return Err(TransportError::Reset("injected failure".to_string()));
        }

        let tid = request.tid;
        self.submitted.fetch_add(1, Ordering::SeqCst);
        let reply = self.inner.submit(request).await;
        if take(&self.lose_next) {
            tracing::debug!(tid, "injected lost reply");
            return Err(TransportError::Reset("reply lost".to_string()));
        }
        reply
    }

    fn cancel(&self, tid: u64) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
        self.inner.cancel(tid);
    }

    async fn disconnect(&self) {
        self.inner.disconnect().await;
    }

    fn dedups_mutations(&self) -> bool {
        self.inner.dedups_mutations()
    }
}
