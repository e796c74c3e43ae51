//! # Dispatcher
//!
//! Purpose: Move submitted operations from the connection queue onto the
//! connection's dispatch runtime and hand results back through completion
//! tokens.
//!
//! ## Design Principles
//! 1. **Single Dispatcher**: One loop per Connection owns the queue consumer
//!    side; callers only push and wake it.
//! 2. **Task per Operation**: Each dispatched operation runs as its own task,
//!    so a slow object never holds up another.
//! 3. **Tokens, Not Callbacks**: Results travel over a oneshot channel wrapped
//!    in `Completion<T>`, which can be waited on, awaited or cancelled.
//! 4. **Cancel Wins Before Dispatch**: An operation moves out of `PENDING`
//!    exactly once, either into `DISPATCHED` or into `CANCELLED`.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use radx_common::{Ack, ObjectStat, PoolId, PoolInfo, RadxError, RadxResult};

use crate::connection::{ConnInner, ConnectionState};
use crate::executor;
use crate::transport::{Reply, RequestOp};

const PENDING: u8 = 0;
const DISPATCHED: u8 = 1;
const CANCELLED: u8 = 2;

/// Shared cancellation state of one operation.
#[derive(Debug)]
pub(crate) struct OpControl {
    phase: AtomicU8,
    token: CancellationToken,
}

impl OpControl {
    pub(crate) fn new() -> Self {
        OpControl {
            phase: AtomicU8::new(PENDING),
            token: CancellationToken::new(),
        }
    }

    /// Claims the operation for execution. Fails if it was cancelled first.
    pub(crate) fn try_dispatch(&self) -> bool {
        self.phase
            .compare_exchange(PENDING, DISPATCHED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns true if the operation was still pending and will never run.
    pub(crate) fn cancel(&self) -> bool {
        let claimed = self
            .phase
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        self.token.cancel();
        claimed
    }

    pub(crate) fn cancelled_before_dispatch(&self) -> bool {
        self.phase.load(Ordering::Acquire) == CANCELLED
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// One queued operation.
pub(crate) struct Submission {
    pub(crate) tid: u64,
    pub(crate) op: RequestOp,
    pub(crate) deadline: Instant,
    pub(crate) control: Arc<OpControl>,
    pub(crate) reply: oneshot::Sender<RadxResult<Reply>>,
}

impl Submission {
    /// Resolves the submission without running it.
    pub(crate) fn reject(self, err: RadxError) {
        let _ = self.reply.send(Err(err));
    }
}

/// Conversion from a transport reply into the value a caller asked for.
pub trait FromReply: Sized {
    fn from_reply(reply: Reply) -> RadxResult<Self>;
}

fn unexpected(expected: &str, reply: &Reply) -> RadxError {
    RadxError::Io(format!("expected {} reply, got {:?}", expected, reply))
}

impl FromReply for Reply {
    fn from_reply(reply: Reply) -> RadxResult<Self> {
        Ok(reply)
    }
}

impl FromReply for Bytes {
    fn from_reply(reply: Reply) -> RadxResult<Self> {
        match reply {
            Reply::Data(data) => Ok(data),
            other => Err(unexpected("data", &other)),
        }
    }
}

impl FromReply for ObjectStat {
    fn from_reply(reply: Reply) -> RadxResult<Self> {
        match reply {
            Reply::Stat(stat) => Ok(stat),
            other => Err(unexpected("stat", &other)),
        }
    }
}

impl FromReply for Ack {
    fn from_reply(reply: Reply) -> RadxResult<Self> {
        match reply {
            Reply::Ack(ack) => Ok(ack),
            other => Err(unexpected("ack", &other)),
        }
    }
}

impl FromReply for PoolId {
    fn from_reply(reply: Reply) -> RadxResult<Self> {
        match reply {
            Reply::Pool(id) => Ok(id),
            other => Err(unexpected("pool id", &other)),
        }
    }
}

impl FromReply for String {
    fn from_reply(reply: Reply) -> RadxResult<Self> {
        match reply {
            Reply::PoolName(name) => Ok(name),
            other => Err(unexpected("pool name", &other)),
        }
    }
}

impl FromReply for Vec<PoolInfo> {
    fn from_reply(reply: Reply) -> RadxResult<Self> {
        match reply {
            Reply::Pools(pools) => Ok(pools),
            other => Err(unexpected("pool list", &other)),
        }
    }
}

/// Handle to the eventual result of a submitted operation.
///
/// `wait` blocks the calling thread and must not be used from inside an async
/// context; there, `.await` the completion instead. Dropping a completion does
/// not cancel the operation.
#[must_use = "a completion does nothing unless waited on, awaited or cancelled"]
pub struct Completion<T> {
    tid: u64,
    control: Arc<OpControl>,
    rx: oneshot::Receiver<RadxResult<Reply>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: FromReply> Completion<T> {
    pub(crate) fn new(
        tid: u64,
        control: Arc<OpControl>,
        rx: oneshot::Receiver<RadxResult<Reply>>,
    ) -> Self {
        Completion {
            tid,
            control,
            rx,
            _marker: PhantomData,
        }
    }

    /// A completion that is already resolved with `err`.
    pub(crate) fn failed(err: RadxError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(err));
        Completion::new(0, Arc::new(OpControl::new()), rx)
    }

    /// Request id assigned at submission; 0 for submissions rejected up front.
    pub fn tid(&self) -> u64 {
        self.tid
    }

    /// Cancels the operation.
    ///
    /// Returns true when the operation was still queued: it will never reach
    /// the cluster and resolves with `Cancelled`. Once dispatched, cancellation
    /// is best effort and the operation may still have been applied.
    pub fn cancel(&self) -> bool {
        self.control.cancel()
    }

    /// Blocks until the operation reaches a terminal state.
    pub fn wait(self) -> RadxResult<T> {
        if self.control.cancelled_before_dispatch() {
            return Err(RadxError::Cancelled);
        }
        let Completion { control, rx, .. } = self;
        let result = rx.blocking_recv();
        resolve(&control, result)
    }
}

fn resolve<T: FromReply>(
    control: &OpControl,
    result: Result<RadxResult<Reply>, oneshot::error::RecvError>,
) -> RadxResult<T> {
    if control.cancelled_before_dispatch() {
        return Err(RadxError::Cancelled);
    }
    match result {
        Ok(reply) => reply.and_then(T::from_reply),
        // Sender dropped: the dispatch runtime went away with the op in flight.
        Err(_) => Err(RadxError::Cancelled),
    }
}

impl<T: FromReply> Future for Completion<T> {
    type Output = RadxResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.control.cancelled_before_dispatch() {
            return Poll::Ready(Err(RadxError::Cancelled));
        }
        let result = match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(result) => result,
            Poll::Pending => return Poll::Pending,
        };
        Poll::Ready(resolve(&self.control, result))
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("tid", &self.tid)
            .field("cancelled", &self.control.cancelled_before_dispatch())
            .finish()
    }
}

/// Runs until the connection is shut down and every dispatched operation has finished.
pub(crate) async fn dispatch_loop(inner: Arc<ConnInner>) {
    let mut inflight: JoinSet<()> = JoinSet::new();
    tracing::debug!("dispatcher started");

    loop {
        let state = loop {
            let max_inflight = inner.config().max_inflight_ops.max(1);
            let (next, state) = {
                let mut core = inner.core.lock();
                let next = if inflight.len() < max_inflight {
                    core.queue.pop_front()
                } else {
                    None
                };
                (next, core.state)
            };
            let Some(submission) = next else {
                break state;
            };

            if submission.control.try_dispatch() {
                inflight.spawn(executor::execute(Arc::clone(&inner), submission));
            } else {
                tracing::debug!(tid = submission.tid, "dropping operation cancelled before dispatch");
                inner.metrics.record_cancelled_pending();
                submission.reject(RadxError::Cancelled);
            }
        };

        if state >= ConnectionState::ShuttingDown && inflight.is_empty() {
            break;
        }

        tokio::select! {
            _ = inner.wakeup.notified() => {}
            Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                if let Err(err) = joined {
                    tracing::error!(error = %err, "operation task failed");
                }
            }
        }
    }

    inner.finish_shutdown().await;
    tracing::debug!("dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_before_dispatch_wins() {
        let control = OpControl::new();
        assert!(control.cancel());
        assert!(!control.try_dispatch());
        assert!(control.cancelled_before_dispatch());
        assert!(control.token().is_cancelled());
    }

    #[test]
    fn cancel_after_dispatch_is_best_effort() {
        let control = OpControl::new();
        assert!(control.try_dispatch());
        assert!(!control.cancel());
        assert!(!control.cancelled_before_dispatch());
        assert!(control.token().is_cancelled());
    }

    #[test]
    fn failed_completion_resolves_immediately() {
        let completion: Completion<Bytes> = Completion::failed(RadxError::Cancelled);
        assert_eq!(completion.tid(), 0);
        assert_eq!(completion.wait(), Err(RadxError::Cancelled));
    }

    #[test]
    fn cancelled_completion_skips_the_channel() {
        let (_tx, rx) = oneshot::channel();
        let completion: Completion<Ack> = Completion::new(7, Arc::new(OpControl::new()), rx);
        assert!(completion.cancel());
        assert_eq!(completion.wait(), Err(RadxError::Cancelled));
    }

    #[test]
    fn reply_conversion_checks_shape() {
        assert_eq!(
            Bytes::from_reply(Reply::Data(Bytes::from_static(b"x"))),
            Ok(Bytes::from_static(b"x"))
        );
        assert!(matches!(
            Ack::from_reply(Reply::Data(Bytes::new())),
            Err(RadxError::Io(_))
        ));
    }
}
