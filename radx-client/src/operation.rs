//! Hand-built object operations.
//!
//! `PoolSession` offers one method per operation; `Operation` is the same
//! request as a value, for callers that want a custom deadline or want to
//! build requests ahead of time.

use std::time::{Duration, Instant};

use bytes::Bytes;

use radx_common::{ObjectRef, OpKind, RadxError, RadxResult, RequestToken};

use crate::transport::RequestOp;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Body {
    Read { offset: u64, length: u64 },
    Write { offset: u64, data: Bytes },
    WriteFull { data: Bytes },
    Append { data: Bytes },
    Remove,
    Stat,
}

/// One object operation plus its deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    object: ObjectRef,
    body: Body,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
}

/// Timeouts longer than this are treated as "no deadline".
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + timeout`, clamped so that huge timeouts cannot overflow `Instant`.
pub(crate) fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout.min(FAR_FUTURE)).unwrap_or(now)
}

impl Operation {
    fn new(object: ObjectRef, body: Body) -> Self {
        Operation {
            object,
            body,
            timeout: None,
            deadline: None,
        }
    }

    pub fn read(object: ObjectRef, offset: u64, length: u64) -> Self {
        Self::new(object, Body::Read { offset, length })
    }

    pub fn write(object: ObjectRef, offset: u64, data: impl Into<Bytes>) -> Self {
        Self::new(
            object,
            Body::Write {
                offset,
                data: data.into(),
            },
        )
    }

    pub fn write_full(object: ObjectRef, data: impl Into<Bytes>) -> Self {
        Self::new(object, Body::WriteFull { data: data.into() })
    }

    pub fn append(object: ObjectRef, data: impl Into<Bytes>) -> Self {
        Self::new(object, Body::Append { data: data.into() })
    }

    pub fn remove(object: ObjectRef) -> Self {
        Self::new(object, Body::Remove)
    }

    pub fn stat(object: ObjectRef) -> Self {
        Self::new(object, Body::Stat)
    }

    /// Overrides the session timeout; measured from submission.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets an absolute deadline. Takes precedence over any timeout.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn object(&self) -> &ObjectRef {
        &self.object
    }

    pub fn kind(&self) -> OpKind {
        match self.body {
            Body::Read { .. } => OpKind::Read,
            Body::Write { .. } => OpKind::Write,
            Body::WriteFull { .. } => OpKind::WriteFull,
            Body::Append { .. } => OpKind::Append,
            Body::Remove => OpKind::Remove,
            Body::Stat => OpKind::Stat,
        }
    }

    /// Absolute deadline, falling back to `now + default_timeout`.
    pub(crate) fn deadline(&self, now: Instant, default_timeout: Duration) -> Instant {
        self.deadline
            .unwrap_or_else(|| deadline_after(now, self.timeout.unwrap_or(default_timeout)))
    }

    /// Rejects ranges that cannot be addressed.
    pub(crate) fn validate(&self) -> RadxResult<()> {
        let (offset, len) = match &self.body {
            Body::Read { offset, length } => (*offset, *length),
            Body::Write { offset, data } => (*offset, data.len() as u64),
            _ => return Ok(()),
        };
        if offset.checked_add(len).is_none() {
            return Err(RadxError::Validation(format!(
                "{} range {}+{} overflows",
                self.kind(),
                offset,
                len
            )));
        }
        Ok(())
    }

    /// Builds the wire request; `token` is drawn only for mutations.
    pub(crate) fn into_request(self, token: impl FnOnce() -> RequestToken) -> RequestOp {
        let object = self.object;
        match self.body {
            Body::Read { offset, length } => RequestOp::Read {
                object,
                offset,
                length,
            },
            Body::Write { offset, data } => RequestOp::Write {
                object,
                offset,
                data,
                token: token(),
            },
            Body::WriteFull { data } => RequestOp::WriteFull {
                object,
                data,
                token: token(),
            },
            Body::Append { data } => RequestOp::Append {
                object,
                data,
                token: token(),
            },
            Body::Remove => RequestOp::Remove {
                object,
                token: token(),
            },
            Body::Stat => RequestOp::Stat { object },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use radx_common::PoolId;

    fn object() -> ObjectRef {
        ObjectRef::new(PoolId(1), "k", None, 16).unwrap()
    }

    #[test]
    fn deadline_precedence() {
        let now = Instant::now();
        let default = Duration::from_secs(30);

        let plain = Operation::stat(object());
        assert_eq!(plain.deadline(now, default), now + default);

        let timed = Operation::stat(object()).with_timeout(Duration::from_millis(5));
        assert_eq!(timed.deadline(now, default), now + Duration::from_millis(5));

        let fixed = now + Duration::from_secs(1);
        let both = Operation::stat(object())
            .with_timeout(Duration::from_millis(5))
            .with_deadline(fixed);
        assert_eq!(both.deadline(now, default), fixed);
    }

    #[test]
    fn huge_timeouts_are_clamped() {
        let now = Instant::now();
        let op = Operation::stat(object()).with_timeout(Duration::MAX);
        assert_eq!(op.deadline(now, Duration::from_secs(1)), now + FAR_FUTURE);
        assert_eq!(
            Operation::stat(object()).deadline(now, Duration::MAX),
            now + FAR_FUTURE
        );
        assert_eq!(deadline_after(now, Duration::from_secs(2)), now + Duration::from_secs(2));
    }

    #[test]
    fn overflowing_range_is_rejected() {
        let op = Operation::read(object(), u64::MAX, 2);
        assert!(matches!(op.validate(), Err(RadxError::Validation(_))));
        assert!(Operation::read(object(), 10, 20).validate().is_ok());
    }

    #[test]
    fn tokens_only_for_mutations() {
        let mut drawn = 0;
        let read = Operation::read(object(), 0, 4).into_request(|| {
            drawn += 1;
            RequestToken { client: 1, seq: 1 }
        });
        assert!(matches!(read, RequestOp::Read { .. }));
        assert_eq!(drawn, 0);

        let append = Operation::append(object(), "x").into_request(|| RequestToken { client: 1, seq: 2 });
        match append {
            RequestOp::Append { token, .. } => assert_eq!(token.seq, 2),
            other => panic!("unexpected request {:?}", other),
        }
    }
}
