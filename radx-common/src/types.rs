//! # Object and Pool Value Types
//!
//! Small immutable values that parameterize requests: pool identifiers,
//! object references, and the results returned by object operations.
//!
//! ## Design Principles
//!
//! 1. **Values, not handles**: `ObjectRef` owns no resources and can be cloned,
//!    stored, and sent across threads freely.
//! 2. **Validate once**: keys are checked when the `ObjectRef` is built, so the
//!    executor never sees an empty or oversized key.
//! 3. **Opaque keys**: keys are byte strings with no implied ordering or encoding.

use std::fmt;
use std::time::SystemTime;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{RadxError, RadxResult};

/// Default upper bound for object key length in bytes.
pub const DEFAULT_MAX_OBJECT_NAME_LEN: usize = 2048;

/// Numeric pool identifier assigned by the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolId(pub i64);

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pool id and name pair returned by pool listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolInfo {
    pub id: PoolId,
    pub name: String,
}

/// Reference to an object inside a pool.
///
/// The reference is a plain value: building one validates the key but does not
/// touch the cluster, and holding one keeps nothing alive.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pool: PoolId,
    key: Bytes,
    namespace: Option<String>,
}

impl ObjectRef {
    /// Builds a validated reference.
    ///
    /// # Errors
    /// Returns `RadxError::Validation` when the key is empty or longer than
    /// `max_key_len`. An empty namespace string selects the default namespace.
    pub fn new(
        pool: PoolId,
        key: impl Into<Bytes>,
        namespace: Option<&str>,
        max_key_len: usize,
    ) -> RadxResult<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(RadxError::validation("object key must not be empty"));
        }
        if key.len() > max_key_len {
            return Err(RadxError::validation(format!(
                "object key is {} bytes, limit is {}",
                key.len(),
                max_key_len
            )));
        }

        let namespace = namespace.filter(|ns| !ns.is_empty()).map(str::to_owned);
        Ok(ObjectRef {
            pool,
            key,
            namespace,
        })
    }

    #[inline]
    pub fn pool(&self) -> PoolId {
        self.pool
    }

    #[inline]
    pub fn key(&self) -> &Bytes {
        &self.key
    }

    #[inline]
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({})", self)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key = String::from_utf8_lossy(&self.key);
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.pool, ns, key),
            None => write!(f, "{}/{}", self.pool, key),
        }
    }
}

/// Size and modification time of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectStat {
    pub size: u64,
    pub last_modified: SystemTime,
}

/// Acknowledgement of an applied mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// Object version after the mutation was applied. 0 when the applying
    /// attempt's reply was lost and a resend confirmed the outcome.
    pub version: u64,
}

/// Kind of object operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Read,
    Write,
    WriteFull,
    Append,
    Remove,
    Stat,
}

impl OpKind {
    /// Returns true when re-sending the operation cannot change the outcome.
    ///
    /// Remove counts as idempotent: a duplicate either replays the original
    /// acknowledgement (token-deduplicating transports) or finds nothing left,
    /// which the executor settles as success.
    pub fn is_idempotent(self) -> bool {
        matches!(self, OpKind::Read | OpKind::Stat | OpKind::Remove)
    }

    /// Returns true for operations that change object state.
    pub fn is_mutation(self) -> bool {
        !matches!(self, OpKind::Read | OpKind::Stat)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Read => "read",
            OpKind::Write => "write",
            OpKind::WriteFull => "write_full",
            OpKind::Append => "append",
            OpKind::Remove => "remove",
            OpKind::Stat => "stat",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one logical mutation across all of its retries.
///
/// `client` is the instance id handed out by the cluster at connect time and
/// `seq` increases monotonically per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestToken {
    pub client: u64,
    pub seq: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_key() {
        let err = ObjectRef::new(PoolId(1), Bytes::new(), None, 16).unwrap_err();
        assert!(matches!(err, RadxError::Validation(_)));
    }

    #[test]
    fn rejects_oversized_key() {
        let key = vec![b'a'; 17];
        let err = ObjectRef::new(PoolId(1), key, None, 16).unwrap_err();
        assert!(matches!(err, RadxError::Validation(_)));
        assert!(ObjectRef::new(PoolId(1), vec![b'a'; 16], None, 16).is_ok());
    }

    #[test]
    fn empty_namespace_is_default() {
        let a = ObjectRef::new(PoolId(1), "k", Some(""), 16).unwrap();
        let b = ObjectRef::new(PoolId(1), "k", None, 16).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.namespace(), None);
    }

    #[test]
    fn display_includes_namespace() {
        let obj = ObjectRef::new(PoolId(3), "k1", Some("ns"), 16).unwrap();
        assert_eq!(obj.to_string(), "3/ns/k1");
    }

    #[test]
    fn idempotence_classification() {
        assert!(OpKind::Read.is_idempotent());
        assert!(OpKind::Remove.is_idempotent());
        assert!(!OpKind::Write.is_idempotent());
        assert!(!OpKind::Append.is_idempotent());
        assert!(OpKind::Remove.is_mutation());
        assert!(!OpKind::Stat.is_mutation());
    }
}
