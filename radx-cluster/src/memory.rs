//! # In-Memory Cluster
//!
//! Sharded object table plus the cluster-level bookkeeping a client talks to:
//! identity and monitors, users, pools with byte quotas, and a reply cache for
//! token-tagged mutations.
//!
//! ## Structure Overview
//!
//! ```text
//! MemoryCluster
//!   ├── name / monitors / users
//!   ├── pools: RwLock<PoolTable>
//!   │     └── PoolState { id, name, quota, used }
//!   ├── shards: Vec<Shard>
//!   │     └── Shard { objects: RwLock<HashMap<ObjectRef, StoredObject>> }
//!   └── replies: Mutex<ReplyCache>
//! ```
//!
//! ## Locking
//! - A mutation holds its shard's write lock for the whole
//!   check-replay / apply / record-reply sequence. A token always maps to the
//!   same object, so duplicates of one mutation serialize on that lock.
//! - Lock order is shard, then replies. Pool table locks are never held while
//!   a shard lock is taken.

use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use ahash::RandomState;
use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use radx_common::{Ack, Credentials, ObjectRef, ObjectStat, PoolId, PoolInfo, RequestToken};

use crate::error::{ClusterError, ClusterResult};
use crate::replies::ReplyCache;

/// Largest object the cluster accepts (128 MiB).
pub const MAX_OBJECT_SIZE: u64 = 128 << 20;

/// Default shards = CPU count * multiplier to reduce lock contention.
const DEFAULT_SHARD_MULTIPLIER: usize = 4;

/// Quota value meaning "no limit".
const UNLIMITED: u64 = u64::MAX;

#[derive(Debug)]
struct StoredObject {
    data: Vec<u8>,
    mtime: SystemTime,
    version: u64,
}

#[derive(Debug)]
struct PoolState {
    id: PoolId,
    name: String,
    quota: AtomicU64,
    used: AtomicU64,
}

impl PoolState {
    /// Accounts `delta` more bytes, failing if the quota would be exceeded.
    fn reserve(&self, delta: u64) -> ClusterResult<()> {
        if delta == 0 {
            return Ok(());
        }
        let quota = self.quota.load(Ordering::Relaxed);
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(delta).filter(|&next| next <= quota)
            })
            .map(|_| ())
            .map_err(|_| ClusterError::QuotaExceeded(self.name.clone()))
    }

    fn release(&self, delta: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(delta))
            });
    }
}

#[derive(Debug, Default)]
struct PoolTable {
    by_name: HashMap<String, Arc<PoolState>>,
    by_id: HashMap<PoolId, Arc<PoolState>>,
}

#[derive(Debug)]
struct Shard {
    objects: RwLock<HashMap<ObjectRef, StoredObject, RandomState>>,
}

/// How a mutation changes an object.
enum Mutation<'a> {
    Write { offset: u64, data: &'a [u8] },
    WriteFull { data: &'a [u8] },
    Append { data: &'a [u8] },
    Remove,
}

/// In-process cluster shared by every transport pointed at it.
#[derive(Debug)]
pub struct MemoryCluster {
    name: String,
    monitors: Vec<String>,
    /// Entity -> secret. Empty means authentication is disabled.
    users: RwLock<HashMap<String, String>>,
    pools: RwLock<PoolTable>,
    shards: Vec<Shard>,
    /// Bitmask for fast shard selection (power-of-two shard count).
    shard_mask: usize,
    hash_state: RandomState,
    replies: Mutex<ReplyCache>,
    next_pool_id: AtomicI64,
    next_instance_id: AtomicU64,
    next_version: AtomicU64,
}

impl MemoryCluster {
    /// Creates a cluster with a shard count based on CPU parallelism.
    pub fn new(name: impl Into<String>, monitors: Vec<String>) -> Self {
        let threads = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);
        Self::with_shard_count(name, monitors, threads.saturating_mul(DEFAULT_SHARD_MULTIPLIER))
    }

    /// Creates a cluster with a caller-provided shard count.
    ///
    /// The count is normalized to the next power of two to enable fast masking.
    pub fn with_shard_count(name: impl Into<String>, monitors: Vec<String>, shards: usize) -> Self {
        let shard_count = shards.max(1).next_power_of_two();
        let hash_state = RandomState::new();
        let shards = (0..shard_count)
            .map(|_| Shard {
                objects: RwLock::new(HashMap::with_hasher(hash_state.clone())),
            })
            .collect();

        MemoryCluster {
            name: name.into(),
            monitors,
            users: RwLock::new(HashMap::new()),
            pools: RwLock::new(PoolTable::default()),
            shards,
            shard_mask: shard_count - 1,
            hash_state,
            replies: Mutex::new(ReplyCache::default()),
            next_pool_id: AtomicI64::new(1),
            next_instance_id: AtomicU64::new(4096),
            next_version: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn monitors(&self) -> &[String] {
        &self.monitors
    }

    /// Registers a user. Once any user exists, every client must authenticate.
    pub fn add_user(&self, entity: impl Into<String>, secret: impl Into<String>) {
        self.users.write().insert(entity.into(), secret.into());
    }

    /// Checks cluster identity, monitor reachability and credentials.
    ///
    /// Returns a fresh instance id that the client uses in request tokens.
    pub fn authenticate(
        &self,
        cluster_name: &str,
        mon_hosts: &[String],
        credentials: &Credentials,
    ) -> ClusterResult<u64> {
        if !mon_hosts.iter().any(|host| self.monitors.contains(host)) {
            return Err(ClusterError::Unreachable(mon_hosts.to_vec()));
        }
        if cluster_name != self.name {
            return Err(ClusterError::WrongCluster {
                expected: self.name.clone(),
                requested: cluster_name.to_string(),
            });
        }

        let users = self.users.read();
        if !users.is_empty() {
            let accepted = match (users.get(&credentials.entity), &credentials.secret) {
                (Some(expected), Some(given)) => expected == given,
                _ => false,
            };
            if !accepted {
                return Err(ClusterError::PermissionDenied(credentials.entity.clone()));
            }
        }

        let id = self.next_instance_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(cluster = %self.name, entity = %credentials.entity, instance = id, "client authenticated");
        Ok(id)
    }

    /// Creates an unlimited pool.
    pub fn create_pool(&self, name: &str) -> ClusterResult<PoolId> {
        self.create_pool_with_quota(name, None)
    }

    /// Creates a pool with an optional byte quota.
    pub fn create_pool_with_quota(&self, name: &str, max_bytes: Option<u64>) -> ClusterResult<PoolId> {
        if name.is_empty() {
            return Err(ClusterError::InvalidArgument("pool name must not be empty".into()));
        }
        let mut table = self.pools.write();
        if table.by_name.contains_key(name) {
            return Err(ClusterError::PoolExists(name.to_string()));
        }

        let id = PoolId(self.next_pool_id.fetch_add(1, Ordering::Relaxed));
        let state = Arc::new(PoolState {
            id,
            name: name.to_string(),
            quota: AtomicU64::new(max_bytes.unwrap_or(UNLIMITED)),
            used: AtomicU64::new(0),
        });
        table.by_name.insert(name.to_string(), Arc::clone(&state));
        table.by_id.insert(id, state);
        Ok(id)
    }

    /// Changes a pool's quota. `None` removes the limit.
    pub fn set_pool_quota(&self, id: PoolId, max_bytes: Option<u64>) -> ClusterResult<()> {
        let pool = self.pool_state(id)?;
        pool.quota.store(max_bytes.unwrap_or(UNLIMITED), Ordering::Relaxed);
        Ok(())
    }

    pub fn pool_lookup(&self, name: &str) -> ClusterResult<PoolId> {
        self.pools
            .read()
            .by_name
            .get(name)
            .map(|pool| pool.id)
            .ok_or_else(|| ClusterError::NoPool(name.to_string()))
    }

    /// Lists pools ordered by id.
    pub fn pool_list(&self) -> Vec<PoolInfo> {
        let mut pools: Vec<PoolInfo> = self
            .pools
            .read()
            .by_id
            .values()
            .map(|pool| PoolInfo {
                id: pool.id,
                name: pool.name.clone(),
            })
            .collect();
        pools.sort_by_key(|pool| pool.id);
        pools
    }

    /// Returns the pool's name, or `NoPool`.
    pub fn pool_name(&self, id: PoolId) -> ClusterResult<String> {
        self.pool_state(id).map(|pool| pool.name.clone())
    }

    /// Bytes currently accounted against a pool.
    pub fn pool_usage(&self, id: PoolId) -> ClusterResult<u64> {
        self.pool_state(id).map(|pool| pool.used.load(Ordering::Relaxed))
    }

    /// Total number of stored objects across all pools.
    pub fn object_count(&self) -> usize {
        self.shards.iter().map(|shard| shard.objects.read().len()).sum()
    }

    /// Reads up to `length` bytes starting at `offset`.
    ///
    /// Reading past the end returns the bytes that exist, possibly none.
    pub fn read(&self, obj: &ObjectRef, offset: u64, length: u64) -> ClusterResult<Bytes> {
        self.pool_state(obj.pool())?;
        let objects = self.shard_for(obj).objects.read();
        let stored = objects.get(obj).ok_or(ClusterError::NoEntry)?;

        let len = stored.data.len() as u64;
        if offset >= len {
            return Ok(Bytes::new());
        }
        let end = offset.saturating_add(length).min(len);
        Ok(Bytes::copy_from_slice(&stored.data[offset as usize..end as usize]))
    }

    pub fn stat(&self, obj: &ObjectRef) -> ClusterResult<ObjectStat> {
        self.pool_state(obj.pool())?;
        let objects = self.shard_for(obj).objects.read();
        let stored = objects.get(obj).ok_or(ClusterError::NoEntry)?;
        Ok(ObjectStat {
            size: stored.data.len() as u64,
            last_modified: stored.mtime,
        })
    }

    /// Writes `data` at `offset`, zero-filling any gap past the current end.
    pub fn write(
        &self,
        obj: &ObjectRef,
        offset: u64,
        data: &[u8],
        token: Option<RequestToken>,
    ) -> ClusterResult<Ack> {
        self.apply(obj, Mutation::Write { offset, data }, token)
    }

    /// Replaces the object's content.
    pub fn write_full(&self, obj: &ObjectRef, data: &[u8], token: Option<RequestToken>) -> ClusterResult<Ack> {
        self.apply(obj, Mutation::WriteFull { data }, token)
    }

    pub fn append(&self, obj: &ObjectRef, data: &[u8], token: Option<RequestToken>) -> ClusterResult<Ack> {
        self.apply(obj, Mutation::Append { data }, token)
    }

    pub fn remove(&self, obj: &ObjectRef, token: Option<RequestToken>) -> ClusterResult<Ack> {
        self.apply(obj, Mutation::Remove, token)
    }

    fn apply(
        &self,
        obj: &ObjectRef,
        mutation: Mutation<'_>,
        token: Option<RequestToken>,
    ) -> ClusterResult<Ack> {
        let pool = self.pool_state(obj.pool())?;
        let mut objects = self.shard_for(obj).objects.write();

        if let Some(token) = token {
            if let Some(ack) = self.replies.lock().get(&token) {
                tracing::debug!(object = %obj, seq = token.seq, "replaying ack for duplicate request");
                return Ok(ack);
            }
        }

        let old_len = objects.get(obj).map(|stored| stored.data.len() as u64);
        let new_len = match &mutation {
            Mutation::Write { offset, data } => {
                let end = offset
                    .checked_add(data.len() as u64)
                    .ok_or_else(|| ClusterError::InvalidArgument("offset overflow".into()))?;
                end.max(old_len.unwrap_or(0))
            }
            Mutation::WriteFull { data } => data.len() as u64,
            Mutation::Append { data } => old_len.unwrap_or(0) + data.len() as u64,
            Mutation::Remove => {
                if old_len.is_none() {
                    return Err(ClusterError::NoEntry);
                }
                0
            }
        };
        if new_len > MAX_OBJECT_SIZE {
            return Err(ClusterError::InvalidArgument(format!(
                "object would grow to {} bytes, limit is {}",
                new_len, MAX_OBJECT_SIZE
            )));
        }

        // Quota is checked before anything changes so a rejected write leaves no trace.
        let old = old_len.unwrap_or(0);
        if new_len > old {
            pool.reserve(new_len - old)?;
        } else {
            pool.release(old - new_len);
        }

        let version = self.next_version.fetch_add(1, Ordering::Relaxed) + 1;
        let now = SystemTime::now();
        if let Mutation::Remove = mutation {
            objects.remove(obj);
        } else {
            let stored = objects.entry(obj.clone()).or_insert_with(|| StoredObject {
                data: Vec::new(),
                mtime: now,
                version: 0,
            });
            match mutation {
                Mutation::Write { offset, data } => {
                    let start = offset as usize;
                    let end = start + data.len();
                    if stored.data.len() < end {
                        stored.data.resize(end, 0);
                    }
                    stored.data[start..end].copy_from_slice(data);
                }
                Mutation::WriteFull { data } => {
                    stored.data.clear();
                    stored.data.extend_from_slice(data);
                }
                Mutation::Append { data } => stored.data.extend_from_slice(data),
                Mutation::Remove => {}
            }
            stored.mtime = now;
            stored.version = version;
        }

        let ack = Ack { version };
        if let Some(token) = token {
            self.replies.lock().insert(token, ack);
        }
        Ok(ack)
    }

    fn pool_state(&self, id: PoolId) -> ClusterResult<Arc<PoolState>> {
        self.pools
            .read()
            .by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| ClusterError::NoPool(id.to_string()))
    }

    /// Hashes an object to its owning shard.
    fn shard_for(&self, obj: &ObjectRef) -> &Shard {
        let mut hasher = self.hash_state.build_hasher();
        obj.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) & self.shard_mask]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> (MemoryCluster, PoolId) {
        let cluster = MemoryCluster::with_shard_count("radx", vec!["mon-a:6789".into()], 4);
        let pool = cluster.create_pool("data").unwrap();
        (cluster, pool)
    }

    fn obj(pool: PoolId, key: &str) -> ObjectRef {
        ObjectRef::new(pool, key.to_string(), None, 64).unwrap()
    }

    fn creds(secret: Option<&str>) -> Credentials {
        Credentials {
            entity: "client.admin".into(),
            secret: secret.map(str::to_string),
        }
    }

    #[test]
    fn write_read_roundtrip() {
        let (cluster, pool) = cluster();
        let k1 = obj(pool, "k1");
        cluster.write(&k1, 0, b"hello", None).unwrap();
        assert_eq!(&cluster.read(&k1, 0, 5).unwrap()[..], b"hello");
        assert_eq!(&cluster.read(&k1, 1, 3).unwrap()[..], b"ell");
    }

    #[test]
    fn write_past_end_zero_fills() {
        let (cluster, pool) = cluster();
        let k = obj(pool, "k");
        cluster.write(&k, 0, b"ab", None).unwrap();
        cluster.write(&k, 4, b"cd", None).unwrap();
        assert_eq!(&cluster.read(&k, 0, 16).unwrap()[..], b"ab\0\0cd");
        assert_eq!(cluster.stat(&k).unwrap().size, 6);
    }

    #[test]
    fn write_full_truncates_and_append_extends() {
        let (cluster, pool) = cluster();
        let k = obj(pool, "k");
        cluster.write(&k, 0, b"long content", None).unwrap();
        cluster.write_full(&k, b"short", None).unwrap();
        cluster.append(&k, b"!", None).unwrap();
        assert_eq!(&cluster.read(&k, 0, 64).unwrap()[..], b"short!");
        assert_eq!(cluster.pool_usage(pool).unwrap(), 6);
    }

    #[test]
    fn read_past_end_is_empty() {
        let (cluster, pool) = cluster();
        let k = obj(pool, "k");
        cluster.write(&k, 0, b"abc", None).unwrap();
        assert!(cluster.read(&k, 10, 4).unwrap().is_empty());
    }

    #[test]
    fn missing_object_and_pool() {
        let (cluster, pool) = cluster();
        assert_eq!(cluster.read(&obj(pool, "missing"), 0, 1), Err(ClusterError::NoEntry));
        assert_eq!(cluster.remove(&obj(pool, "missing"), None), Err(ClusterError::NoEntry));
        assert!(matches!(
            cluster.stat(&obj(PoolId(99), "k")),
            Err(ClusterError::NoPool(_))
        ));
    }

    #[test]
    fn remove_releases_quota() {
        let (cluster, pool) = cluster();
        let k = obj(pool, "k");
        cluster.write(&k, 0, b"12345", None).unwrap();
        cluster.remove(&k, None).unwrap();
        assert_eq!(cluster.pool_usage(pool).unwrap(), 0);
        assert_eq!(cluster.object_count(), 0);
    }

    #[test]
    fn quota_rejects_without_side_effects() {
        let (cluster, _) = cluster();
        let pool = cluster.create_pool_with_quota("small", Some(4)).unwrap();
        let k = obj(pool, "k");
        cluster.write(&k, 0, b"abc", None).unwrap();

        let err = cluster.append(&k, b"de", None).unwrap_err();
        assert_eq!(err, ClusterError::QuotaExceeded("small".into()));
        assert_eq!(&cluster.read(&k, 0, 16).unwrap()[..], b"abc");
        assert_eq!(cluster.pool_usage(pool).unwrap(), 3);

        cluster.set_pool_quota(pool, None).unwrap();
        cluster.append(&k, b"de", None).unwrap();
    }

    #[test]
    fn duplicate_token_is_applied_once() {
        let (cluster, pool) = cluster();
        let k = obj(pool, "k");
        let token = RequestToken { client: 1, seq: 1 };
        let first = cluster.append(&k, b"x", Some(token)).unwrap();
        let second = cluster.append(&k, b"x", Some(token)).unwrap();
        assert_eq!(first, second);
        assert_eq!(&cluster.read(&k, 0, 8).unwrap()[..], b"x");
    }

    #[test]
    fn namespaces_are_disjoint() {
        let (cluster, pool) = cluster();
        let plain = obj(pool, "k");
        let scoped = ObjectRef::new(pool, "k", Some("ns"), 64).unwrap();
        cluster.write_full(&plain, b"a", None).unwrap();
        assert_eq!(cluster.read(&scoped, 0, 1), Err(ClusterError::NoEntry));
    }

    #[test]
    fn versions_increase() {
        let (cluster, pool) = cluster();
        let k = obj(pool, "k");
        let a = cluster.write_full(&k, b"a", None).unwrap();
        let b = cluster.write_full(&k, b"b", None).unwrap();
        assert!(b.version > a.version);
    }

    #[test]
    fn pool_table_operations() {
        let (cluster, pool) = cluster();
        assert_eq!(cluster.pool_lookup("data").unwrap(), pool);
        assert!(matches!(cluster.create_pool("data"), Err(ClusterError::PoolExists(_))));
        let logs = cluster.create_pool("logs").unwrap();
        let names: Vec<String> = cluster.pool_list().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["data", "logs"]);
        assert_eq!(cluster.pool_name(logs).unwrap(), "logs");
    }

    #[test]
    fn authentication_rules() {
        let (cluster, _) = cluster();
        let mons = vec!["mon-a:6789".to_string()];
        assert!(cluster.authenticate("radx", &mons, &creds(None)).is_ok());

        cluster.add_user("client.admin", "secret");
        assert!(matches!(
            cluster.authenticate("radx", &mons, &creds(None)),
            Err(ClusterError::PermissionDenied(_))
        ));
        assert!(matches!(
            cluster.authenticate("radx", &mons, &creds(Some("wrong"))),
            Err(ClusterError::PermissionDenied(_))
        ));
        let a = cluster.authenticate("radx", &mons, &creds(Some("secret"))).unwrap();
        let b = cluster.authenticate("radx", &mons, &creds(Some("secret"))).unwrap();
        assert_ne!(a, b);

        assert!(matches!(
            cluster.authenticate("other", &mons, &creds(Some("secret"))),
            Err(ClusterError::WrongCluster { .. })
        ));
        assert!(matches!(
            cluster.authenticate("radx", &["mon-z:1".to_string()], &creds(Some("secret"))),
            Err(ClusterError::Unreachable(_))
        ));
    }

    #[test]
    fn rejects_oversized_objects() {
        let (cluster, pool) = cluster();
        let k = obj(pool, "k");
        assert!(matches!(
            cluster.write(&k, MAX_OBJECT_SIZE, b"x", None),
            Err(ClusterError::InvalidArgument(_))
        ));
    }
}
