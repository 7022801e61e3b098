//! Shard and freespace traits (spec §3, §4.7), grounded on the original
//! `db.Store`'s `*badger.DB` handles and `Freespace` interface, adapted to
//! `sled` (declared in the teacher's dependency table, previously unused).

use crate::error::MeshError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Tag on a stored entry's value (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserMeta {
    Raw = 0,
    InnerRedirect = 1,
    OuterRedirect = 2,
}

impl TryFrom<u8> for UserMeta {
    type Error = MeshError;

    fn try_from(v: u8) -> Result<Self, MeshError> {
        match v {
            0 => Ok(UserMeta::Raw),
            1 => Ok(UserMeta::InnerRedirect),
            2 => Ok(UserMeta::OuterRedirect),
            _ => Err(MeshError::Illegal),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub key: Bytes,
    pub value: Bytes,
    pub user_meta: UserMeta,
    pub expires_at: u64,
}

/// On-disk record shape. Distinct from [`StoredEntry`] because the key is
/// already the sled key and need not be duplicated in the value.
#[derive(Serialize, Deserialize)]
struct Record {
    #[serde(with = "serde_bytes")]
    value: Vec<u8>,
    user_meta: u8,
    expires_at: u64,
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// One local KV bucket (spec §3 "Shards"): a transactional `get`/`put` with
/// commit semantics, reached only through this trait (spec §1's
/// "underlying on-disk key/value engine" external collaborator).
pub trait Shard: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<StoredEntry>, MeshError>;
    fn put(&self, entry: StoredEntry) -> Result<(), MeshError>;
}

/// A `sled::Tree` backing one logical shard. Several `SledShard`s over the
/// same `sled::Db`'s distinct trees is the cheaper multi-tree-per-db
/// equivalent of the original's one-`*badger.DB`-per-shard topology.
pub struct SledShard {
    tree: sled::Tree,
}

impl SledShard {
    pub fn new(tree: sled::Tree) -> Self {
        Self { tree }
    }
}

impl Shard for SledShard {
    fn get(&self, key: &[u8]) -> Result<Option<StoredEntry>, MeshError> {
        let Some(raw) = self.tree.get(key)? else {
            return Ok(None);
        };
        let record: Record = rmp_serde::from_slice(&raw)?;
        if record.expires_at != 0 && record.expires_at <= now_secs() {
            // Lazily expired: treated as NotFound on read (spec §5 "expiry is
            // delegated to the KV engine"); no background sweep (sled has no
            // native TTL and this crate does not add one).
            return Ok(None);
        }
        Ok(Some(StoredEntry {
            key: Bytes::copy_from_slice(key),
            value: Bytes::from(record.value),
            user_meta: UserMeta::try_from(record.user_meta)?,
            expires_at: record.expires_at,
        }))
    }

    fn put(&self, entry: StoredEntry) -> Result<(), MeshError> {
        let record = Record {
            value: entry.value.to_vec(),
            user_meta: entry.user_meta as u8,
            expires_at: entry.expires_at,
        };
        let bytes = rmp_serde::to_vec(&record)?;
        self.tree.insert(entry.key.as_ref(), bytes)?;
        Ok(())
    }
}

/// Free-space hint for a shard (spec §3, §4.7). A `None` monitor means "no
/// opinion" and the shard is always considered to have space, matching the
/// original's `if fs!=nil { hfs = fs.HasFreeSpace(...) }`.
pub trait Freespace: Send + Sync {
    fn has_free_space(&self, key_len: usize, value_len: usize) -> bool;
    fn touch(&self);
}

/// Estimates free space from `sled::Db::size_on_disk` against a configured
/// per-shard byte budget. `touch()` is a no-op: sled manages its own flush
/// and compaction schedule, so there is nothing useful to hint here.
pub struct SledFreespace {
    db: sled::Db,
    budget_bytes: u64,
    touches: AtomicU64,
}

impl SledFreespace {
    pub fn new(db: sled::Db, budget_bytes: u64) -> Self {
        Self { db, budget_bytes, touches: AtomicU64::new(0) }
    }

    pub fn touch_count(&self) -> u64 {
        self.touches.load(Ordering::Relaxed)
    }
}

impl Freespace for SledFreespace {
    fn has_free_space(&self, key_len: usize, value_len: usize) -> bool {
        let used = self.db.size_on_disk().unwrap_or(u64::MAX);
        used.saturating_add(key_len as u64).saturating_add(value_len as u64) <= self.budget_bytes
    }

    fn touch(&self) {
        self.touches.fetch_add(1, Ordering::Relaxed);
    }
}

/// In-memory [`Freespace`]/[`Shard`] pair for tests that never touch disk.
pub struct MemFreespace(std::sync::atomic::AtomicBool);

impl MemFreespace {
    pub fn always(has_space: bool) -> Arc<Self> {
        Arc::new(Self(std::sync::atomic::AtomicBool::new(has_space)))
    }

    pub fn set(&self, has_space: bool) {
        self.0.store(has_space, Ordering::SeqCst);
    }
}

impl Freespace for MemFreespace {
    fn has_free_space(&self, _key_len: usize, _value_len: usize) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn touch(&self) {}
}

pub struct MemShard {
    entries: std::sync::Mutex<std::collections::HashMap<Vec<u8>, Record>>,
}

impl MemShard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { entries: std::sync::Mutex::new(std::collections::HashMap::new()) })
    }
}

impl Shard for MemShard {
    fn get(&self, key: &[u8]) -> Result<Option<StoredEntry>, MeshError> {
        let entries = self.entries.lock().unwrap();
        let Some(record) = entries.get(key) else {
            return Ok(None);
        };
        if record.expires_at != 0 && record.expires_at <= now_secs() {
            return Ok(None);
        }
        Ok(Some(StoredEntry {
            key: Bytes::copy_from_slice(key),
            value: Bytes::from(record.value.clone()),
            user_meta: UserMeta::try_from(record.user_meta)?,
            expires_at: record.expires_at,
        }))
    }

    fn put(&self, entry: StoredEntry) -> Result<(), MeshError> {
        self.entries.lock().unwrap().insert(
            entry.key.to_vec(),
            Record {
                value: entry.value.to_vec(),
                user_meta: entry.user_meta as u8,
                expires_at: entry.expires_at,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_shard_roundtrips_raw_entry() {
        let shard = MemShard::new();
        shard
            .put(StoredEntry {
                key: Bytes::from_static(b"k"),
                value: Bytes::from_static(b"v"),
                user_meta: UserMeta::Raw,
                expires_at: 0,
            })
            .unwrap();
        let got = shard.get(b"k").unwrap().unwrap();
        assert_eq!(&got.value[..], b"v");
        assert_eq!(got.user_meta, UserMeta::Raw);
    }

    #[test]
    fn mem_shard_expired_entry_reads_as_not_found() {
        let shard = MemShard::new();
        shard
            .put(StoredEntry {
                key: Bytes::from_static(b"k"),
                value: Bytes::from_static(b"v"),
                user_meta: UserMeta::Raw,
                expires_at: 1,
            })
            .unwrap();
        assert!(shard.get(b"k").unwrap().is_none());
    }

    #[test]
    fn freespace_reports_configured_state() {
        let fs = MemFreespace::always(true);
        assert!(fs.has_free_space(1, 1));
        fs.set(false);
        assert!(!fs.has_free_space(1, 1));
    }

    #[test]
    fn sled_shard_roundtrips_raw_entry() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let shard = SledShard::new(db.open_tree("data_0").unwrap());
        shard
            .put(StoredEntry {
                key: Bytes::from_static(b"k"),
                value: Bytes::from_static(b"v"),
                user_meta: UserMeta::Raw,
                expires_at: 0,
            })
            .unwrap();
        let got = shard.get(b"k").unwrap().unwrap();
        assert_eq!(&got.value[..], b"v");
        assert_eq!(got.user_meta, UserMeta::Raw);
        assert!(shard.get(b"missing").unwrap().is_none());
    }

    #[test]
    fn sled_shard_expired_entry_reads_as_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let shard = SledShard::new(db.open_tree("data_0").unwrap());
        shard
            .put(StoredEntry {
                key: Bytes::from_static(b"k"),
                value: Bytes::from_static(b"v"),
                user_meta: UserMeta::Raw,
                expires_at: 1,
            })
            .unwrap();
        assert!(shard.get(b"k").unwrap().is_none());
    }

    #[test]
    fn sled_shard_stores_inner_and_outer_redirects() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let shard = SledShard::new(db.open_tree("data_0").unwrap());
        shard
            .put(StoredEntry {
                key: Bytes::from_static(b"k"),
                value: Bytes::from(rmp_serde::to_vec(&3i64).unwrap()),
                user_meta: UserMeta::InnerRedirect,
                expires_at: 0,
            })
            .unwrap();
        let got = shard.get(b"k").unwrap().unwrap();
        assert_eq!(got.user_meta, UserMeta::InnerRedirect);
        assert_eq!(rmp_serde::from_slice::<i64>(&got.value).unwrap(), 3);

        shard
            .put(StoredEntry {
                key: Bytes::from_static(b"k2"),
                value: Bytes::from_static(b"other-node"),
                user_meta: UserMeta::OuterRedirect,
                expires_at: 0,
            })
            .unwrap();
        let got2 = shard.get(b"k2").unwrap().unwrap();
        assert_eq!(got2.user_meta, UserMeta::OuterRedirect);
        assert_eq!(&got2.value[..], b"other-node");
    }

    #[test]
    fn sled_freespace_tracks_budget_and_touch_count() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let fs = SledFreespace::new(db.clone(), 1 << 20);
        assert!(fs.has_free_space(10, 10));
        fs.touch();
        fs.touch();
        assert_eq!(fs.touch_count(), 2);

        let tight = SledFreespace::new(db, 0);
        assert!(!tight.has_free_space(1, 1));
    }
}
