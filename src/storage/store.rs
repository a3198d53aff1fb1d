//! Per-user key-value store
//!
//! One RocksDB sub-store per registered user plus an always-open
//! `anonymous` sub-store, all under a common root. Sub-stores are opened
//! lazily; values carry a one-byte tag distinguishing plain data from lock
//! markers. The apply loop is the only writer.

use crate::common::{Error, Result};
use crate::storage::binlog::LogOp;
use rocksdb::{Options, DB};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Sub-store used by requests that carry no login uuid
pub const ANONYMOUS_USER: &str = "anonymous";

/// Reserved key persisting the apply progress of this replica
pub const TAG_LAST_APPLIED_INDEX: &str = "#TAG_LAST_APPLIED_INDEX#";

/// Tag byte ahead of every stored value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueTag {
    Put,
    Lock,
}

/// Prefix `payload` with the tag byte of `op`
pub fn encode_value(op: LogOp, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 1);
    out.push(op.tag());
    out.extend_from_slice(payload);
    out
}

/// Split a stored value into its tag and payload
pub fn parse_value(raw: &[u8]) -> Option<(ValueTag, Vec<u8>)> {
    let (&tag, payload) = raw.split_first()?;
    let tag = if tag == LogOp::Lock.tag() {
        ValueTag::Lock
    } else {
        ValueTag::Put
    };
    Some((tag, payload.to_vec()))
}

/// Root of all user sub-stores
pub struct DataStore {
    root: PathBuf,
    dbs: RwLock<HashMap<String, DB>>,
}

impl DataStore {
    /// Open the store root; the anonymous sub-store is created eagerly
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        let store = Self {
            root,
            dbs: RwLock::new(HashMap::new()),
        };
        store.open_database(ANONYMOUS_USER)?;
        Ok(store)
    }

    fn user_dir(&self, user: &str) -> PathBuf {
        self.root.join(user)
    }

    fn effective_user(user: &str) -> &str {
        if user.is_empty() {
            ANONYMOUS_USER
        } else {
            user
        }
    }

    /// Open (or create) the sub-store of `user`
    pub fn open_database(&self, user: &str) -> Result<()> {
        let user = Self::effective_user(user);
        let mut dbs = self.dbs.write().unwrap();
        if dbs.contains_key(user) {
            return Ok(());
        }
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, self.user_dir(user))?;
        dbs.insert(user.to_string(), db);
        Ok(())
    }

    pub fn get(&self, user: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let user = Self::effective_user(user);
        let dbs = self.dbs.read().unwrap();
        let db = dbs
            .get(user)
            .ok_or_else(|| Error::UnknownUser(user.to_string()))?;
        Ok(db.get(key.as_bytes())?)
    }

    pub fn put(&self, user: &str, key: &str, value: &[u8]) -> Result<()> {
        let user = Self::effective_user(user);
        let dbs = self.dbs.read().unwrap();
        let db = dbs
            .get(user)
            .ok_or_else(|| Error::UnknownUser(user.to_string()))?;
        db.put(key.as_bytes(), value)?;
        Ok(())
    }

    pub fn delete(&self, user: &str, key: &str) -> Result<()> {
        let user = Self::effective_user(user);
        let dbs = self.dbs.read().unwrap();
        let db = dbs
            .get(user)
            .ok_or_else(|| Error::UnknownUser(user.to_string()))?;
        db.delete(key.as_bytes())?;
        Ok(())
    }

    /// Walk `user`'s keys in order starting at `start_key`; the visitor
    /// returns `false` to stop early.
    pub fn scan<F>(&self, user: &str, start_key: &str, mut visit: F) -> Result<()>
    where
        F: FnMut(&str, &[u8]) -> bool,
    {
        let user = Self::effective_user(user);
        let dbs = self.dbs.read().unwrap();
        let db = dbs
            .get(user)
            .ok_or_else(|| Error::UnknownUser(user.to_string()))?;
        let mode = rocksdb::IteratorMode::From(start_key.as_bytes(), rocksdb::Direction::Forward);
        for item in db.iterator(mode) {
            let (key, value) = item?;
            let key = String::from_utf8_lossy(&key);
            if !visit(&key, &value) {
                break;
            }
        }
        Ok(())
    }

    /// Apply progress recorded in the anonymous sub-store, -1 if absent
    pub fn read_last_applied(&self) -> Result<i64> {
        match self.get(ANONYMOUS_USER, TAG_LAST_APPLIED_INDEX)? {
            Some(v) => {
                let arr: [u8; 8] = v
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Corrupted("bad last_applied record".into()))?;
                Ok(i64::from_le_bytes(arr))
            }
            None => Ok(-1),
        }
    }

    pub fn write_last_applied(&self, index: i64) -> Result<()> {
        self.put(ANONYMOUS_USER, TAG_LAST_APPLIED_INDEX, &index.to_le_bytes())
    }

    /// Drop every sub-store on disk and start over with an empty anonymous
    /// one. Callers serialize this against all readers and writers.
    pub fn reset(&self) -> Result<()> {
        let mut dbs = self.dbs.write().unwrap();
        let users: Vec<String> = dbs.keys().cloned().collect();
        dbs.clear();
        for user in users {
            DB::destroy(&Options::default(), self.user_dir(&user))?;
        }
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, self.user_dir(ANONYMOUS_USER))?;
        dbs.insert(ANONYMOUS_USER.to_string(), db);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_anonymous_store_roundtrip() {
        let dir = tempdir().unwrap();
        let store = DataStore::open(dir.path()).unwrap();
        store
            .put("", "k", &encode_value(LogOp::Put, b"hello"))
            .unwrap();
        let raw = store.get(ANONYMOUS_USER, "k").unwrap().unwrap();
        let (tag, payload) = parse_value(&raw).unwrap();
        assert_eq!(tag, ValueTag::Put);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn test_unknown_user_then_lazy_open() {
        let dir = tempdir().unwrap();
        let store = DataStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.put("alice", "k", b"\x01v"),
            Err(Error::UnknownUser(_))
        ));
        store.open_database("alice").unwrap();
        store.put("alice", "k", b"\x01v").unwrap();
        assert!(store.get("alice", "k").unwrap().is_some());
        // alice's keys are invisible to anonymous
        assert!(store.get(ANONYMOUS_USER, "k").unwrap().is_none());
    }

    #[test]
    fn test_lock_tag() {
        let dir = tempdir().unwrap();
        let store = DataStore::open(dir.path()).unwrap();
        store
            .put("", "lock/a", &encode_value(LogOp::Lock, b"session-1"))
            .unwrap();
        let raw = store.get("", "lock/a").unwrap().unwrap();
        let (tag, session) = parse_value(&raw).unwrap();
        assert_eq!(tag, ValueTag::Lock);
        assert_eq!(session, b"session-1");
    }

    #[test]
    fn test_scan_order_and_stop() {
        let dir = tempdir().unwrap();
        let store = DataStore::open(dir.path()).unwrap();
        for key in ["a", "b", "c", "d"] {
            store.put("", key, b"\x01x").unwrap();
        }
        let mut seen = Vec::new();
        store
            .scan("", "b", |k, _| {
                seen.push(k.to_string());
                seen.len() < 2
            })
            .unwrap();
        assert_eq!(seen, vec!["b", "c"]);
    }

    #[test]
    fn test_last_applied_record() {
        let dir = tempdir().unwrap();
        let store = DataStore::open(dir.path()).unwrap();
        assert_eq!(store.read_last_applied().unwrap(), -1);
        store.write_last_applied(41).unwrap();
        assert_eq!(store.read_last_applied().unwrap(), 41);
    }

    #[test]
    fn test_reset_clears_everything() {
        let dir = tempdir().unwrap();
        let store = DataStore::open(dir.path()).unwrap();
        store.put("", "k", b"\x01v").unwrap();
        store.open_database("bob").unwrap();
        store.put("bob", "k", b"\x01v").unwrap();
        store.reset().unwrap();
        assert!(store.get("", "k").unwrap().is_none());
        assert!(matches!(
            store.get("bob", "k"),
            Err(Error::UnknownUser(_))
        ));
    }
}
