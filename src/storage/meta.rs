//! Term and vote persistence
//!
//! A crashed replica must come back with the same `current_term` and the
//! same per-term vote it had promised, so every write here is synchronous.

use crate::common::{Error, Result};
use rocksdb::{Options, WriteOptions, DB};
use std::collections::HashMap;
use std::path::Path;

const KEY_CURRENT_TERM: &[u8] = b"current_term";
const VOTE_PREFIX: &str = "voted_for/";

/// Durable term/vote record
pub struct Meta {
    db: DB,
}

impl Meta {
    /// Open or create the meta store under `dir`
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, dir.as_ref())?;
        Ok(Self { db })
    }

    fn sync_opts() -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        opts
    }

    /// Last persisted term, 0 if none
    pub fn read_current_term(&self) -> Result<i64> {
        match self.db.get(KEY_CURRENT_TERM)? {
            Some(v) => {
                let arr: [u8; 8] = v
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Corrupted("bad current_term record".into()))?;
                Ok(i64::from_le_bytes(arr))
            }
            None => Ok(0),
        }
    }

    pub fn write_current_term(&self, term: i64) -> Result<()> {
        self.db
            .put_opt(KEY_CURRENT_TERM, term.to_le_bytes(), &Self::sync_opts())?;
        Ok(())
    }

    /// All recorded votes, keyed by term
    pub fn read_voted_for(&self) -> Result<HashMap<i64, String>> {
        let mut voted = HashMap::new();
        let iter = self.db.iterator(rocksdb::IteratorMode::Start);
        for item in iter {
            let (key, value) = item?;
            let key = String::from_utf8_lossy(&key);
            if let Some(term_str) = key.strip_prefix(VOTE_PREFIX) {
                let term: i64 = term_str
                    .parse()
                    .map_err(|_| Error::Corrupted(format!("bad vote key: {}", key)))?;
                let candidate = String::from_utf8(value.to_vec())
                    .map_err(|_| Error::Corrupted("bad vote record".into()))?;
                voted.insert(term, candidate);
            }
        }
        Ok(voted)
    }

    pub fn write_voted_for(&self, term: i64, candidate: &str) -> Result<()> {
        let key = format!("{}{}", VOTE_PREFIX, term);
        self.db
            .put_opt(key.as_bytes(), candidate.as_bytes(), &Self::sync_opts())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_term_roundtrip() {
        let dir = tempdir().unwrap();
        {
            let meta = Meta::open(dir.path()).unwrap();
            assert_eq!(meta.read_current_term().unwrap(), 0);
            meta.write_current_term(7).unwrap();
        }
        let meta = Meta::open(dir.path()).unwrap();
        assert_eq!(meta.read_current_term().unwrap(), 7);
    }

    #[test]
    fn test_votes_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let meta = Meta::open(dir.path()).unwrap();
            meta.write_voted_for(3, "127.0.0.1:8868").unwrap();
            meta.write_voted_for(4, "127.0.0.1:8869").unwrap();
        }
        let meta = Meta::open(dir.path()).unwrap();
        let voted = meta.read_voted_for().unwrap();
        assert_eq!(voted.get(&3).unwrap(), "127.0.0.1:8868");
        assert_eq!(voted.get(&4).unwrap(), "127.0.0.1:8869");
        assert!(voted.get(&5).is_none());
    }
}
