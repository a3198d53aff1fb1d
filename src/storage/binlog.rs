//! Binlog: the durable replicated log
//!
//! Append-only sequence of entries addressed by zero-based index. Entries
//! are keyed by big-endian index in RocksDB, with bookkeeping keys for the
//! logical length, the first non-compacted slot, and the term of the entry
//! just below it. Every mutation is written synchronously; an entry is on
//! disk before `append_entry` returns.
//!
//! Reads distinguish a slot that was compacted away (the caller should fall
//! back to snapshot transfer) from a slot that does not exist yet.

use crate::common::{Error, Result};
use rocksdb::{Options, WriteBatch, WriteOptions, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;

const KEY_LENGTH: &[u8] = b"meta/length";
const KEY_START: &[u8] = b"meta/start";
const KEY_TRIM_TERM: &[u8] = b"meta/trim_term";

/// Operation carried by a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogOp {
    Nop,
    Put,
    Del,
    Lock,
    Unlock,
    Login,
    Logout,
    Register,
    AddNode,
}

impl LogOp {
    /// Tag byte stored ahead of KV values written by this op
    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// A replicated log entry
///
/// `user` carries a username or a login uuid depending on the op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: i64,
    pub op: LogOp,
    pub key: String,
    pub value: Vec<u8>,
    pub user: String,
}

impl LogEntry {
    pub fn nop(term: i64) -> Self {
        Self {
            term,
            op: LogOp::Nop,
            key: "Ping".to_string(),
            value: Vec::new(),
            user: String::new(),
        }
    }
}

fn slot_key(index: i64) -> [u8; 8] {
    (index as u64).to_be_bytes()
}

fn encode_i64(v: i64) -> Vec<u8> {
    v.to_le_bytes().to_vec()
}

fn decode_i64(bytes: &[u8]) -> Result<i64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Corrupted("bad i64 record in binlog".into()))?;
    Ok(i64::from_le_bytes(arr))
}

/// Durable log store
pub struct BinLogger {
    db: DB,
    /// Logical length: index of the next slot to be appended
    length: i64,
    /// First slot still present; everything below was compacted away
    start_index: i64,
    /// Term of the entry at `start_index - 1` (or -1 for an untrimmed log)
    trim_term: i64,
}

impl BinLogger {
    /// Open or create the binlog under `dir`
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, dir.as_ref())?;

        let length = match db.get(KEY_LENGTH)? {
            Some(v) => decode_i64(&v)?,
            None => 0,
        };
        let start_index = match db.get(KEY_START)? {
            Some(v) => decode_i64(&v)?,
            None => 0,
        };
        let trim_term = match db.get(KEY_TRIM_TERM)? {
            Some(v) => decode_i64(&v)?,
            None => -1,
        };

        Ok(Self {
            db,
            length,
            start_index,
            trim_term,
        })
    }

    fn sync_opts() -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        opts
    }

    fn write_bookkeeping(&self, batch: &mut WriteBatch, length: i64, start: i64, trim_term: i64) {
        batch.put(KEY_LENGTH, encode_i64(length));
        batch.put(KEY_START, encode_i64(start));
        batch.put(KEY_TRIM_TERM, encode_i64(trim_term));
    }

    /// Number of slots ever appended (compacted slots included)
    pub fn get_length(&self) -> i64 {
        self.length
    }

    /// Append one entry; returns the index it was assigned
    pub fn append_entry(&mut self, entry: &LogEntry) -> Result<i64> {
        let index = self.length;
        let encoded = bincode::serialize(entry)
            .map_err(|e| Error::Corrupted(format!("encode log entry: {}", e)))?;
        let mut batch = WriteBatch::default();
        batch.put(slot_key(index), encoded);
        self.write_bookkeeping(&mut batch, index + 1, self.start_index, self.trim_term);
        self.db.write_opt(batch, &Self::sync_opts())?;
        self.length = index + 1;
        Ok(index)
    }

    /// Append a replicated batch starting at the current length
    pub fn append_batch(&mut self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::default();
        let mut index = self.length;
        for entry in entries {
            let encoded = bincode::serialize(entry)
                .map_err(|e| Error::Corrupted(format!("encode log entry: {}", e)))?;
            batch.put(slot_key(index), encoded);
            index += 1;
        }
        self.write_bookkeeping(&mut batch, index, self.start_index, self.trim_term);
        self.db.write_opt(batch, &Self::sync_opts())?;
        self.length = index;
        Ok(())
    }

    /// Read the entry at `index`.
    ///
    /// `Err(LogGap)` means the slot was compacted away; `Err(LogBeyondEnd)`
    /// means it has not been appended yet.
    pub fn read_slot(&self, index: i64) -> Result<LogEntry> {
        if index < self.start_index {
            return Err(Error::LogGap(index));
        }
        if index >= self.length {
            return Err(Error::LogBeyondEnd(index));
        }
        match self.db.get(slot_key(index))? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map_err(|e| Error::Corrupted(format!("decode log entry {}: {}", index, e))),
            None => Err(Error::LogGap(index)),
        }
    }

    /// Term of the entry at `index`; handles the virtual slot below the
    /// compaction floor (`index == start_index - 1`) and the empty-log
    /// sentinel (-1 at index -1).
    pub fn term_at(&self, index: i64) -> Result<i64> {
        if index == self.start_index - 1 {
            return Ok(self.trim_term);
        }
        Ok(self.read_slot(index)?.term)
    }

    /// Index and term of the last entry; `(-1, -1)` for an empty log
    pub fn last_log_index_and_term(&self) -> (i64, i64) {
        let last = self.length - 1;
        let term = self.term_at(last).unwrap_or(-1);
        (last, term)
    }

    /// Discard every entry with index greater than `keep_to`.
    ///
    /// `truncate(-1)` empties an untrimmed log. The length never drops below
    /// the compaction floor.
    pub fn truncate(&mut self, keep_to: i64) -> Result<()> {
        let new_length = (keep_to + 1).max(self.start_index);
        if new_length >= self.length {
            return Ok(());
        }
        let mut batch = WriteBatch::default();
        for idx in new_length..self.length {
            batch.delete(slot_key(idx));
        }
        self.write_bookkeeping(&mut batch, new_length, self.start_index, self.trim_term);
        self.db.write_opt(batch, &Self::sync_opts())?;
        self.length = new_length;
        Ok(())
    }

    /// Compact: drop every slot with index below `upto`
    pub fn remove_slot_before(&mut self, upto: i64) -> Result<()> {
        if upto <= self.start_index {
            return Ok(());
        }
        let new_start = upto.min(self.length);
        let trim_term = if new_start > 0 {
            self.term_at(new_start - 1)?
        } else {
            -1
        };
        let mut batch = WriteBatch::default();
        for idx in self.start_index..new_start {
            batch.delete(slot_key(idx));
        }
        self.write_bookkeeping(&mut batch, self.length, new_start, trim_term);
        self.db.write_opt(batch, &Self::sync_opts())?;
        self.start_index = new_start;
        self.trim_term = trim_term;
        Ok(())
    }

    /// Drop all entries and restart the log at `length`, remembering `term`
    /// as the term of the (virtual) preceding entry. Used after snapshot
    /// install.
    pub fn set_length_and_last_term(&mut self, length: i64, term: i64) -> Result<()> {
        let mut batch = WriteBatch::default();
        for idx in self.start_index..self.length {
            batch.delete(slot_key(idx));
        }
        self.write_bookkeeping(&mut batch, length, length, term);
        self.db.write_opt(batch, &Self::sync_opts())?;
        self.length = length;
        self.start_index = length;
        self.trim_term = term;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(term: i64, key: &str) -> LogEntry {
        LogEntry {
            term,
            op: LogOp::Put,
            key: key.to_string(),
            value: b"v".to_vec(),
            user: String::new(),
        }
    }

    #[test]
    fn test_append_and_read() {
        let dir = tempdir().unwrap();
        let mut log = BinLogger::open(dir.path()).unwrap();
        assert_eq!(log.get_length(), 0);
        assert_eq!(log.last_log_index_and_term(), (-1, -1));

        assert_eq!(log.append_entry(&entry(1, "a")).unwrap(), 0);
        assert_eq!(log.append_entry(&entry(1, "b")).unwrap(), 1);
        assert_eq!(log.get_length(), 2);

        let got = log.read_slot(0).unwrap();
        assert_eq!(got.key, "a");
        assert_eq!(log.last_log_index_and_term(), (1, 1));
        assert!(matches!(log.read_slot(5), Err(Error::LogBeyondEnd(5))));
    }

    #[test]
    fn test_reopen_preserves_state() {
        let dir = tempdir().unwrap();
        {
            let mut log = BinLogger::open(dir.path()).unwrap();
            log.append_entry(&entry(1, "a")).unwrap();
            log.append_entry(&entry(2, "b")).unwrap();
        }
        let log = BinLogger::open(dir.path()).unwrap();
        assert_eq!(log.get_length(), 2);
        assert_eq!(log.last_log_index_and_term(), (1, 2));
        assert_eq!(log.read_slot(0).unwrap().key, "a");
    }

    #[test]
    fn test_truncate_suffix() {
        let dir = tempdir().unwrap();
        let mut log = BinLogger::open(dir.path()).unwrap();
        for i in 0..5 {
            log.append_entry(&entry(1, &format!("k{}", i))).unwrap();
        }
        log.truncate(2).unwrap();
        assert_eq!(log.get_length(), 3);
        assert!(matches!(log.read_slot(3), Err(Error::LogBeyondEnd(3))));
        // truncating to -1 empties the log
        log.truncate(-1).unwrap();
        assert_eq!(log.get_length(), 0);
        assert_eq!(log.last_log_index_and_term(), (-1, -1));
    }

    #[test]
    fn test_remove_prefix_leaves_gap() {
        let dir = tempdir().unwrap();
        let mut log = BinLogger::open(dir.path()).unwrap();
        for i in 0..6 {
            log.append_entry(&entry(i as i64 / 2 + 1, &format!("k{}", i)))
                .unwrap();
        }
        log.remove_slot_before(3).unwrap();
        assert!(matches!(log.read_slot(2), Err(Error::LogGap(2))));
        assert_eq!(log.read_slot(3).unwrap().key, "k3");
        // the slot below the floor still answers term queries
        assert_eq!(log.term_at(2).unwrap(), 2);
        assert!(matches!(log.term_at(1), Err(Error::LogGap(1))));
        assert_eq!(log.get_length(), 6);
    }

    #[test]
    fn test_set_length_and_last_term_after_install() {
        let dir = tempdir().unwrap();
        let mut log = BinLogger::open(dir.path()).unwrap();
        for i in 0..4 {
            log.append_entry(&entry(1, &format!("k{}", i))).unwrap();
        }
        // snapshot covered indexes 0..=9 at term 3
        log.set_length_and_last_term(10, 3).unwrap();
        assert_eq!(log.get_length(), 10);
        assert_eq!(log.last_log_index_and_term(), (9, 3));
        assert!(matches!(log.read_slot(5), Err(Error::LogGap(5))));
        let idx = log.append_entry(&entry(4, "next")).unwrap();
        assert_eq!(idx, 10);
        assert_eq!(log.term_at(9).unwrap(), 3);
        assert_eq!(log.term_at(10).unwrap(), 4);
    }
}
