//! Snapshot store
//!
//! At most one live snapshot per node: the anonymous sub-store's records
//! followed by a single meta record (term, covered log index, vote,
//! membership) under a reserved key. Records are length-prefixed and
//! CRC-protected: [MAGIC][KEY_LEN][VAL_LEN][KEY][VAL][CRC32]. A snapshot is
//! built in a temporary file and atomically renamed over the previous one.

use crate::common::{crc32, Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const SNAPSHOT_MAGIC: [u8; 4] = [0x53, 0x4E, 0x50, 0x31]; // "SNP1"
const SNAPSHOT_FILE: &str = "snapshot.dat";
const SNAPSHOT_TMP: &str = "snapshot.tmp";

/// Reserved record key marking the snapshot meta; always written last
pub const SNAPSHOT_META_KEY: &[u8] = b"#SNAPSHOT_META#";

/// State the snapshot covers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub term: i64,
    pub log_index: i64,
    pub voted: String,
    pub membership: Vec<String>,
}

impl SnapshotMeta {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Corrupted(format!("encode snapshot meta: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| Error::Corrupted(format!("decode snapshot meta: {}", e)))
    }
}

/// In-progress snapshot file; records land in the temp slot until `commit`
pub struct SnapshotWriter {
    writer: BufWriter<File>,
    tmp_path: PathBuf,
    live_path: PathBuf,
}

impl SnapshotWriter {
    pub fn add_record(&mut self, key: &[u8], val: &[u8]) -> Result<()> {
        let mut framed = Vec::with_capacity(8 + key.len() + val.len());
        framed.extend_from_slice(&(key.len() as u32).to_le_bytes());
        framed.extend_from_slice(&(val.len() as u32).to_le_bytes());
        framed.extend_from_slice(key);
        framed.extend_from_slice(val);
        let checksum = crc32(&framed);
        self.writer.write_all(&SNAPSHOT_MAGIC)?;
        self.writer.write_all(&framed)?;
        self.writer.write_all(&checksum.to_le_bytes())?;
        Ok(())
    }

    pub fn add_meta(&mut self, meta: &SnapshotMeta) -> Result<()> {
        let encoded = meta.encode()?;
        self.add_record(SNAPSHOT_META_KEY, &encoded)
    }

    /// Flush, sync, and atomically replace the live snapshot
    pub fn commit(mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        std::fs::rename(&self.tmp_path, &self.live_path)?;
        Ok(())
    }
}

/// Persisted snapshot slot
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        // a temp file left by a crash is garbage
        let _ = std::fs::remove_file(dir.join(SNAPSHOT_TMP));
        Ok(Self { dir })
    }

    fn live_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    /// Start building a new snapshot in the temp slot
    pub fn begin(&self) -> Result<SnapshotWriter> {
        let tmp_path = self.dir.join(SNAPSHOT_TMP);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        Ok(SnapshotWriter {
            writer: BufWriter::new(file),
            tmp_path,
            live_path: self.live_path(),
        })
    }

    /// Remove the live snapshot (and any half-written temp)
    pub fn delete_snapshot(&self) -> Result<()> {
        let _ = std::fs::remove_file(self.dir.join(SNAPSHOT_TMP));
        match std::fs::remove_file(self.live_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Walk every user record of the live snapshot (the meta record is
    /// skipped); the visitor returns `false` to stop early.
    pub fn replay<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let file = match File::open(self.live_path()) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);
        while let Some((key, val)) = Self::read_record(&mut reader)? {
            if key == SNAPSHOT_META_KEY {
                continue;
            }
            if !visit(&key, &val) {
                break;
            }
        }
        Ok(())
    }

    /// Meta of the live snapshot, `None` when no snapshot exists
    pub fn get_meta(&self) -> Result<Option<SnapshotMeta>> {
        let file = match File::open(self.live_path()) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);
        let mut meta = None;
        while let Some((key, val)) = Self::read_record(&mut reader)? {
            if key == SNAPSHOT_META_KEY {
                meta = Some(SnapshotMeta::decode(&val)?);
            }
        }
        Ok(meta)
    }

    fn read_record<R: Read>(reader: &mut R) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut magic = [0u8; 4];
        match reader.read_exact(&mut magic) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        if magic != SNAPSHOT_MAGIC {
            return Err(Error::Corrupted("bad snapshot magic".into()));
        }

        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let key_len = u32::from_le_bytes(len_bytes) as usize;
        reader.read_exact(&mut len_bytes)?;
        let val_len = u32::from_le_bytes(len_bytes) as usize;

        let mut key = vec![0u8; key_len];
        reader.read_exact(&mut key)?;
        let mut val = vec![0u8; val_len];
        reader.read_exact(&mut val)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored = u32::from_le_bytes(checksum_bytes);

        let mut framed = Vec::with_capacity(8 + key_len + val_len);
        framed.extend_from_slice(&(key_len as u32).to_le_bytes());
        framed.extend_from_slice(&(val_len as u32).to_le_bytes());
        framed.extend_from_slice(&key);
        framed.extend_from_slice(&val);
        if crc32(&framed) != stored {
            return Err(Error::Corrupted("snapshot record checksum mismatch".into()));
        }

        Ok(Some((key, val)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn meta() -> SnapshotMeta {
        SnapshotMeta {
            term: 3,
            log_index: 99,
            voted: "127.0.0.1:8868".to_string(),
            membership: vec!["127.0.0.1:8868".to_string(), "127.0.0.1:8869".to_string()],
        }
    }

    #[test]
    fn test_empty_store_has_no_meta() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        assert!(store.get_meta().unwrap().is_none());
        store.replay(|_, _| panic!("no records expected")).unwrap();
    }

    #[test]
    fn test_write_and_replay() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();

        let mut writer = store.begin().unwrap();
        writer.add_record(b"a", b"1").unwrap();
        writer.add_record(b"b", b"2").unwrap();
        writer.add_meta(&meta()).unwrap();
        writer.commit().unwrap();

        let got_meta = store.get_meta().unwrap().unwrap();
        assert_eq!(got_meta, meta());

        let mut records = Vec::new();
        store
            .replay(|k, v| {
                records.push((k.to_vec(), v.to_vec()));
                true
            })
            .unwrap();
        assert_eq!(
            records,
            vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())]
        );
    }

    #[test]
    fn test_commit_replaces_previous_snapshot() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();

        let mut writer = store.begin().unwrap();
        writer.add_record(b"old", b"1").unwrap();
        writer.add_meta(&meta()).unwrap();
        writer.commit().unwrap();

        let mut writer = store.begin().unwrap();
        writer.add_record(b"new", b"2").unwrap();
        let mut m = meta();
        m.log_index = 200;
        writer.add_meta(&m).unwrap();
        writer.commit().unwrap();

        assert_eq!(store.get_meta().unwrap().unwrap().log_index, 200);
        let mut keys = Vec::new();
        store
            .replay(|k, _| {
                keys.push(k.to_vec());
                true
            })
            .unwrap();
        assert_eq!(keys, vec![b"new".to_vec()]);
    }

    #[test]
    fn test_delete_snapshot() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        store.delete_snapshot().unwrap();

        let mut writer = store.begin().unwrap();
        writer.add_meta(&meta()).unwrap();
        writer.commit().unwrap();
        assert!(store.get_meta().unwrap().is_some());

        store.delete_snapshot().unwrap();
        assert!(store.get_meta().unwrap().is_none());
    }
}
