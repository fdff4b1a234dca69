//! Transactional state contract and an in-memory reference implementation.
//!
//! The production state engine is an external collaborator (an embedded
//! transactional key-value store); this module specifies the contract the
//! stream processor requires from it: transactional read/write, an atomic
//! point-in-time checkpoint primitive, and restore. [`InMemoryStateDb`]
//! implements the contract for tests and single-process use.

use std::collections::BTreeMap;
use std::path::Path;

use fxhash::FxHashMap;
use rkyv::rancor::Error as RkyvError;
use rkyv::util::AlignedVec;

/// Reserved keys the processor stores its positions under, so a snapshot
/// captures them atomically with the state they describe.
pub mod keys {
    /// Position of the last record fully applied to state.
    pub const LAST_PROCESSED_POSITION: &[u8] = b"\x00millrace:last-processed";
    /// Position of the last follow-up record written to the log.
    pub const LAST_WRITTEN_POSITION: &[u8] = b"\x00millrace:last-written";
}

/// Encodes a position for storage under a reserved key.
#[must_use]
pub fn encode_position(position: i64) -> Vec<u8> {
    position.to_le_bytes().to_vec()
}

/// Decodes a position stored under a reserved key (-1 if absent/invalid).
#[must_use]
pub fn decode_position(bytes: Option<&[u8]>) -> i64 {
    bytes
        .and_then(|b| <[u8; 8]>::try_from(b).ok())
        .map_or(-1, i64::from_le_bytes)
}

/// Errors from state-store operations.
#[derive(Debug, thiserror::Error)]
pub enum StateDbError {
    /// I/O failure during checkpoint or restore.
    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// State serialization failed.
    #[error("state serialization failed: {0}")]
    Serialization(String),

    /// A checkpoint file is corrupt.
    #[error("corrupt state checkpoint: {0}")]
    Corrupt(String),
}

/// Contract the stream processor requires from the state engine.
///
/// Implementations must provide an atomic point-in-time `checkpoint` that
/// does not block subsequent writes (the reference implementation copies;
/// a production engine would use its native checkpoint/MVCC primitive).
pub trait StateDb: Send + 'static {
    /// Reads a value.
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Applies a batch of writes atomically. `None` deletes the key.
    fn apply(&mut self, writes: Vec<(Vec<u8>, Option<Vec<u8>>)>);

    /// Writes a consistent point-in-time copy of the state into `dir`.
    ///
    /// # Errors
    ///
    /// Returns a [`StateDbError`] if the copy cannot be written.
    fn checkpoint(&self, dir: &Path) -> Result<(), StateDbError>;

    /// Replaces the state with the copy previously written to `dir`.
    ///
    /// # Errors
    ///
    /// Returns a [`StateDbError`] if the copy is missing or corrupt.
    fn restore(&mut self, dir: &Path) -> Result<(), StateDbError>;
}

/// Staged writes over a [`StateDb`], committed or rolled back as a unit.
///
/// Reads see staged writes first, then the underlying store. Dropping the
/// transaction without [`commit`](Self::commit) rolls it back.
pub struct Transaction<'a, S: StateDb> {
    db: &'a mut S,
    writes: Vec<(Vec<u8>, Option<Vec<u8>>)>,
    index: FxHashMap<Vec<u8>, usize>,
}

impl<'a, S: StateDb> Transaction<'a, S> {
    /// Opens a transaction over the store.
    pub fn new(db: &'a mut S) -> Self {
        Self {
            db,
            writes: Vec::new(),
            index: FxHashMap::default(),
        }
    }

    /// Reads through staged writes, then the underlying store.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        if let Some(&slot) = self.index.get(key) {
            return self.writes[slot].1.clone();
        }
        self.db.get(key)
    }

    /// Stages a put.
    pub fn put(&mut self, key: &[u8], value: Vec<u8>) {
        self.stage(key, Some(value));
    }

    /// Stages a delete.
    pub fn delete(&mut self, key: &[u8]) {
        self.stage(key, None);
    }

    /// Returns the number of staged writes.
    #[must_use]
    pub fn staged_len(&self) -> usize {
        self.writes.len()
    }

    /// Applies all staged writes to the store.
    pub fn commit(self) {
        self.db.apply(self.writes);
    }

    /// Discards all staged writes.
    pub fn rollback(self) {
        // Dropping the staged writes is the rollback.
    }

    fn stage(&mut self, key: &[u8], value: Option<Vec<u8>>) {
        if let Some(&slot) = self.index.get(key) {
            self.writes[slot].1 = value;
        } else {
            self.index.insert(key.to_vec(), self.writes.len());
            self.writes.push((key.to_vec(), value));
        }
    }
}

/// Name of the state copy file inside a checkpoint directory.
const STATE_FILE: &str = "state.bin";

/// BTree-backed [`StateDb`] for tests and single-process deployments.
///
/// `checkpoint` serializes a consistent copy of all entries as one
/// crc-framed rkyv blob.
#[derive(Debug, Default)]
pub struct InMemoryStateDb {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl InMemoryStateDb {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the store holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl StateDb for InMemoryStateDb {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries.get(key).cloned()
    }

    fn apply(&mut self, writes: Vec<(Vec<u8>, Option<Vec<u8>>)>) {
        for (key, value) in writes {
            match value {
                Some(value) => {
                    self.entries.insert(key, value);
                }
                None => {
                    self.entries.remove(&key);
                }
            }
        }
    }

    fn checkpoint(&self, dir: &Path) -> Result<(), StateDbError> {
        std::fs::create_dir_all(dir)?;

        let entries: Vec<(Vec<u8>, Vec<u8>)> = self
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let bytes: AlignedVec = rkyv::to_bytes::<RkyvError>(&entries)
            .map_err(|e| StateDbError::Serialization(e.to_string()))?;
        let crc = crc32c::crc32c(&bytes);

        #[allow(clippy::cast_possible_truncation)] // state blob well below u32::MAX in tests
        let len = bytes.len() as u32;
        let mut framed = Vec::with_capacity(8 + bytes.len());
        framed.extend_from_slice(&len.to_le_bytes());
        framed.extend_from_slice(&crc.to_le_bytes());
        framed.extend_from_slice(&bytes);

        let path = dir.join(STATE_FILE);
        std::fs::write(&path, &framed)?;
        let file = std::fs::OpenOptions::new().write(true).open(&path)?;
        file.sync_all()?;
        Ok(())
    }

    fn restore(&mut self, dir: &Path) -> Result<(), StateDbError> {
        let framed = std::fs::read(dir.join(STATE_FILE))?;
        if framed.len() < 8 {
            return Err(StateDbError::Corrupt("missing frame header".to_string()));
        }

        let len = u32::from_le_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
        let expected_crc = u32::from_le_bytes([framed[4], framed[5], framed[6], framed[7]]);
        if framed.len() - 8 < len {
            return Err(StateDbError::Corrupt(format!(
                "truncated state blob: {} of {len} bytes",
                framed.len() - 8
            )));
        }

        let data = &framed[8..8 + len];
        let actual_crc = crc32c::crc32c(data);
        if actual_crc != expected_crc {
            return Err(StateDbError::Corrupt(format!(
                "checksum mismatch: expected {expected_crc:#010x}, got {actual_crc:#010x}"
            )));
        }

        let mut aligned = AlignedVec::<16>::with_capacity(data.len());
        aligned.extend_from_slice(data);
        let entries = rkyv::from_bytes::<Vec<(Vec<u8>, Vec<u8>)>, RkyvError>(&aligned)
            .map_err(|e| StateDbError::Corrupt(e.to_string()))?;

        self.entries = entries.into_iter().collect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_transaction_overlay_reads() {
        let mut db = InMemoryStateDb::new();
        db.apply(vec![(b"a".to_vec(), Some(b"1".to_vec()))]);

        let mut txn = Transaction::new(&mut db);
        assert_eq!(txn.get(b"a"), Some(b"1".to_vec()));

        txn.put(b"a", b"2".to_vec());
        txn.put(b"b", b"3".to_vec());
        txn.delete(b"a");
        assert_eq!(txn.get(b"a"), None);
        assert_eq!(txn.get(b"b"), Some(b"3".to_vec()));

        // Same key staged twice collapses to one write.
        assert_eq!(txn.staged_len(), 2);

        txn.commit();
        assert_eq!(db.get(b"a"), None);
        assert_eq!(db.get(b"b"), Some(b"3".to_vec()));
    }

    #[test]
    fn test_rollback_discards_staged_writes() {
        let mut db = InMemoryStateDb::new();
        db.apply(vec![(b"a".to_vec(), Some(b"1".to_vec()))]);

        let mut txn = Transaction::new(&mut db);
        txn.put(b"a", b"changed".to_vec());
        txn.put(b"b", b"new".to_vec());
        txn.rollback();

        assert_eq!(db.get(b"a"), Some(b"1".to_vec()));
        assert_eq!(db.get(b"b"), None);
    }

    #[test]
    fn test_drop_is_rollback() {
        let mut db = InMemoryStateDb::new();
        {
            let mut txn = Transaction::new(&mut db);
            txn.put(b"x", b"y".to_vec());
        }
        assert!(db.is_empty());
    }

    #[test]
    fn test_checkpoint_restore_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut db = InMemoryStateDb::new();
        db.apply(vec![
            (b"a".to_vec(), Some(b"1".to_vec())),
            (b"b".to_vec(), Some(b"2".to_vec())),
        ]);

        db.checkpoint(dir.path()).unwrap();

        let mut restored = InMemoryStateDb::new();
        restored.restore(dir.path()).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.get(b"a"), Some(b"1".to_vec()));
        assert_eq!(restored.get(b"b"), Some(b"2".to_vec()));
    }

    #[test]
    fn test_checkpoint_is_point_in_time() {
        let dir = TempDir::new().unwrap();
        let mut db = InMemoryStateDb::new();
        db.apply(vec![(b"a".to_vec(), Some(b"before".to_vec()))]);

        db.checkpoint(dir.path()).unwrap();
        db.apply(vec![(b"a".to_vec(), Some(b"after".to_vec()))]);

        let mut restored = InMemoryStateDb::new();
        restored.restore(dir.path()).unwrap();
        assert_eq!(restored.get(b"a"), Some(b"before".to_vec()));
    }

    #[test]
    fn test_restore_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let mut db = InMemoryStateDb::new();
        db.apply(vec![(b"a".to_vec(), Some(b"1".to_vec()))]);
        db.checkpoint(dir.path()).unwrap();

        // Flip a byte in the blob.
        let path = dir.path().join(STATE_FILE);
        let mut data = std::fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        std::fs::write(&path, &data).unwrap();

        let mut restored = InMemoryStateDb::new();
        assert!(matches!(
            restored.restore(dir.path()),
            Err(StateDbError::Corrupt(_))
        ));
    }

    #[test]
    fn test_position_encoding() {
        assert_eq!(decode_position(Some(&encode_position(42))), 42);
        assert_eq!(decode_position(None), -1);
        assert_eq!(decode_position(Some(b"bad")), -1);
    }
}
