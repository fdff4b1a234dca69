//! Committed-record readers.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::commit::CommitPosition;
use crate::frame::{FrameCursor, FrameError};
use crate::record::Record;
use crate::storage::{LogStorageError, StorageReader};

/// Errors surfaced while reading the log stream.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// The underlying storage failed.
    #[error(transparent)]
    Storage(#[from] LogStorageError),

    /// A block contained an undecodable frame.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Lazy, restartable, position-seekable reader over committed records.
///
/// Readers are independent of the writer and of each other. A reader never
/// yields a record whose position is beyond the current commit position;
/// calling [`next`](Self::next) again later resumes where reading left
/// off, picking up newly committed records.
pub struct LogStreamReader {
    storage_reader: Box<dyn StorageReader>,
    commit: Arc<CommitPosition>,
    pending: VecDeque<Record>,
    skip_below: i64,
    last_returned: i64,
}

impl LogStreamReader {
    pub(crate) fn new(storage_reader: Box<dyn StorageReader>, commit: Arc<CommitPosition>) -> Self {
        Self {
            storage_reader,
            commit,
            pending: VecDeque::new(),
            skip_below: 0,
            last_returned: crate::record::NO_VALUE,
        }
    }

    /// Repositions the reader at the first record whose position is
    /// greater than or equal to `position`.
    pub fn seek(&mut self, position: i64) {
        self.pending.clear();
        self.skip_below = position;
        self.last_returned = crate::record::NO_VALUE;
        self.storage_reader.seek(position);
    }

    /// Position of the last record returned (-1 before the first).
    #[must_use]
    pub fn position(&self) -> i64 {
        self.last_returned
    }

    /// Returns the next committed record, or `None` if none is committed
    /// yet beyond the current position.
    ///
    /// # Errors
    ///
    /// Returns a [`ReadError`] if storage fails or a frame is corrupt.
    #[allow(clippy::should_implement_trait)] // Fallible iteration, not Iterator
    pub fn next(&mut self) -> Result<Option<Record>, ReadError> {
        loop {
            if let Some(front) = self.pending.front() {
                if front.position > self.commit.get() {
                    // Durable in storage but not yet committed; invisible.
                    return Ok(None);
                }
                let record = self
                    .pending
                    .pop_front()
                    .unwrap_or_else(|| unreachable!("front was Some"));
                self.last_returned = record.position;
                return Ok(Some(record));
            }

            let Some(block) = self.storage_reader.next_block()? else {
                return Ok(None);
            };
            let mut cursor = FrameCursor::new(&block.data);
            while let Some(record) = cursor.next()? {
                if record.position >= self.skip_below {
                    self.pending.push_back(record);
                }
            }
        }
    }
}

impl std::fmt::Debug for LogStreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStreamReader")
            .field("position", &self.last_returned)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_record;
    use crate::memory::InMemoryLogStorage;
    use crate::record::RecordSpec;
    use crate::storage::LogStorage;

    fn setup(records: &[i64]) -> (Arc<InMemoryLogStorage>, Arc<CommitPosition>) {
        let storage = Arc::new(InMemoryLogStorage::new());
        let commit = Arc::new(CommitPosition::new());
        for &position in records {
            let record = RecordSpec::command(1, 1, format!("r{position}").into_bytes())
                .into_record(position);
            let frame = encode_record(&record).unwrap();
            storage.append(position, frame).join().unwrap();
        }
        (storage, commit)
    }

    fn reader(
        storage: &Arc<InMemoryLogStorage>,
        commit: &Arc<CommitPosition>,
    ) -> LogStreamReader {
        LogStreamReader::new(storage.open_reader(), Arc::clone(commit))
    }

    #[test]
    fn test_reads_in_ascending_order() {
        let (storage, commit) = setup(&[0, 1, 2, 3]);
        commit.advance(3);

        let mut reader = reader(&storage, &commit);
        let mut positions = Vec::new();
        while let Some(record) = reader.next().unwrap() {
            positions.push(record.position);
        }
        assert_eq!(positions, vec![0, 1, 2, 3]);
        assert_eq!(reader.position(), 3);
    }

    #[test]
    fn test_never_reads_past_commit_position() {
        let (storage, commit) = setup(&[0, 1, 2]);
        commit.advance(1);

        let mut reader = reader(&storage, &commit);
        assert_eq!(reader.next().unwrap().unwrap().position, 0);
        assert_eq!(reader.next().unwrap().unwrap().position, 1);
        assert!(reader.next().unwrap().is_none());

        // Advancing the commit position makes the rest visible.
        commit.advance(2);
        assert_eq!(reader.next().unwrap().unwrap().position, 2);
    }

    #[test]
    fn test_seek_skips_records() {
        let (storage, commit) = setup(&[0, 1, 2, 3, 4]);
        commit.advance(4);

        let mut reader = reader(&storage, &commit);
        reader.seek(3);
        assert_eq!(reader.next().unwrap().unwrap().position, 3);
        assert_eq!(reader.next().unwrap().unwrap().position, 4);
        assert!(reader.next().unwrap().is_none());
    }

    #[test]
    fn test_restartable_after_none() {
        let (storage, commit) = setup(&[0]);
        commit.advance(0);

        let mut reader = reader(&storage, &commit);
        assert_eq!(reader.next().unwrap().unwrap().position, 0);
        assert!(reader.next().unwrap().is_none());

        // New records appended and committed later are picked up.
        let record = RecordSpec::command(1, 1, vec![]).into_record(1);
        storage
            .append(1, encode_record(&record).unwrap())
            .join()
            .unwrap();
        commit.advance(1);
        assert_eq!(reader.next().unwrap().unwrap().position, 1);
    }

    #[test]
    fn test_independent_readers() {
        let (storage, commit) = setup(&[0, 1]);
        commit.advance(1);

        let mut first = reader(&storage, &commit);
        let mut second = reader(&storage, &commit);

        assert_eq!(first.next().unwrap().unwrap().position, 0);
        assert_eq!(second.next().unwrap().unwrap().position, 0);
        assert_eq!(first.next().unwrap().unwrap().position, 1);
        assert_eq!(second.next().unwrap().unwrap().position, 1);
    }
}
