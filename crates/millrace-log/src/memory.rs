//! In-memory log storage for tests and single-process experiments.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use millrace_core::ActorFuture;
use parking_lot::Mutex;

use crate::storage::{LogStorage, LogStorageError, StorageBlock, StorageReader};

struct Blocks {
    entries: VecDeque<StorageBlock>,
}

/// Heap-backed [`LogStorage`] double.
///
/// Appends complete immediately, standing in for a replication layer that
/// acknowledges synchronously. Supports failure injection for exercising
/// the appender's failure path.
pub struct InMemoryLogStorage {
    blocks: Arc<Mutex<Blocks>>,
    next_index: AtomicU64,
    fail_next_append: AtomicBool,
}

impl Default for InMemoryLogStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLogStorage {
    /// Creates empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            blocks: Arc::new(Mutex::new(Blocks {
                entries: VecDeque::new(),
            })),
            next_index: AtomicU64::new(0),
            fail_next_append: AtomicBool::new(false),
        }
    }

    /// Makes the next append fail, for testing the failure path.
    pub fn fail_next_append(&self) {
        self.fail_next_append.store(true, Ordering::Release);
    }

    /// Returns the number of retained blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.lock().entries.len()
    }
}

impl LogStorage for InMemoryLogStorage {
    fn append(
        &self,
        last_position: i64,
        block: Vec<u8>,
    ) -> ActorFuture<Result<u64, LogStorageError>> {
        if self.fail_next_append.swap(false, Ordering::AcqRel) {
            return ActorFuture::completed(Err(LogStorageError::AppendFailed(
                "injected append failure".to_string(),
            )));
        }

        let index = self.next_index.fetch_add(1, Ordering::AcqRel);
        self.blocks.lock().entries.push_back(StorageBlock {
            index,
            last_position,
            data: block,
        });
        ActorFuture::completed(Ok(index))
    }

    fn compact(&self, up_to_position: i64) -> Result<(), LogStorageError> {
        let mut blocks = self.blocks.lock();
        let before = blocks.entries.len();
        while blocks
            .entries
            .front()
            .is_some_and(|b| b.last_position <= up_to_position)
        {
            blocks.entries.pop_front();
        }
        let removed = before - blocks.entries.len();
        if removed > 0 {
            tracing::debug!(up_to_position, removed, "compacted in-memory log");
        }
        Ok(())
    }

    fn open_reader(&self) -> Box<dyn StorageReader> {
        Box::new(InMemoryReader {
            blocks: Arc::clone(&self.blocks),
            next_index: 0,
        })
    }

    fn last_durable_position(&self) -> Option<i64> {
        self.blocks.lock().entries.back().map(|b| b.last_position)
    }
}

struct InMemoryReader {
    blocks: Arc<Mutex<Blocks>>,
    next_index: u64,
}

impl StorageReader for InMemoryReader {
    fn seek(&mut self, position: i64) {
        let blocks = self.blocks.lock();
        self.next_index = blocks
            .entries
            .iter()
            .find(|b| b.last_position >= position)
            .map_or_else(
                || {
                    blocks
                        .entries
                        .back()
                        .map_or(0, |last| last.index + 1)
                },
                |b| b.index,
            );
    }

    fn next_block(&mut self) -> Result<Option<StorageBlock>, LogStorageError> {
        let blocks = self.blocks.lock();
        let found = blocks
            .entries
            .iter()
            .find(|b| b.index >= self.next_index)
            .cloned();
        if let Some(block) = &found {
            self.next_index = block.index + 1;
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn append_now(storage: &InMemoryLogStorage, last_position: i64, data: &[u8]) -> u64 {
        storage
            .append(last_position, data.to_vec())
            .join()
            .unwrap()
    }

    #[test]
    fn test_append_assigns_increasing_indexes() {
        let storage = InMemoryLogStorage::new();
        assert_eq!(append_now(&storage, 1, b"a"), 0);
        assert_eq!(append_now(&storage, 2, b"b"), 1);
        assert_eq!(append_now(&storage, 5, b"c"), 2);
        assert_eq!(storage.block_count(), 3);
    }

    #[test]
    fn test_reader_sees_blocks_in_order() {
        let storage = InMemoryLogStorage::new();
        append_now(&storage, 1, b"a");
        append_now(&storage, 2, b"b");

        let mut reader = storage.open_reader();
        assert_eq!(reader.next_block().unwrap().unwrap().index, 0);
        assert_eq!(reader.next_block().unwrap().unwrap().index, 1);
        assert!(reader.next_block().unwrap().is_none());

        // A block appended later is picked up by the same reader.
        append_now(&storage, 3, b"c");
        assert_eq!(reader.next_block().unwrap().unwrap().index, 2);
    }

    #[test]
    fn test_seek_by_position() {
        let storage = InMemoryLogStorage::new();
        append_now(&storage, 5, b"a");
        append_now(&storage, 10, b"b");
        append_now(&storage, 15, b"c");

        let mut reader = storage.open_reader();
        reader.seek(11);
        assert_eq!(reader.next_block().unwrap().unwrap().last_position, 15);

        reader.seek(10);
        assert_eq!(reader.next_block().unwrap().unwrap().last_position, 10);

        // Past the end: nothing to read until something newer lands.
        reader.seek(100);
        assert!(reader.next_block().unwrap().is_none());
    }

    #[test]
    fn test_compact_drops_prefix() {
        let storage = InMemoryLogStorage::new();
        append_now(&storage, 5, b"a");
        append_now(&storage, 10, b"b");
        append_now(&storage, 15, b"c");

        storage.compact(10).unwrap();
        assert_eq!(storage.block_count(), 1);

        let mut reader = storage.open_reader();
        assert_eq!(reader.next_block().unwrap().unwrap().last_position, 15);
    }

    #[test]
    fn test_injected_failure() {
        let storage = InMemoryLogStorage::new();
        storage.fail_next_append();

        let result = storage.append(1, b"a".to_vec()).join();
        assert!(matches!(result, Err(LogStorageError::AppendFailed(_))));

        // Next append succeeds again.
        assert!(storage.append(1, b"a".to_vec()).join().is_ok());
    }
}
