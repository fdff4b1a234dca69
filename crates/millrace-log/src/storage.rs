//! Durable-append contract provided by the replication layer.

use millrace_core::ActorFuture;

/// Errors from the durable-append primitive.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LogStorageError {
    /// The append could not be made durable.
    #[error("append failed: {0}")]
    AppendFailed(String),

    /// An I/O error while reading or compacting.
    #[error("storage I/O error: {0}")]
    Io(String),

    /// The storage is closed.
    #[error("storage is closed")]
    Closed,
}

/// One durable block as handed back by a storage reader.
///
/// A block holds one or more concatenated record frames; `last_position`
/// is the stream position of the final record in the block.
#[derive(Debug, Clone)]
pub struct StorageBlock {
    /// Storage index assigned at append time.
    pub index: u64,
    /// Position of the last record in the block.
    pub last_position: i64,
    /// Concatenated record frames.
    pub data: Vec<u8>,
}

/// Sequential, seekable reader over durable blocks.
pub trait StorageReader: Send {
    /// Positions the reader at the first block whose `last_position` is
    /// greater than or equal to `position`.
    fn seek(&mut self, position: i64);

    /// Returns the next block, or `None` past the end of the log.
    ///
    /// # Errors
    ///
    /// Returns a [`LogStorageError`] if the block cannot be read.
    fn next_block(&mut self) -> Result<Option<StorageBlock>, LogStorageError>;
}

/// The durable append log this core builds on.
///
/// Ordering, durability, and replication are guaranteed by the surrounding
/// consensus layer, not by this contract. The returned future completes
/// once the block is durable to whatever degree that layer provides; the
/// commit position must only advance after it does.
pub trait LogStorage: Send + Sync + 'static {
    /// Appends a block of framed records, completing with the assigned
    /// storage index once the block is durable.
    fn append(&self, last_position: i64, block: Vec<u8>)
        -> ActorFuture<Result<u64, LogStorageError>>;

    /// Allows the storage to discard all blocks whose `last_position` is
    /// less than or equal to `up_to_position`.
    ///
    /// # Errors
    ///
    /// Returns a [`LogStorageError`] if compaction fails.
    fn compact(&self, up_to_position: i64) -> Result<(), LogStorageError>;

    /// Opens an independent reader positioned at the start of the log.
    fn open_reader(&self) -> Box<dyn StorageReader>;

    /// Position of the last durable record, or `None` for an empty log.
    ///
    /// The log stream recovers its commit position and position counter
    /// from this on open.
    fn last_durable_position(&self) -> Option<i64>;
}
