//! The per-partition log stream: write buffer, appender ownership, commit
//! position, readers.

use std::sync::Arc;

use millrace_core::{
    ActorFuture, ActorHandle, ActorScheduler, ActorState, Condition, SchedError,
};
use parking_lot::Mutex;

use crate::appender::Appender;
use crate::commit::CommitPosition;
use crate::reader::LogStreamReader;
use crate::storage::{LogStorage, LogStorageError};
use crate::write_buffer::{LogStreamWriter, LogWriteBuffer};

/// Errors from log stream lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum LogStreamError {
    /// An appender is already active for this partition.
    #[error("partition {partition_id} already has an active appender")]
    AppenderAlreadyOpen {
        /// The partition id.
        partition_id: u32,
    },

    /// No appender is currently open.
    #[error("partition {partition_id} has no open appender")]
    NoAppender {
        /// The partition id.
        partition_id: u32,
    },

    /// The scheduler refused to host the appender.
    #[error(transparent)]
    Sched(#[from] SchedError),

    /// Storage failed.
    #[error(transparent)]
    Storage(#[from] LogStorageError),
}

/// Configuration for a log stream.
#[derive(Debug, Clone)]
pub struct LogStreamConfig {
    /// Partition this stream belongs to.
    pub partition_id: u32,
    /// Write buffer capacity in bytes.
    pub write_buffer_bytes: usize,
    /// Maximum bytes per block handed to the storage in one append.
    pub max_append_batch_bytes: usize,
    /// Position assigned to the first record.
    pub initial_position: i64,
}

impl Default for LogStreamConfig {
    fn default() -> Self {
        Self {
            partition_id: 0,
            write_buffer_bytes: 4 * 1024 * 1024, // 4 MiB
            max_append_batch_bytes: 128 * 1024,  // 128 KiB
            initial_position: 0,
        }
    }
}

impl LogStreamConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> LogStreamConfigBuilder {
        LogStreamConfigBuilder::default()
    }
}

/// Builder for [`LogStreamConfig`].
#[derive(Debug, Default)]
pub struct LogStreamConfigBuilder {
    partition_id: Option<u32>,
    write_buffer_bytes: Option<usize>,
    max_append_batch_bytes: Option<usize>,
    initial_position: Option<i64>,
}

impl LogStreamConfigBuilder {
    /// Sets the partition id.
    #[must_use]
    pub fn partition_id(mut self, partition_id: u32) -> Self {
        self.partition_id = Some(partition_id);
        self
    }

    /// Sets the write buffer capacity in bytes.
    #[must_use]
    pub fn write_buffer_bytes(mut self, bytes: usize) -> Self {
        self.write_buffer_bytes = Some(bytes);
        self
    }

    /// Sets the maximum append block size in bytes.
    #[must_use]
    pub fn max_append_batch_bytes(mut self, bytes: usize) -> Self {
        self.max_append_batch_bytes = Some(bytes);
        self
    }

    /// Sets the position assigned to the first record.
    #[must_use]
    pub fn initial_position(mut self, position: i64) -> Self {
        self.initial_position = Some(position);
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> LogStreamConfig {
        let defaults = LogStreamConfig::default();
        LogStreamConfig {
            partition_id: self.partition_id.unwrap_or(defaults.partition_id),
            write_buffer_bytes: self
                .write_buffer_bytes
                .unwrap_or(defaults.write_buffer_bytes),
            max_append_batch_bytes: self
                .max_append_batch_bytes
                .unwrap_or(defaults.max_append_batch_bytes),
            initial_position: self.initial_position.unwrap_or(defaults.initial_position),
        }
    }
}

/// Ordered, durable, per-partition record stream.
///
/// Owns the write buffer and the (at most one) appender actor; the commit
/// position survives appender close and reopen, as does the position
/// counter, so a reopened appender resumes seamlessly.
pub struct LogStream {
    config: LogStreamConfig,
    storage: Arc<dyn LogStorage>,
    buffer: Arc<LogWriteBuffer>,
    commit: Arc<CommitPosition>,
    appender: Mutex<Option<ActorHandle<Appender>>>,
}

impl LogStream {
    /// Creates a log stream over the given storage.
    ///
    /// The commit position and the position counter are recovered from the
    /// storage's durable tail; `initial_position` only applies to an empty
    /// log.
    #[must_use]
    pub fn new(config: LogStreamConfig, storage: Arc<dyn LogStorage>) -> Self {
        let recovered = storage.last_durable_position();
        let first_position = recovered.map_or(config.initial_position, |p| p + 1);
        let buffer = Arc::new(LogWriteBuffer::new(
            config.write_buffer_bytes,
            first_position,
        ));
        let commit = Arc::new(CommitPosition::new());
        if let Some(position) = recovered {
            commit.advance(position);
            tracing::info!(
                partition = config.partition_id,
                commit_position = position,
                "recovered commit position from storage"
            );
        }
        Self {
            config,
            storage,
            buffer,
            commit,
            appender: Mutex::new(None),
        }
    }

    /// Returns the partition id.
    #[must_use]
    pub fn partition_id(&self) -> u32 {
        self.config.partition_id
    }

    /// Returns the current commit position (-1 if nothing committed).
    #[must_use]
    pub fn commit_position(&self) -> i64 {
        self.commit.get()
    }

    /// Registers a condition signaled whenever the commit position
    /// advances.
    pub fn register_commit_listener(&self, condition: Condition) {
        self.commit.register_observer(condition);
    }

    /// Returns a shared handle to the commit watermark, for consumers that
    /// poll it from wakeup predicates.
    #[must_use]
    pub fn commit_watch(&self) -> Arc<CommitPosition> {
        Arc::clone(&self.commit)
    }

    /// Spawns the appender actor for this partition.
    ///
    /// # Errors
    ///
    /// Returns [`LogStreamError::AppenderAlreadyOpen`] if a previous
    /// appender has not fully closed, or a scheduler error if it cannot be
    /// hosted.
    pub fn open_appender(&self, scheduler: &ActorScheduler) -> Result<(), LogStreamError> {
        let mut slot = self.appender.lock();
        if let Some(handle) = slot.as_ref() {
            if !handle.state().is_terminal() {
                return Err(LogStreamError::AppenderAlreadyOpen {
                    partition_id: self.config.partition_id,
                });
            }
        }

        let appender = Appender::new(
            self.config.partition_id,
            Arc::clone(&self.buffer),
            Arc::clone(&self.storage),
            Arc::clone(&self.commit),
            self.config.max_append_batch_bytes,
        );
        let handle = scheduler.spawn(appender)?;
        *slot = Some(handle);
        tracing::info!(partition = self.config.partition_id, "appender opened");
        Ok(())
    }

    /// Requests the appender to close, returning a future that completes
    /// once it has fully closed.
    ///
    /// The commit position and position counter are unaffected; a new
    /// appender may be opened afterwards and resumes where this one
    /// stopped.
    ///
    /// # Errors
    ///
    /// Returns [`LogStreamError::NoAppender`] if none is open.
    pub fn close_appender(&self) -> Result<ActorFuture<()>, LogStreamError> {
        let slot = self.appender.lock();
        let Some(handle) = slot.as_ref() else {
            return Err(LogStreamError::NoAppender {
                partition_id: self.config.partition_id,
            });
        };
        tracing::info!(partition = self.config.partition_id, "appender closing");
        Ok(handle.close())
    }

    /// Returns the appender's lifecycle state, if one was ever opened.
    #[must_use]
    pub fn appender_state(&self) -> Option<ActorState> {
        self.appender.lock().as_ref().map(ActorHandle::state)
    }

    /// Creates a producer handle.
    ///
    /// Writers enqueue into the shared write buffer; records written while
    /// no appender is open are drained once one opens.
    #[must_use]
    pub fn new_writer(&self) -> LogStreamWriter {
        LogStreamWriter::new(Arc::clone(&self.buffer))
    }

    /// Creates an independent reader positioned at the log start.
    #[must_use]
    pub fn new_reader(&self) -> LogStreamReader {
        LogStreamReader::new(self.storage.open_reader(), Arc::clone(&self.commit))
    }

    /// Allows the storage to discard records up to `position` (typically
    /// the latest snapshot position).
    ///
    /// # Errors
    ///
    /// Returns a storage error if compaction fails.
    pub fn compact(&self, position: i64) -> Result<(), LogStreamError> {
        tracing::info!(
            partition = self.config.partition_id,
            position,
            "compacting log prefix"
        );
        self.storage.compact(position)?;
        Ok(())
    }
}

impl std::fmt::Debug for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStream")
            .field("partition_id", &self.config.partition_id)
            .field("commit_position", &self.commit_position())
            .field("appender_state", &self.appender_state())
            .finish_non_exhaustive()
    }
}
