//! # Stream Processor
//!
//! One actor per partition applying committed records to state, in order,
//! exactly once.
//!
//! ## Processing loop
//!
//! ```text
//! commit advance ──► condition ──► read record at P
//!                                      │
//!                           dispatch (type, value_type, intent)
//!                                      │
//!                    handler mutates txn + stages follow-ups
//!                                      │
//!                  follow-ups claimed in log buffer (all or nothing)
//!                                      │
//!                        txn commit (incl. positions)
//! ```
//!
//! The staged state writes and the follow-up log writes commit as one
//! atomic unit: if the log claim fails, the transaction rolls back and the
//! record is re-applied on a later wakeup. A handler error is fatal — the
//! actor transitions to `Failed` and the partition requires operator
//! intervention or failover-triggered restart, which replays from the
//! last snapshot.

use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fxhash::FxHashMap;
use millrace_core::{Actor, ActorCtx, ActorFault, JobResult};
use millrace_log::{
    CommitPosition, LogStream, LogStreamReader, LogStreamWriter, Record, RecordSpec, RecordType,
    WriteError,
};
use smallvec::SmallVec;

use crate::snapshot::SnapshotStore;
use crate::state::{
    decode_position, encode_position, keys, StateDb, StateDbError, Transaction,
};

/// Errors raised while applying records.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    /// A handler failed while applying a record. Fatal: records are never
    /// skipped, determinism requires every replica to apply the same
    /// sequence.
    #[error("handler failed at position {position}: {message}")]
    HandlerFailed {
        /// Position of the record being applied.
        position: i64,
        /// Handler error message.
        message: String,
    },

    /// A follow-up record could not be written and the failure is not
    /// transient backpressure.
    #[error("follow-up write failed at position {position}: {source}")]
    FollowUpWrite {
        /// Position of the record being applied.
        position: i64,
        /// The write error.
        #[source]
        source: WriteError,
    },

    /// The log could not be read.
    #[error("log read failed: {0}")]
    Read(String),

    /// The state store failed.
    #[error(transparent)]
    State(#[from] StateDbError),
}

/// Positions published by the processor for directors and diagnostics.
#[derive(Debug)]
pub struct ProcessorPositions {
    last_processed: AtomicI64,
    last_written: AtomicI64,
}

impl Default for ProcessorPositions {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessorPositions {
    /// Creates positions with nothing processed or written.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_processed: AtomicI64::new(-1),
            last_written: AtomicI64::new(-1),
        }
    }

    /// Position of the last record fully applied to state (-1 if none).
    #[must_use]
    pub fn last_processed(&self) -> i64 {
        self.last_processed.load(Ordering::Acquire)
    }

    /// Position of the last follow-up written to the log (-1 if none).
    #[must_use]
    pub fn last_written(&self) -> i64 {
        self.last_written.load(Ordering::Acquire)
    }

    fn set(&self, processed: i64, written: i64) {
        self.last_processed.store(processed, Ordering::Release);
        self.last_written.store(written, Ordering::Release);
    }
}

/// Context handed to a handler for one record.
///
/// Reads and writes go through the record's transaction; follow-up
/// records are staged and written to the log atomically with the state
/// commit.
pub struct ProcessingContext<'a, S: StateDb> {
    txn: Transaction<'a, S>,
    follow_ups: SmallVec<[RecordSpec; 4]>,
    position: i64,
}

impl<'a, S: StateDb> ProcessingContext<'a, S> {
    fn new(db: &'a mut S, position: i64) -> Self {
        Self {
            txn: Transaction::new(db),
            follow_ups: SmallVec::new(),
            position,
        }
    }

    /// Position of the record being applied.
    #[must_use]
    pub fn position(&self) -> i64 {
        self.position
    }

    /// Reads a value through the transaction.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.txn.get(key)
    }

    /// Stages a put in the transaction.
    pub fn put(&mut self, key: &[u8], value: Vec<u8>) {
        self.txn.put(key, value);
    }

    /// Stages a delete in the transaction.
    pub fn delete(&mut self, key: &[u8]) {
        self.txn.delete(key);
    }

    /// Stages a follow-up record.
    ///
    /// Its `source_position` is set to the position of the record being
    /// applied.
    pub fn stage_follow_up(&mut self, spec: RecordSpec) {
        self.follow_ups
            .push(spec.with_source_position(self.position));
    }
}

/// Handler applying records of one `(type, value_type, intent)` shape.
pub trait RecordHandler<S: StateDb>: Send + 'static {
    /// Applies one record: read/mutate state, stage follow-ups.
    ///
    /// # Errors
    ///
    /// Any error is fatal for the partition's processor.
    fn on_record(
        &mut self,
        record: &Record,
        ctx: &mut ProcessingContext<'_, S>,
    ) -> Result<(), ProcessingError>;
}

impl<S: StateDb, F> RecordHandler<S> for F
where
    F: FnMut(&Record, &mut ProcessingContext<'_, S>) -> Result<(), ProcessingError>
        + Send
        + 'static,
{
    fn on_record(
        &mut self,
        record: &Record,
        ctx: &mut ProcessingContext<'_, S>,
    ) -> Result<(), ProcessingError> {
        self(record, ctx)
    }
}

type HandlerKey = (RecordType, u16, u16);

/// Dispatch table keyed by `(record_type, value_type, intent)`.
///
/// Built once at registration time; lookup is a plain map access with no
/// ambient global state.
pub struct DispatchTable<S: StateDb> {
    handlers: FxHashMap<HandlerKey, Box<dyn RecordHandler<S>>>,
}

impl<S: StateDb> DispatchTable<S> {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> DispatchTableBuilder<S> {
        DispatchTableBuilder {
            handlers: FxHashMap::default(),
        }
    }

    /// Returns the number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true if no handlers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    fn get_mut(&mut self, key: &HandlerKey) -> Option<&mut Box<dyn RecordHandler<S>>> {
        self.handlers.get_mut(key)
    }
}

impl<S: StateDb> std::fmt::Debug for DispatchTable<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchTable")
            .field("handlers", &self.handlers.len())
            .finish_non_exhaustive()
    }
}

/// Builder registering handlers into a [`DispatchTable`].
pub struct DispatchTableBuilder<S: StateDb> {
    handlers: FxHashMap<HandlerKey, Box<dyn RecordHandler<S>>>,
}

impl<S: StateDb> DispatchTableBuilder<S> {
    /// Registers a handler for one `(record_type, value_type, intent)`
    /// combination, replacing any previous registration.
    #[must_use]
    pub fn on(
        mut self,
        record_type: RecordType,
        value_type: u16,
        intent: u16,
        handler: impl RecordHandler<S>,
    ) -> Self {
        self.handlers
            .insert((record_type, value_type, intent), Box::new(handler));
        self
    }

    /// Builds the table.
    #[must_use]
    pub fn build(self) -> DispatchTable<S> {
        DispatchTable {
            handlers: self.handlers,
        }
    }
}

/// Configuration for a stream processor.
#[derive(Debug, Clone)]
pub struct StreamProcessorConfig {
    /// Partition this processor serves.
    pub partition_id: u32,
    /// Maximum records applied per wakeup.
    pub batch_size: usize,
}

impl Default for StreamProcessorConfig {
    fn default() -> Self {
        Self {
            partition_id: 0,
            batch_size: 64,
        }
    }
}

type RecurringStateTask<S> =
    Box<dyn FnMut(&mut Transaction<'_, S>) -> Result<(), ProcessingError> + Send>;

enum ApplyOutcome {
    Applied,
    Backpressured,
}

/// The single-writer stream processor actor of one partition.
///
/// On open it loads the latest published snapshot and resumes log
/// consumption at `snapshot.position + 1`. All state mutation happens on
/// this actor; auxiliary recurring tasks run between records, never
/// concurrently with record processing.
pub struct StreamProcessor<S: StateDb> {
    name: String,
    config: StreamProcessorConfig,
    state: S,
    dispatch: DispatchTable<S>,
    reader: LogStreamReader,
    writer: LogStreamWriter,
    commit: Arc<CommitPosition>,
    positions: Arc<ProcessorPositions>,
    snapshots: Arc<SnapshotStore>,
    recurring: Vec<(Duration, RecurringStateTask<S>)>,
    /// Records at or below this position already have their follow-ups in
    /// the log; replay reapplies their state changes without re-emitting.
    replay_until: i64,
}

impl<S: StateDb> StreamProcessor<S> {
    /// Creates a processor over the given stream and snapshot store.
    #[must_use]
    pub fn new(
        config: StreamProcessorConfig,
        state: S,
        dispatch: DispatchTable<S>,
        stream: &LogStream,
        snapshots: Arc<SnapshotStore>,
    ) -> Self {
        Self {
            name: format!("stream-processor-{}", config.partition_id),
            config,
            state,
            dispatch,
            reader: stream.new_reader(),
            writer: stream.new_writer(),
            commit: stream.commit_watch(),
            positions: Arc::new(ProcessorPositions::new()),
            snapshots,
            recurring: Vec::new(),
            replay_until: -1,
        }
    }

    /// Registers an auxiliary task run at a fixed rate on this actor,
    /// e.g. time-to-live sweeps or timeout checks.
    ///
    /// The task runs inside its own state transaction, between records.
    #[must_use]
    pub fn with_recurring_task(
        mut self,
        interval: Duration,
        task: impl FnMut(&mut Transaction<'_, S>) -> Result<(), ProcessingError> + Send + 'static,
    ) -> Self {
        self.recurring.push((interval, Box::new(task)));
        self
    }

    /// Returns the shared position view (for the snapshot director).
    #[must_use]
    pub fn positions(&self) -> Arc<ProcessorPositions> {
        Arc::clone(&self.positions)
    }

    /// Checkpoints the state into `dir`, returning the position the copy
    /// corresponds to. Runs on the processor actor, so the copy is
    /// serialized with record processing.
    ///
    /// # Errors
    ///
    /// Returns a [`ProcessingError`] if the checkpoint cannot be written.
    pub fn checkpoint_into(&self, dir: &Path) -> Result<i64, ProcessingError> {
        self.state.checkpoint(dir)?;
        Ok(self.positions.last_processed())
    }

    fn recover(&mut self) -> Result<(), ProcessingError> {
        let mut resume_at = 0;
        let mut recovered = false;
        for snapshot in self.snapshots.all().unwrap_or_default() {
            match self.state.restore(snapshot.path()) {
                Ok(()) => {
                    let snapshot_position = snapshot.metadata().position;
                    let written =
                        decode_position(self.state.get(keys::LAST_WRITTEN_POSITION).as_deref());
                    self.positions.set(snapshot_position, written);
                    // Resume strictly after the snapshot position.
                    resume_at = snapshot_position + 1;
                    recovered = true;
                    tracing::info!(
                        processor = %self.name,
                        snapshot = %snapshot.metadata().dir_name(),
                        resume_at,
                        "recovered from snapshot"
                    );
                    break;
                }
                Err(error) => {
                    tracing::warn!(
                        processor = %self.name,
                        snapshot = %snapshot.metadata().dir_name(),
                        %error,
                        "snapshot restore failed, falling back"
                    );
                }
            }
        }
        if !recovered {
            tracing::info!(processor = %self.name, "no usable snapshot, starting from log head");
        }

        self.replay_until = self.scan_replay_until(resume_at)?;
        self.reader.seek(resume_at);
        Ok(())
    }

    /// Finds the highest source position among committed records: every
    /// record at or below it was fully processed before the restart, so
    /// replay must not re-emit its follow-ups.
    fn scan_replay_until(&mut self, from: i64) -> Result<i64, ProcessingError> {
        self.reader.seek(from);
        let mut replay_until = -1;
        loop {
            match self.reader.next() {
                Ok(Some(record)) => {
                    replay_until = replay_until.max(record.source_position);
                }
                Ok(None) => break,
                Err(error) => {
                    return Err(ProcessingError::Read(format!("replay scan failed: {error}")));
                }
            }
        }
        if replay_until >= 0 {
            tracing::info!(processor = %self.name, replay_until, "replaying without re-emission");
        }
        Ok(replay_until)
    }

    fn process_batch(&mut self, _ctx: &mut ActorCtx<'_, Self>) -> JobResult {
        let mut applied = 0;
        while applied < self.config.batch_size {
            let record = match self.reader.next() {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(error) => {
                    return Err(ActorFault::new(format!("log read failed: {error}")));
                }
            };

            // Records at or below the processed position were already
            // applied before the snapshot; every replica skips them
            // identically.
            if record.position <= self.positions.last_processed() {
                continue;
            }

            match self.apply_record(&record) {
                Ok(ApplyOutcome::Applied) => {
                    applied += 1;
                }
                Ok(ApplyOutcome::Backpressured) => {
                    // Rolled back; re-read the same record on a later
                    // wakeup once the appender has drained the buffer.
                    self.reader.seek(record.position);
                    break;
                }
                Err(error) => {
                    return Err(ActorFault::new(error.to_string()));
                }
            }
        }
        Ok(())
    }

    fn apply_record(&mut self, record: &Record) -> Result<ApplyOutcome, ProcessingError> {
        let key = (record.record_type, record.value_type, record.intent);
        let Some(handler) = self.dispatch.get_mut(&key) else {
            // No handler registered for this shape; skip deterministically
            // but still persist the position advance.
            let mut txn = Transaction::new(&mut self.state);
            txn.put(
                keys::LAST_PROCESSED_POSITION,
                encode_position(record.position),
            );
            txn.commit();
            self.positions
                .set(record.position, self.positions.last_written());
            tracing::trace!(
                position = record.position,
                value_type = record.value_type,
                intent = record.intent,
                "no handler registered, skipped"
            );
            return Ok(ApplyOutcome::Applied);
        };

        let mut ctx = ProcessingContext::new(&mut self.state, record.position);
        handler
            .on_record(record, &mut ctx)
            .map_err(|error| ProcessingError::HandlerFailed {
                position: record.position,
                message: error.to_string(),
            })?;

        let ProcessingContext {
            mut txn,
            follow_ups,
            ..
        } = ctx;

        // During replay the record's follow-ups are already in the log;
        // reapply state only, never re-emit.
        let replaying = record.position <= self.replay_until;

        // Claim all follow-ups in the log buffer as one unit; on
        // backpressure the transaction rolls back and nothing is visible.
        let mut last_written = self.positions.last_written();
        if !follow_ups.is_empty() && !replaying {
            match self.writer.write_batch(follow_ups.into_vec()) {
                Ok(Some(position)) => last_written = position,
                Ok(None) => {}
                Err(WriteError::BufferFull { .. }) => {
                    txn.rollback();
                    tracing::debug!(
                        position = record.position,
                        "follow-up write backpressured, will retry"
                    );
                    return Ok(ApplyOutcome::Backpressured);
                }
                Err(source) => {
                    txn.rollback();
                    return Err(ProcessingError::FollowUpWrite {
                        position: record.position,
                        source,
                    });
                }
            }
        }

        txn.put(
            keys::LAST_PROCESSED_POSITION,
            encode_position(record.position),
        );
        txn.put(keys::LAST_WRITTEN_POSITION, encode_position(last_written));
        txn.commit();
        self.positions.set(record.position, last_written);
        Ok(ApplyOutcome::Applied)
    }

    fn run_recurring(&mut self, index: usize) -> JobResult {
        let Some((_, task)) = self.recurring.get_mut(index) else {
            return Ok(());
        };
        let mut txn = Transaction::new(&mut self.state);
        match task(&mut txn) {
            Ok(()) => {
                txn.commit();
                Ok(())
            }
            Err(error) => {
                txn.rollback();
                Err(ActorFault::new(format!("recurring task failed: {error}")))
            }
        }
    }
}

impl<S: StateDb> Actor for StreamProcessor<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_start(&mut self, ctx: &mut ActorCtx<'_, Self>) -> JobResult {
        self.recover()
            .map_err(|error| ActorFault::new(error.to_string()))?;

        let commit = Arc::clone(&self.commit);
        let positions = Arc::clone(&self.positions);
        let condition = ctx.condition(
            "process-records",
            move || commit.get() > positions.last_processed(),
            Self::process_batch,
        );
        self.commit.register_observer(condition.clone());
        // Catch up with records committed before this processor opened.
        condition.signal();

        let intervals: Vec<Duration> = self
            .recurring
            .iter()
            .map(|(interval, _)| *interval)
            .collect();
        for (index, interval) in intervals.into_iter().enumerate() {
            ctx.run_at_fixed_rate(interval, move |actor: &mut Self, _ctx| {
                actor.run_recurring(index)
            });
        }
        Ok(())
    }

    fn on_close(&mut self, _ctx: &mut ActorCtx<'_, Self>) {
        tracing::info!(
            processor = %self.name,
            last_processed = self.positions.last_processed(),
            last_written = self.positions.last_written(),
            "processor closing"
        );
    }
}

impl<S: StateDb> std::fmt::Debug for StreamProcessor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamProcessor")
            .field("name", &self.name)
            .field("last_processed", &self.positions.last_processed())
            .field("last_written", &self.positions.last_written())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::InMemoryStateDb;

    fn counting_handler(
        record: &Record,
        ctx: &mut ProcessingContext<'_, InMemoryStateDb>,
    ) -> Result<(), ProcessingError> {
        let count = ctx
            .get(b"count")
            .and_then(|v| <[u8; 8]>::try_from(v.as_slice()).ok())
            .map_or(0u64, u64::from_le_bytes);
        ctx.put(b"count", (count + 1).to_le_bytes().to_vec());
        ctx.put(record.payload.as_slice(), vec![1]);
        Ok(())
    }

    #[test]
    fn test_dispatch_table_registration() {
        let table = DispatchTable::<InMemoryStateDb>::builder()
            .on(RecordType::Command, 1, 1, counting_handler)
            .on(RecordType::Command, 1, 2, counting_handler)
            .build();
        assert_eq!(table.len(), 2);
        assert!(!table.is_empty());
    }

    #[test]
    fn test_dispatch_replaces_duplicate_registration() {
        let table = DispatchTable::<InMemoryStateDb>::builder()
            .on(RecordType::Command, 1, 1, counting_handler)
            .on(RecordType::Command, 1, 1, counting_handler)
            .build();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_processing_context_stages_follow_ups() {
        let mut db = InMemoryStateDb::new();
        let mut ctx = ProcessingContext::new(&mut db, 7);

        ctx.put(b"k", b"v".to_vec());
        ctx.stage_follow_up(RecordSpec::event(1, 1, vec![]));
        assert_eq!(ctx.position(), 7);
        assert_eq!(ctx.follow_ups.len(), 1);
        assert_eq!(ctx.follow_ups[0].source_position, 7);
    }

    #[test]
    fn test_positions_default() {
        let positions = ProcessorPositions::new();
        assert_eq!(positions.last_processed(), -1);
        assert_eq!(positions.last_written(), -1);
    }
}
