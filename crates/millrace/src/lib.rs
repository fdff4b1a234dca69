//! # Millrace
//!
//! Runtime core of a distributed workflow/process engine: a per-partition
//! replicated append log, a deterministic single-writer stream processor,
//! a periodic snapshot lifecycle, a cooperative actor scheduler, and a
//! bounded memory pool.
//!
//! This crate re-exports the public API of the workspace:
//!
//! - [`sched`]: actor scheduler — actors, jobs, conditions, timers,
//!   futures
//! - [`pool`]: bounded memory pool for producer-side backpressure
//! - [`log`]: the per-partition append log — records, write buffer,
//!   appender, readers, storage contract
//! - [`engine`]: the stream processor and snapshot lifecycle
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use millrace::{
//!     ActorScheduler, DispatchTable, InMemoryLogStorage, InMemoryStateDb, LogStream,
//!     LogStreamConfig, RecordSpec, SchedulerConfig, SnapshotStore, StreamProcessor,
//!     StreamProcessorConfig,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let scheduler = ActorScheduler::new(SchedulerConfig::default())?;
//! let storage = Arc::new(InMemoryLogStorage::new());
//! let stream = Arc::new(LogStream::new(LogStreamConfig::default(), storage));
//! stream.open_appender(&scheduler)?;
//!
//! let snapshots = Arc::new(SnapshotStore::open(std::path::Path::new("/tmp/snapshots"))?);
//! let processor = StreamProcessor::new(
//!     StreamProcessorConfig::default(),
//!     InMemoryStateDb::new(),
//!     DispatchTable::builder().build(),
//!     &stream,
//!     snapshots,
//! );
//! let _handle = scheduler.spawn(processor)?;
//!
//! let writer = stream.new_writer();
//! writer.write(RecordSpec::command(1, 1, b"deploy".to_vec()))?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]

pub use millrace_core::{pool, sched};
pub use millrace_engine as engine;
pub use millrace_log as log;

pub use millrace_core::{
    Actor, ActorCtx, ActorFault, ActorFuture, ActorHandle, ActorScheduler, ActorState,
    BoundedMemoryPool, Condition, JobResult, MemoryPoolConfig, PoolError, PooledBlock, SchedError,
    SchedulerConfig,
};
pub use millrace_engine::{
    DispatchTable, InMemoryStateDb, ProcessingContext, ProcessingError, RecordHandler, Snapshot,
    SnapshotDirector, SnapshotDirectorConfig, SnapshotMetadata, SnapshotStore, StateDb,
    StreamProcessor, StreamProcessorConfig, Transaction,
};
pub use millrace_log::{
    CommitPosition, InMemoryLogStorage, LogStorage, LogStorageError, LogStream, LogStreamConfig,
    LogStreamError, LogStreamReader, LogStreamWriter, ReadError, Record, RecordSpec, RecordType,
    SegmentStorage, SegmentStorageConfig, StorageBlock, StorageReader, WriteError,
};
