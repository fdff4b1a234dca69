//! # Millrace Engine
//!
//! The deterministic per-partition stream processor and its snapshot
//! lifecycle.
//!
//! This crate provides:
//! - **State contract**: transactional key-value access with a
//!   point-in-time checkpoint primitive ([`StateDb`])
//! - **Stream processor**: a single actor per partition folding committed
//!   records into state, exactly once, in log order
//! - **Snapshot lifecycle**: position-tagged, crash-atomic state copies
//!   published by a periodic director, enabling bounded recovery and log
//!   compaction
//!
//! ## Determinism
//!
//! All state mutation is confined to the processor actor, so ordering is
//! total. A record's state changes and its follow-up log writes commit as
//! one atomic unit; a handler error is fatal rather than skipping the
//! record, because every replica must apply an identical sequence.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod processor;
pub mod snapshot;
pub mod state;

pub use processor::{
    DispatchTable, DispatchTableBuilder, ProcessingContext, ProcessingError, ProcessorPositions,
    RecordHandler, StreamProcessor, StreamProcessorConfig,
};
pub use snapshot::{
    Snapshot, SnapshotDirector, SnapshotDirectorConfig, SnapshotMetadata, SnapshotStore,
    SnapshotStoreError,
};
pub use state::{InMemoryStateDb, StateDb, StateDbError, Transaction};
