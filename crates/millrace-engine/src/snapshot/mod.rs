//! # Snapshot Lifecycle
//!
//! Durable, position-tagged copies of processor state, bounding recovery
//! time and enabling log compaction.
//!
//! ## Disk Layout
//!
//! ```text
//! {root}/
//!   1-0-1722450000000-99/      # {index}-{term}-{timestamp}-{position}
//!     manifest.json            # SnapshotMetadata as pretty-printed JSON
//!     state.bin                # state engine's point-in-time copy
//!   2-0-1722450300000-204/
//!     ...
//!   pending/                   # in-flight copies, never loaded
//! ```
//!
//! A snapshot is written into `pending/`, fsynced, and atomically renamed
//! into place; the parent directory is then fsynced so publication
//! survives a crash. The previous snapshot is deleted only after the new
//! one is durable, and the last two snapshots are retained so recovery
//! can fall back if the latest fails verification.

mod director;
mod metadata;
mod store;

pub use director::{SnapshotDirector, SnapshotDirectorConfig};
pub use metadata::SnapshotMetadata;
pub use store::{Snapshot, SnapshotStore, SnapshotStoreError};
