//! The periodic snapshot director actor.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use millrace_core::{Actor, ActorCtx, ActorFuture, ActorHandle, JobResult};
use millrace_log::LogStream;

use super::metadata::SnapshotMetadata;
use super::store::{SnapshotStore, RETAINED_SNAPSHOTS};
use crate::processor::{ProcessorPositions, StreamProcessor};
use crate::state::StateDb;

/// Configuration for the snapshot director.
#[derive(Debug, Clone)]
pub struct SnapshotDirectorConfig {
    /// How often to consider taking a snapshot.
    pub interval: Duration,
    /// Replication term snapshots are tagged with, supplied by the
    /// installing layer.
    pub term: u64,
}

impl Default for SnapshotDirectorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            term: 0,
        }
    }
}

/// Periodically checkpoints processor state and publishes snapshots.
///
/// Each tick: skip if a snapshot is already in flight or the processor
/// has not advanced past the last published position; otherwise request a
/// point-in-time checkpoint on the processor's own actor (serialized with
/// record processing, without blocking this director), then tag, publish,
/// prune the predecessor, and signal log compaction up to the snapshot
/// position.
pub struct SnapshotDirector<S: StateDb> {
    name: String,
    config: SnapshotDirectorConfig,
    processor: ActorHandle<StreamProcessor<S>>,
    positions: Arc<ProcessorPositions>,
    store: Arc<SnapshotStore>,
    log: Arc<LogStream>,
    in_flight: bool,
    last_snapshot_position: i64,
    next_index: u64,
}

impl<S: StateDb> SnapshotDirector<S> {
    /// Creates a director for one partition's processor.
    #[must_use]
    pub fn new(
        config: SnapshotDirectorConfig,
        processor: ActorHandle<StreamProcessor<S>>,
        positions: Arc<ProcessorPositions>,
        store: Arc<SnapshotStore>,
        log: Arc<LogStream>,
    ) -> Self {
        let name = format!("snapshot-director-{}", log.partition_id());
        Self {
            name,
            config,
            processor,
            positions,
            store,
            log,
            in_flight: false,
            last_snapshot_position: -1,
            next_index: 1,
        }
    }

    fn tick(&mut self, ctx: &mut ActorCtx<'_, Self>) -> JobResult {
        if self.in_flight {
            return Ok(());
        }
        let position = self.positions.last_processed();
        if position < 0 || position <= self.last_snapshot_position {
            return Ok(());
        }

        let pending = match self
            .store
            .begin_pending(&format!("{}-{}", self.next_index, self.config.term))
        {
            Ok(pending) => pending,
            Err(error) => {
                tracing::error!(director = %self.name, %error, "cannot stage snapshot");
                return Ok(());
            }
        };

        // The checkpoint runs on the processor actor so the copy is
        // consistent with a record boundary; this director only waits on
        // the future.
        let checkpoint: ActorFuture<Result<i64, String>> = ActorFuture::new();
        let completer = checkpoint.clone();
        let dir = pending.clone();
        let submitted = self.processor.submit(move |processor, _ctx| {
            completer.complete(processor.checkpoint_into(&dir).map_err(|e| e.to_string()));
            Ok(())
        });
        if let Err(error) = submitted {
            tracing::warn!(director = %self.name, %error, "processor unavailable, skipping tick");
            Self::discard_pending(&pending);
            return Ok(());
        }

        self.in_flight = true;
        ctx.on_completion(&checkpoint, move |result, actor: &mut Self, _ctx| {
            actor.in_flight = false;
            match result {
                Ok(position) => actor.finish_snapshot(&pending, position),
                Err(message) => {
                    tracing::error!(director = %actor.name, %message, "checkpoint failed");
                    Self::discard_pending(&pending);
                }
            }
            Ok(())
        });
        Ok(())
    }

    fn finish_snapshot(&mut self, pending: &Path, position: i64) {
        let metadata = SnapshotMetadata::new(self.next_index, self.config.term, position);
        match self.store.publish(pending, &metadata) {
            Ok(snapshot) => {
                self.last_snapshot_position = position;
                self.next_index += 1;

                // Only after the new snapshot is durable may the old one
                // go and the log shrink.
                if let Err(error) = self.store.prune(RETAINED_SNAPSHOTS) {
                    tracing::warn!(director = %self.name, %error, "prune failed");
                }
                if let Err(error) = self.log.compact(position) {
                    tracing::warn!(director = %self.name, %error, "log compaction failed");
                }
                tracing::info!(
                    director = %self.name,
                    snapshot = %snapshot.metadata(),
                    "snapshot cycle complete"
                );
            }
            Err(error) => {
                tracing::error!(director = %self.name, %error, "snapshot publication failed");
                Self::discard_pending(pending);
            }
        }
    }

    fn discard_pending(pending: &Path) {
        if let Err(error) = std::fs::remove_dir_all(pending) {
            tracing::warn!(path = %pending.display(), %error, "failed to discard staging dir");
        }
    }
}

impl<S: StateDb> Actor for SnapshotDirector<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_start(&mut self, ctx: &mut ActorCtx<'_, Self>) -> JobResult {
        // Resume the index/position sequence from the published history.
        match self.store.latest() {
            Ok(Some(snapshot)) => {
                self.last_snapshot_position = snapshot.metadata().position;
                self.next_index = snapshot.metadata().index + 1;
            }
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(director = %self.name, %error, "could not read snapshot history");
            }
        }

        ctx.run_at_fixed_rate(self.config.interval, Self::tick);
        Ok(())
    }

    fn on_close(&mut self, _ctx: &mut ActorCtx<'_, Self>) {
        tracing::debug!(
            director = %self.name,
            last_snapshot_position = self.last_snapshot_position,
            "director closing"
        );
    }
}

impl<S: StateDb> std::fmt::Debug for SnapshotDirector<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotDirector")
            .field("name", &self.name)
            .field("in_flight", &self.in_flight)
            .field("last_snapshot_position", &self.last_snapshot_position)
            .field("next_index", &self.next_index)
            .finish_non_exhaustive()
    }
}
