//! The appender actor: exclusive writer of a partition's log storage.

use std::sync::Arc;

use millrace_core::{Actor, ActorCtx, ActorFault, JobResult};

use crate::commit::CommitPosition;
use crate::storage::LogStorage;
use crate::write_buffer::LogWriteBuffer;

/// Drains the write buffer in strict enqueue order and forwards blocks to
/// the durable-append primitive.
///
/// Exactly one appender may be active per partition; the owning
/// [`LogStream`](crate::LogStream) enforces that a prior appender is fully
/// closed before a new one is opened. At most one block append is in
/// flight at a time, so blocks reach storage in buffer order.
///
/// On append failure the appender is fail-stop: the in-flight block is
/// discarded, the buffer is marked failed (producers observe it on their
/// next write), and the actor transitions to `Failed`. Recovery is
/// operator- or failover-driven replay from the last snapshot.
pub(crate) struct Appender {
    name: String,
    buffer: Arc<LogWriteBuffer>,
    storage: Arc<dyn LogStorage>,
    commit: Arc<CommitPosition>,
    max_batch_bytes: usize,
    in_flight: bool,
    blocks_appended: u64,
}

impl Appender {
    pub(crate) fn new(
        partition_id: u32,
        buffer: Arc<LogWriteBuffer>,
        storage: Arc<dyn LogStorage>,
        commit: Arc<CommitPosition>,
        max_batch_bytes: usize,
    ) -> Self {
        Self {
            name: format!("appender-{partition_id}"),
            buffer,
            storage,
            commit,
            max_batch_bytes,
            in_flight: false,
            blocks_appended: 0,
        }
    }

    fn try_append(&mut self, ctx: &mut ActorCtx<'_, Self>) -> JobResult {
        if self.in_flight || self.buffer.is_failed() {
            return Ok(());
        }
        let Some(batch) = self.buffer.take_batch(self.max_batch_bytes) else {
            return Ok(());
        };

        self.in_flight = true;
        let last_position = batch.last_position;
        let record_count = batch.record_count;
        let future = self.storage.append(last_position, batch.data);

        ctx.on_completion(&future, move |result, actor: &mut Self, ctx| {
            actor.in_flight = false;
            match result {
                Ok(index) => {
                    actor.blocks_appended += 1;
                    tracing::trace!(
                        appender = %actor.name,
                        index,
                        last_position,
                        record_count,
                        "block durable"
                    );
                    actor.commit.advance(last_position);
                    // Keep draining until the buffer is empty.
                    if actor.buffer.has_pending() {
                        actor.try_append(ctx)?;
                    }
                    Ok(())
                }
                Err(error) => {
                    actor.buffer.mark_failed();
                    tracing::error!(
                        appender = %actor.name,
                        last_position,
                        record_count,
                        %error,
                        "append failed, write path is fail-stop"
                    );
                    Err(ActorFault::new(format!("append failed: {error}")))
                }
            }
        });
        Ok(())
    }
}

impl Actor for Appender {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_start(&mut self, ctx: &mut ActorCtx<'_, Self>) -> JobResult {
        let buffer = Arc::clone(&self.buffer);
        let condition = ctx.condition(
            "append-work",
            move || buffer.has_pending(),
            Self::try_append,
        );
        self.buffer.register_consumer(condition.clone());
        // Catch up with records buffered before this appender opened.
        condition.signal();
        Ok(())
    }

    fn on_close(&mut self, _ctx: &mut ActorCtx<'_, Self>) {
        tracing::debug!(
            appender = %self.name,
            blocks_appended = self.blocks_appended,
            commit_position = self.commit.get(),
            "appender closing"
        );
    }
}
