//! Bounded in-memory write buffer between producers and the appender.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use millrace_core::Condition;
use parking_lot::Mutex;

use crate::frame::{encode_record, FrameError};
use crate::record::RecordSpec;

/// Errors producers observe when writing to the log stream.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    /// The buffer has no room; the producer must back off and retry.
    #[error("write buffer full: {used} of {capacity} bytes in use")]
    BufferFull {
        /// Bytes currently buffered.
        used: usize,
        /// Buffer capacity in bytes.
        capacity: usize,
    },

    /// The write path failed; no further writes are accepted.
    #[error("log stream write path failed")]
    Failed,

    /// The record could not be framed.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

pub(crate) struct BufferedEntry {
    pub(crate) position: i64,
    pub(crate) framed: Vec<u8>,
    /// False for all but the last record of an atomic batch; the appender
    /// never ends a block inside a batch, so a batch is durable as a
    /// unit.
    pub(crate) group_end: bool,
}

struct BufferInner {
    entries: VecDeque<BufferedEntry>,
    used_bytes: usize,
    next_position: i64,
}

/// Bounded queue of framed records awaiting the appender.
///
/// Producers claim positions and enqueue under one lock, so positions are
/// strictly increasing in enqueue order. The appender drains entries in
/// that same order. Consumer conditions registered by the appender are
/// signaled on every claim.
pub(crate) struct LogWriteBuffer {
    inner: Mutex<BufferInner>,
    consumers: Mutex<Vec<Condition>>,
    capacity_bytes: usize,
    failed: AtomicBool,
}

impl LogWriteBuffer {
    pub(crate) fn new(capacity_bytes: usize, first_position: i64) -> Self {
        Self {
            inner: Mutex::new(BufferInner {
                entries: VecDeque::new(),
                used_bytes: 0,
                next_position: first_position,
            }),
            consumers: Mutex::new(Vec::new()),
            capacity_bytes,
            failed: AtomicBool::new(false),
        }
    }

    /// Registers a consumer condition signaled whenever a record lands.
    pub(crate) fn register_consumer(&self, condition: Condition) {
        self.consumers.lock().push(condition);
    }

    fn signal_consumers(&self) {
        let mut consumers = self.consumers.lock();
        consumers.retain(|condition| !condition.is_cancelled());
        for condition in consumers.iter() {
            condition.signal();
        }
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.inner.lock().entries.is_empty()
    }

    pub(crate) fn next_position(&self) -> i64 {
        self.inner.lock().next_position
    }

    /// Frames the record, assigns the next position, and enqueues it.
    pub(crate) fn claim(&self, spec: RecordSpec) -> Result<i64, WriteError> {
        if self.is_failed() {
            return Err(WriteError::Failed);
        }

        let mut inner = self.inner.lock();
        let position = inner.next_position;
        let framed = encode_record(&spec.into_record(position))?;

        if inner.used_bytes + framed.len() > self.capacity_bytes {
            return Err(WriteError::BufferFull {
                used: inner.used_bytes,
                capacity: self.capacity_bytes,
            });
        }

        inner.used_bytes += framed.len();
        inner.next_position += 1;
        inner.entries.push_back(BufferedEntry {
            position,
            framed,
            group_end: true,
        });
        drop(inner);

        self.signal_consumers();
        Ok(position)
    }

    /// Frames and enqueues all records, or none of them.
    ///
    /// Capacity is checked for the whole batch before anything is
    /// enqueued, so callers can treat the batch as one atomic unit.
    /// Returns the position of the last record (`None` for an empty
    /// batch).
    pub(crate) fn claim_all(&self, specs: Vec<RecordSpec>) -> Result<Option<i64>, WriteError> {
        if specs.is_empty() {
            return Ok(None);
        }
        if self.is_failed() {
            return Err(WriteError::Failed);
        }

        let mut inner = self.inner.lock();
        let mut staged = Vec::with_capacity(specs.len());
        let mut position = inner.next_position;
        let mut total_bytes = 0;
        let last = specs.len() - 1;
        for (offset, spec) in specs.into_iter().enumerate() {
            let framed = encode_record(&spec.into_record(position))?;
            total_bytes += framed.len();
            staged.push(BufferedEntry {
                position,
                framed,
                group_end: offset == last,
            });
            position += 1;
        }

        if inner.used_bytes + total_bytes > self.capacity_bytes {
            return Err(WriteError::BufferFull {
                used: inner.used_bytes,
                capacity: self.capacity_bytes,
            });
        }

        let last_position = position - 1;
        inner.used_bytes += total_bytes;
        inner.next_position = position;
        inner.entries.extend(staged);
        drop(inner);

        self.signal_consumers();
        Ok(Some(last_position))
    }

    /// Takes a batch of entries in enqueue order, up to `max_bytes`.
    ///
    /// At least one entry is taken if any is pending, so an oversized
    /// single record still drains.
    pub(crate) fn take_batch(&self, max_bytes: usize) -> Option<AppendBatch> {
        let mut inner = self.inner.lock();
        if inner.entries.is_empty() {
            return None;
        }

        let mut data = Vec::new();
        let mut last_position = 0;
        let mut count = 0;
        let mut mid_group = false;
        loop {
            let fits = match inner.entries.front() {
                None => break,
                Some(front) => {
                    // Never end a block inside an atomic batch.
                    mid_group || count == 0 || data.len() + front.framed.len() <= max_bytes
                }
            };
            if !fits {
                break;
            }
            let Some(entry) = inner.entries.pop_front() else {
                break;
            };
            inner.used_bytes -= entry.framed.len();
            data.extend_from_slice(&entry.framed);
            last_position = entry.position;
            mid_group = !entry.group_end;
            count += 1;
        }

        Some(AppendBatch {
            last_position,
            record_count: count,
            data,
        })
    }
}

/// One in-flight append: concatenated frames plus the final position.
pub(crate) struct AppendBatch {
    pub(crate) last_position: i64,
    pub(crate) record_count: usize,
    pub(crate) data: Vec<u8>,
}

/// Producer-side handle for writing records to a partition's log.
///
/// Writers never block; a full buffer surfaces as
/// [`WriteError::BufferFull`] so producers can apply their own
/// backpressure (typically via the bounded memory pool).
#[derive(Clone)]
pub struct LogStreamWriter {
    buffer: Arc<LogWriteBuffer>,
}

impl LogStreamWriter {
    pub(crate) fn new(buffer: Arc<LogWriteBuffer>) -> Self {
        Self { buffer }
    }

    /// Enqueues a record, returning its assigned position.
    ///
    /// The record becomes visible to readers only once the appender has
    /// made it durable and the commit position has advanced past it.
    ///
    /// # Errors
    ///
    /// [`WriteError::BufferFull`] when the buffer is at capacity;
    /// [`WriteError::Failed`] once the write path has failed.
    pub fn write(&self, spec: RecordSpec) -> Result<i64, WriteError> {
        self.buffer.claim(spec)
    }

    /// Enqueues all records as one atomic unit, or none of them.
    ///
    /// Returns the position of the last record (`None` for an empty
    /// batch). Used by the stream processor so a record's follow-ups are
    /// either all staged or all rejected.
    ///
    /// # Errors
    ///
    /// [`WriteError::BufferFull`] when the whole batch does not fit;
    /// [`WriteError::Failed`] once the write path has failed.
    pub fn write_batch(&self, specs: Vec<RecordSpec>) -> Result<Option<i64>, WriteError> {
        self.buffer.claim_all(specs)
    }

    /// Returns true once the write path has failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.buffer.is_failed()
    }
}

impl std::fmt::Debug for LogStreamWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStreamWriter")
            .field("failed", &self.is_failed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordSpec;

    fn spec(payload: &[u8]) -> RecordSpec {
        RecordSpec::command(1, 1, payload.to_vec())
    }

    #[test]
    fn test_claim_assigns_sequential_positions() {
        let buffer = LogWriteBuffer::new(1024 * 1024, 0);
        assert_eq!(buffer.claim(spec(b"a")).unwrap(), 0);
        assert_eq!(buffer.claim(spec(b"b")).unwrap(), 1);
        assert_eq!(buffer.claim(spec(b"c")).unwrap(), 2);
        assert_eq!(buffer.next_position(), 3);
    }

    #[test]
    fn test_buffer_full_backpressure() {
        let buffer = LogWriteBuffer::new(200, 0);
        buffer.claim(spec(b"x")).unwrap();

        let mut rejected = false;
        for _ in 0..16 {
            if matches!(buffer.claim(spec(b"x")), Err(WriteError::BufferFull { .. })) {
                rejected = true;
                break;
            }
        }
        assert!(rejected);

        // Draining frees capacity for new claims.
        let _ = buffer.take_batch(usize::MAX).unwrap();
        assert!(buffer.claim(spec(b"x")).is_ok());
    }

    #[test]
    fn test_take_batch_in_enqueue_order() {
        let buffer = LogWriteBuffer::new(1024 * 1024, 10);
        for payload in [b"a", b"b", b"c"] {
            buffer.claim(spec(payload)).unwrap();
        }

        let batch = buffer.take_batch(usize::MAX).unwrap();
        assert_eq!(batch.record_count, 3);
        assert_eq!(batch.last_position, 12);
        assert!(!buffer.has_pending());
    }

    #[test]
    fn test_take_batch_respects_byte_limit() {
        let buffer = LogWriteBuffer::new(1024 * 1024, 0);
        for _ in 0..4 {
            buffer.claim(spec(&[0u8; 100])).unwrap();
        }

        // A limit below one frame still drains a single entry.
        let batch = buffer.take_batch(10).unwrap();
        assert_eq!(batch.record_count, 1);
        assert!(buffer.has_pending());
    }

    #[test]
    fn test_failed_buffer_rejects_writes() {
        let buffer = LogWriteBuffer::new(1024, 0);
        buffer.mark_failed();
        assert!(matches!(buffer.claim(spec(b"a")), Err(WriteError::Failed)));
    }

    #[test]
    fn test_empty_take_batch() {
        let buffer = LogWriteBuffer::new(1024, 0);
        assert!(buffer.take_batch(usize::MAX).is_none());
    }

    #[test]
    fn test_claim_all_is_atomic() {
        let buffer = LogWriteBuffer::new(100, 0);

        // A batch that does not fit leaves the buffer untouched.
        let specs = vec![spec(&[0u8; 40]), spec(&[0u8; 40])];
        assert!(matches!(
            buffer.claim_all(specs),
            Err(WriteError::BufferFull { .. })
        ));
        assert!(!buffer.has_pending());
        assert_eq!(buffer.next_position(), 0);

        // A fitting batch claims consecutive positions.
        let buffer = LogWriteBuffer::new(1024 * 1024, 0);
        let specs = vec![spec(b"a"), spec(b"b"), spec(b"c")];
        assert_eq!(buffer.claim_all(specs).unwrap(), Some(2));
        assert_eq!(buffer.next_position(), 3);
    }

    #[test]
    fn test_claim_all_empty() {
        let buffer = LogWriteBuffer::new(1024, 0);
        assert_eq!(buffer.claim_all(Vec::new()).unwrap(), None);
    }

    #[test]
    fn test_take_batch_never_splits_atomic_batch() {
        let buffer = LogWriteBuffer::new(1024 * 1024, 0);
        buffer
            .claim_all(vec![spec(&[0u8; 100]), spec(&[0u8; 100]), spec(&[0u8; 100])])
            .unwrap();

        // A one-byte limit still drains the whole batch as one block.
        let batch = buffer.take_batch(1).unwrap();
        assert_eq!(batch.record_count, 3);
        assert!(!buffer.has_pending());
    }
}
