//! Commit position watermark shared between appender, readers, and
//! observers.

use std::sync::atomic::{AtomicI64, Ordering};

use millrace_core::Condition;
use parking_lot::Mutex;

use crate::record::NO_VALUE;

/// Monotonically non-decreasing durability watermark of a partition.
///
/// Every record at a position less than or equal to the commit position is
/// durable and visible to every reader. Starts at -1 (nothing committed).
pub struct CommitPosition {
    value: AtomicI64,
    observers: Mutex<Vec<Condition>>,
}

impl Default for CommitPosition {
    fn default() -> Self {
        Self::new()
    }
}

impl CommitPosition {
    /// Creates a watermark with nothing committed.
    #[must_use]
    pub fn new() -> Self {
        Self {
            value: AtomicI64::new(NO_VALUE),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Returns the current commit position (-1 if nothing committed).
    #[must_use]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    /// Registers a condition signaled every time the watermark advances.
    pub fn register_observer(&self, condition: Condition) {
        self.observers.lock().push(condition);
    }

    /// Advances the watermark; positions never move backwards.
    ///
    /// Signals all registered observers if the watermark moved.
    pub fn advance(&self, position: i64) {
        let previous = self.value.fetch_max(position, Ordering::AcqRel);
        if position > previous {
            let mut observers = self.observers.lock();
            observers.retain(|condition| !condition.is_cancelled());
            for condition in observers.iter() {
                condition.signal();
            }
        }
    }
}

impl std::fmt::Debug for CommitPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitPosition")
            .field("value", &self.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_uncommitted() {
        let commit = CommitPosition::new();
        assert_eq!(commit.get(), NO_VALUE);
    }

    #[test]
    fn test_advance_is_monotonic() {
        let commit = CommitPosition::new();
        commit.advance(10);
        assert_eq!(commit.get(), 10);

        commit.advance(5);
        assert_eq!(commit.get(), 10);

        commit.advance(20);
        assert_eq!(commit.get(), 20);
    }
}
