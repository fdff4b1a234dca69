//! Fixed-rate timer wheel shared by all actors of a scheduler.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::Wake;

/// Shared slot between a recurring timer registration and its actor.
///
/// The timer thread sets `due`; the owning actor clears it when the timer
/// job runs. Cancelled slots are dropped when they surface at the top of
/// the deadline heap.
pub(crate) struct TimerSlot {
    pub(crate) due: AtomicBool,
    pub(crate) cancelled: AtomicBool,
    pub(crate) interval: Duration,
}

impl TimerSlot {
    pub(crate) fn new(interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            due: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            interval,
        })
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

struct TimerEntry {
    deadline: Instant,
    slot: Arc<TimerSlot>,
    target: Weak<dyn Wake>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for TimerEntry {}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse ordering for min-heap behavior (earliest first)
        other.deadline.cmp(&self.deadline)
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Deadline-ordered registry of recurring timers.
///
/// Driven by a dedicated timer thread; recurrence is best-effort — a
/// missed tick is not made up, the next deadline is re-anchored to now.
pub(crate) struct TimerWheel {
    entries: Mutex<BinaryHeap<TimerEntry>>,
    tick: Condvar,
    shutdown: AtomicBool,
}

impl TimerWheel {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(BinaryHeap::new()),
            tick: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    pub(crate) fn register(&self, slot: Arc<TimerSlot>, target: Weak<dyn Wake>) {
        let deadline = Instant::now() + slot.interval;
        self.entries.lock().push(TimerEntry {
            deadline,
            slot,
            target,
        });
        self.tick.notify_one();
    }

    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.tick.notify_all();
    }

    /// Timer thread main loop: fire due slots and re-arm them.
    pub(crate) fn run(&self) {
        let mut entries = self.entries.lock();
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }

            let now = Instant::now();
            let next_deadline = entries.peek().map(|head| head.deadline);
            match next_deadline {
                None => {
                    self.tick.wait(&mut entries);
                }
                Some(deadline) if deadline > now => {
                    self.tick.wait_until(&mut entries, deadline);
                }
                Some(_) => {
                    let Some(entry) = entries.pop() else {
                        continue;
                    };
                    if entry.slot.cancelled.load(Ordering::Acquire) {
                        continue;
                    }
                    let Some(target) = entry.target.upgrade() else {
                        continue;
                    };

                    entry.slot.due.store(true, Ordering::Release);

                    // Fixed-rate re-arm; if we fell behind, anchor to now.
                    let mut next = entry.deadline + entry.slot.interval;
                    if next <= now {
                        next = now + entry.slot.interval;
                    }
                    entries.push(TimerEntry {
                        deadline: next,
                        slot: entry.slot,
                        target: entry.target,
                    });

                    drop(entries);
                    target.wake();
                    entries = self.entries.lock();
                }
            }
        }
    }
}
