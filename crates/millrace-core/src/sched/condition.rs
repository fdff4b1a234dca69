//! Counted, coalescing wakeup conditions.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Wakeup target a condition signals into.
///
/// Implemented by actor tasks; `wake` enqueues the task on the scheduler
/// if it is not already scheduled.
pub(crate) trait Wake: Send + Sync {
    fn wake(&self);
}

pub(crate) struct ConditionInner {
    name: String,
    /// Incremented on every signal, from any thread.
    trigger_count: AtomicU64,
    /// Advanced by the owning actor as trigger bursts are consumed.
    /// Written only while the owner runs, so a plain store suffices.
    processed_count: AtomicU64,
    cancelled: AtomicBool,
    waker: Mutex<Option<Weak<dyn Wake>>>,
}

/// A counted, coalescing wakeup source owned by one actor.
///
/// A condition couples a monotonically incremented trigger counter with an
/// explicit "has pending work" predicate supplied at registration.
/// Polling reports ready when the counter has advanced past the last
/// processed value OR the predicate holds, which coalesces bursts of
/// signals without losing any and is safe against races between signaling
/// and polling.
///
/// Cloning yields another handle to the same condition; `signal` may be
/// called from any thread.
#[derive(Clone)]
pub struct Condition {
    inner: Arc<ConditionInner>,
}

impl Condition {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(ConditionInner {
                name: name.to_string(),
                trigger_count: AtomicU64::new(0),
                processed_count: AtomicU64::new(0),
                cancelled: AtomicBool::new(false),
                waker: Mutex::new(None),
            }),
        }
    }

    /// Returns the condition name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Signals the condition, waking the owning actor.
    ///
    /// Signals arriving before the owner polls are coalesced into the
    /// trigger counter; none are lost. Signaling a cancelled condition is
    /// a no-op.
    pub fn signal(&self) {
        if self.inner.cancelled.load(Ordering::Acquire) {
            return;
        }
        self.inner.trigger_count.fetch_add(1, Ordering::Release);
        let waker = self.inner.waker.lock().clone();
        if let Some(waker) = waker.and_then(|w| w.upgrade()) {
            waker.wake();
        }
    }

    /// Returns true if the condition has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn attach(&self, waker: Weak<dyn Wake>) {
        *self.inner.waker.lock() = Some(waker);
    }

    pub(crate) fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        *self.inner.waker.lock() = None;
    }

    /// Polls readiness: the trigger counter advanced past the processed
    /// counter, or the registered predicate reports pending work.
    pub(crate) fn poll(&self, has_pending_work: bool) -> bool {
        if self.inner.cancelled.load(Ordering::Acquire) {
            return false;
        }
        let triggered = self.inner.trigger_count.load(Ordering::Acquire);
        let processed = self.inner.processed_count.load(Ordering::Acquire);
        triggered > processed || has_pending_work
    }

    /// Consumes one trigger after the associated job completed.
    ///
    /// The processed counter never passes the trigger counter, so a run
    /// caused purely by the predicate consumes nothing and a burst of N
    /// signals yields exactly N net wakeups.
    pub(crate) fn on_job_completed(&self) {
        let triggered = self.inner.trigger_count.load(Ordering::Acquire);
        let processed = self.inner.processed_count.load(Ordering::Acquire);
        if processed < triggered {
            self.inner
                .processed_count
                .store(processed + 1, Ordering::Release);
        }
    }
}

impl std::fmt::Debug for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condition")
            .field("name", &self.inner.name)
            .field(
                "trigger_count",
                &self.inner.trigger_count.load(Ordering::Relaxed),
            )
            .field(
                "processed_count",
                &self.inner.processed_count.load(Ordering::Relaxed),
            )
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
