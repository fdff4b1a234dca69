//! Single-completion futures for cross-actor value propagation.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

type Continuation<T> = Box<dyn FnOnce(T) + Send>;

enum FutureState<T> {
    Pending(Vec<Continuation<T>>),
    Complete(T),
}

struct FutureInner<T> {
    state: Mutex<FutureState<T>>,
    completed: Condvar,
}

/// A single-completion value shared between actors.
///
/// Completing the future atomically releases exactly one set of waiting
/// continuations; a continuation attached after completion runs
/// immediately on the attaching thread. Only the first completion wins.
///
/// Continuations intended to run *on an actor* should be attached through
/// [`ActorCtx::on_completion`](super::ActorCtx::on_completion), which
/// turns the value into a job on that actor's queue.
pub struct ActorFuture<T> {
    inner: Arc<FutureInner<T>>,
}

impl<T> Clone for ActorFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for ActorFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ActorFuture<T> {
    /// Creates a new pending future.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FutureInner {
                state: Mutex::new(FutureState::Pending(Vec::new())),
                completed: Condvar::new(),
            }),
        }
    }

    /// Returns true if the future has been completed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(*self.inner.state.lock(), FutureState::Complete(_))
    }
}

impl<T: Clone + Send + 'static> ActorFuture<T> {
    /// Creates a future that is already complete.
    #[must_use]
    pub fn completed(value: T) -> Self {
        let future = Self::new();
        future.complete(value);
        future
    }

    /// Completes the future, releasing all waiting continuations.
    ///
    /// Returns false if the future was already complete; the new value is
    /// discarded in that case.
    pub fn complete(&self, value: T) -> bool {
        let waiters = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                FutureState::Complete(_) => return false,
                FutureState::Pending(waiters) => {
                    let waiters = std::mem::take(waiters);
                    *state = FutureState::Complete(value.clone());
                    waiters
                }
            }
        };
        self.inner.completed.notify_all();
        for waiter in waiters {
            waiter(value.clone());
        }
        true
    }

    /// Attaches a continuation to run with the completion value.
    ///
    /// If the future is already complete the continuation runs immediately
    /// on the calling thread; otherwise it is stored and runs on the
    /// completing thread. Tolerant of complete-before-attach races.
    pub fn on_completion(&self, continuation: impl FnOnce(T) + Send + 'static) {
        let value = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                FutureState::Complete(value) => value.clone(),
                FutureState::Pending(waiters) => {
                    waiters.push(Box::new(continuation));
                    return;
                }
            }
        };
        continuation(value);
    }

    /// Blocks the calling thread until the future completes.
    ///
    /// Intended for non-actor threads (tests, bootstrap); never call this
    /// from a job running on a carrier thread.
    #[must_use]
    pub fn join(&self) -> T {
        let mut state = self.inner.state.lock();
        loop {
            if let FutureState::Complete(value) = &*state {
                return value.clone();
            }
            self.inner.completed.wait(&mut state);
        }
    }

    /// Blocks until the future completes or the timeout elapses.
    ///
    /// Returns `None` on timeout.
    #[must_use]
    pub fn join_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let FutureState::Complete(value) = &*state {
                return Some(value.clone());
            }
            if self
                .inner
                .completed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                if let FutureState::Complete(value) = &*state {
                    return Some(value.clone());
                }
                return None;
            }
        }
    }
}

impl<T> std::fmt::Debug for ActorFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorFuture")
            .field("complete", &self.is_complete())
            .finish_non_exhaustive()
    }
}
