//! # Actor Scheduler
//!
//! Cooperatively multiplexes many actors onto a small fixed pool of
//! carrier threads.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     ActorScheduler                      │
//! │  ┌───────────┐  ┌───────────┐       ┌───────────┐       │
//! │  │ Carrier 0 │  │ Carrier 1 │  ...  │ Carrier N │       │
//! │  └─────▲─────┘  └─────▲─────┘       └─────▲─────┘       │
//! │        │              │                   │             │
//! │        └──────────────┴───────┬───────────┘             │
//! │                               │                         │
//! │                      ┌────────┴────────┐                │
//! │                      │    run queue    │◄── timer wheel │
//! │                      └────────▲────────┘                │
//! │                               │                         │
//! └───────────────────────────────┼─────────────────────────┘
//!                                 │
//!                  Condition::signal / job submit
//! ```
//!
//! Each carrier repeatedly takes a ready actor and runs one bounded batch
//! of its jobs. An actor becomes ready when a job is submitted, one of its
//! conditions is signaled, or one of its timers fires. No job may block a
//! carrier thread; every wait is expressed as a suspension on a
//! [`Condition`], a timer, or an [`ActorFuture`].
//!
//! ## Lifecycle
//!
//! `New → Starting → Started → CloseRequested → Closing → Closed`
//!
//! An uncaught failure in a job routes the actor to `Failed` instead,
//! detaching it without affecting sibling actors or carrier threads.

mod actor;
mod condition;
mod future;
mod scheduler;
mod timer;

pub use actor::{Actor, ActorCtx, ActorFault, ActorHandle, JobResult};
pub use condition::Condition;
pub use future::ActorFuture;
pub use scheduler::{ActorScheduler, SchedulerConfig, SchedulerConfigBuilder};

pub(crate) use actor::{ActorTask, CarrierTask};
pub(crate) use condition::Wake;
pub(crate) use scheduler::SchedulerShared;
pub(crate) use timer::{TimerSlot, TimerWheel};

/// Lifecycle states of an actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ActorState {
    /// Created but not yet scheduled for start.
    New = 0,
    /// `on_start` is running.
    Starting = 1,
    /// Open and processing jobs.
    Started = 2,
    /// Close has been requested; the actor has not yet observed it.
    CloseRequested = 3,
    /// `on_close` is running.
    Closing = 4,
    /// Fully closed; no further wakeups.
    Closed = 5,
    /// Detached after an unhandled job failure.
    Failed = 6,
}

impl ActorState {
    /// Returns true if the actor will never run another job.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, ActorState::Closed | ActorState::Failed)
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => ActorState::Starting,
            2 => ActorState::Started,
            3 => ActorState::CloseRequested,
            4 => ActorState::Closing,
            5 => ActorState::Closed,
            6 => ActorState::Failed,
            _ => ActorState::New,
        }
    }
}

/// Errors from scheduler operations.
#[derive(Debug, thiserror::Error)]
pub enum SchedError {
    /// A carrier thread could not be spawned.
    #[error("failed to spawn carrier thread {index}: {message}")]
    SpawnFailed {
        /// Index of the carrier that failed to spawn.
        index: usize,
        /// Error message.
        message: String,
    },

    /// Failed to set CPU affinity for a carrier thread.
    #[error("failed to pin carrier {index} to cpu {cpu}: {message}")]
    AffinityFailed {
        /// Index of the carrier.
        index: usize,
        /// Requested CPU id.
        cpu: usize,
        /// Error message.
        message: String,
    },

    /// The target actor no longer accepts jobs.
    #[error("actor '{name}' is {state:?} and no longer accepts jobs")]
    ActorUnavailable {
        /// Actor name.
        name: String,
        /// State the actor was in.
        state: ActorState,
    },

    /// The scheduler is shutting down.
    #[error("scheduler is shut down")]
    ShutDown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_terminal() {
        assert!(ActorState::Closed.is_terminal());
        assert!(ActorState::Failed.is_terminal());
        assert!(!ActorState::Started.is_terminal());
        assert!(!ActorState::CloseRequested.is_terminal());
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            ActorState::New,
            ActorState::Starting,
            ActorState::Started,
            ActorState::CloseRequested,
            ActorState::Closing,
            ActorState::Closed,
            ActorState::Failed,
        ] {
            assert_eq!(ActorState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_error_display() {
        let err = SchedError::ActorUnavailable {
            name: "appender-1".to_string(),
            state: ActorState::Closed,
        };
        assert_eq!(
            err.to_string(),
            "actor 'appender-1' is Closed and no longer accepts jobs"
        );
    }
}
