//! # Millrace Core
//!
//! The concurrency substrate for Millrace: a cooperative actor scheduler
//! and a bounded memory pool.
//!
//! This crate provides:
//! - **Scheduler**: many lightweight actors multiplexed onto a small fixed
//!   pool of carrier threads
//! - **Conditions**: counted, coalescing wakeup sources
//! - **Timers**: fixed-rate recurring jobs, auto-cancelled on actor close
//! - **Futures**: single-completion values propagated across actors
//! - **Memory pool**: capacity accounting with producer-side backpressure
//!
//! ## Design Principles
//!
//! 1. **No blocking on carrier threads** - every wait is a suspension on a
//!    condition, timer, or future
//! 2. **Fault isolation** - a failed job detaches its actor, never a
//!    carrier thread
//! 3. **Per-actor ordering** - jobs of one actor run in submission order,
//!    never concurrently

#![deny(missing_docs)]
#![deny(unsafe_code)] // Selectively allowed where needed with justification
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod pool;
pub mod sched;

pub use pool::{BoundedMemoryPool, MemoryPoolConfig, PoolError, PooledBlock};
pub use sched::{
    Actor, ActorCtx, ActorFault, ActorFuture, ActorHandle, ActorScheduler, ActorState, Condition,
    JobResult, SchedError, SchedulerConfig,
};
