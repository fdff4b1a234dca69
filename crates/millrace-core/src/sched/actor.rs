//! Actor tasks, jobs, and the execution context.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use super::{
    ActorFuture, ActorState, Condition, SchedError, SchedulerShared, TimerSlot, Wake,
};

/// Outcome of a single job.
pub type JobResult = Result<(), ActorFault>;

/// An unrecoverable failure raised by a job.
///
/// Returning an `ActorFault` from a job (or panicking inside one) routes
/// the owning actor to [`ActorState::Failed`], detaching it from the
/// scheduler without affecting sibling actors or carrier threads.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ActorFault {
    message: String,
}

impl ActorFault {
    /// Creates a fault with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Wraps any error as a fault.
    #[must_use]
    pub fn caused_by(error: &dyn std::error::Error) -> Self {
        Self {
            message: error.to_string(),
        }
    }
}

impl From<String> for ActorFault {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for ActorFault {
    fn from(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

/// Behavior hosted by the scheduler.
///
/// An actor is a plain value plus an explicit job queue; capabilities
/// (submitting jobs, registering conditions and timers, chaining futures)
/// are exposed through [`ActorCtx`] rather than through inheritance.
pub trait Actor: Send + Sized + 'static {
    /// Stable name used for thread-safe diagnostics and logging.
    fn name(&self) -> &str;

    /// Runs once when the actor transitions `New → Starting`.
    ///
    /// Registrations made here (conditions, timers) become active when the
    /// actor reaches `Started`. An error routes the actor to `Failed`.
    ///
    /// # Errors
    ///
    /// Returns an [`ActorFault`] to fail the actor during startup.
    fn on_start(&mut self, _ctx: &mut ActorCtx<'_, Self>) -> JobResult {
        Ok(())
    }

    /// Runs once while the actor transitions `Closing → Closed`.
    fn on_close(&mut self, _ctx: &mut ActorCtx<'_, Self>) {}
}

type Job<A> = Box<dyn for<'t> FnOnce(&mut A, &mut ActorCtx<'t, A>) -> JobResult + Send>;
type RecurringJob<A> = Box<dyn for<'t> FnMut(&mut A, &mut ActorCtx<'t, A>) -> JobResult + Send>;

struct ConditionSub<A: Actor> {
    condition: Condition,
    predicate: Box<dyn Fn() -> bool + Send>,
    job: RecurringJob<A>,
}

struct TimerSub<A: Actor> {
    slot: Arc<TimerSlot>,
    job: RecurringJob<A>,
}

struct Body<A: Actor> {
    actor: A,
    conditions: Vec<ConditionSub<A>>,
    timers: Vec<TimerSub<A>>,
}

/// Type-erased view of an actor task used by carriers and the scheduler.
pub(crate) trait CarrierTask: Send + Sync {
    /// Runs one bounded batch of the task's jobs.
    fn run_batch(self: Arc<Self>, max_jobs: usize);
    /// Actor name.
    fn task_name(&self) -> &str;
    /// Requests a cooperative close.
    fn request_task_close(&self);
    /// Current lifecycle state.
    fn task_state(&self) -> ActorState;
}

/// One scheduled actor: lifecycle state, job queue, and subscriptions.
pub(crate) struct ActorTask<A: Actor> {
    name: String,
    state: AtomicU8,
    scheduled: AtomicBool,
    close_requested: AtomicBool,
    sched: Weak<SchedulerShared>,
    weak_self: Weak<ActorTask<A>>,
    jobs: Mutex<VecDeque<Job<A>>>,
    body: Mutex<Body<A>>,
    close_future: ActorFuture<()>,
}

impl<A: Actor> ActorTask<A> {
    pub(crate) fn new(actor: A, sched: Weak<SchedulerShared>) -> Arc<Self> {
        let name = actor.name().to_string();
        Arc::new_cyclic(|weak_self| Self {
            name,
            state: AtomicU8::new(ActorState::New as u8),
            scheduled: AtomicBool::new(false),
            close_requested: AtomicBool::new(false),
            sched,
            weak_self: weak_self.clone(),
            jobs: Mutex::new(VecDeque::new()),
            body: Mutex::new(Body {
                actor,
                conditions: Vec::new(),
                timers: Vec::new(),
            }),
            close_future: ActorFuture::new(),
        })
    }

    pub(crate) fn state(&self) -> ActorState {
        ActorState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ActorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn close_future(&self) -> ActorFuture<()> {
        self.close_future.clone()
    }

    /// Enqueues the task on the scheduler unless it is already scheduled
    /// or terminal. Safe to call from any thread.
    pub(crate) fn try_wakeup(&self) {
        if self.state().is_terminal() {
            return;
        }
        if self
            .scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let enqueued = match (self.sched.upgrade(), self.weak_self.upgrade()) {
                (Some(sched), Some(me)) => {
                    sched.enqueue(me);
                    true
                }
                _ => false,
            };
            if !enqueued {
                self.scheduled.store(false, Ordering::Release);
            }
        }
    }

    pub(crate) fn submit_job(&self, job: Job<A>) -> Result<(), SchedError> {
        let state = self.state();
        if state.is_terminal() {
            return Err(SchedError::ActorUnavailable {
                name: self.name.clone(),
                state,
            });
        }
        self.jobs.lock().push_back(job);
        self.try_wakeup();
        Ok(())
    }

    pub(crate) fn request_close(&self) {
        if self.state().is_terminal() {
            return;
        }
        self.close_requested.store(true, Ordering::Release);
        // Make the request visible in the lifecycle state if the actor is
        // currently open; the closing carrier performs the rest.
        let _ = self.state.compare_exchange(
            ActorState::Started as u8,
            ActorState::CloseRequested as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.try_wakeup();
    }

    fn wake_target(this: &Arc<Self>) -> Weak<dyn Wake> {
        let weak: Weak<dyn Wake> = this.weak_self.clone();
        weak
    }

    fn merge_registrations(this: &Arc<Self>, body: &mut Body<A>, ctx: CtxOutcome<A>) {
        for sub in ctx.conditions {
            sub.condition.attach(Self::wake_target(this));
            body.conditions.push(sub);
        }
        for sub in ctx.timers {
            if let Some(sched) = this.sched.upgrade() {
                sched.timer.register(Arc::clone(&sub.slot), Self::wake_target(this));
            }
            body.timers.push(sub);
        }
        if ctx.close_requested {
            this.close_requested.store(true, Ordering::Release);
        }
    }

    fn fail(this: &Arc<Self>, body: &mut Body<A>, fault: &ActorFault) {
        tracing::error!(actor = %this.name, error = %fault, "actor failed, detaching");
        Self::cancel_subscriptions(body);
        this.jobs.lock().clear();
        this.set_state(ActorState::Failed);
        this.close_future.complete(());
    }

    fn cancel_subscriptions(body: &mut Body<A>) {
        for sub in &body.conditions {
            sub.condition.cancel();
        }
        for sub in &body.timers {
            sub.slot.cancel();
        }
        body.conditions.clear();
        body.timers.clear();
    }

    fn start(this: &Arc<Self>, body: &mut Body<A>) {
        this.set_state(ActorState::Starting);
        let mut ctx = ActorCtx::new(this);
        let result = {
            let actor = &mut body.actor;
            run_guarded(|| actor.on_start(&mut ctx))
        };
        let outcome = ctx.into_outcome();
        Self::merge_registrations(this, body, outcome);
        match result {
            Ok(()) => {
                this.set_state(ActorState::Started);
                tracing::debug!(actor = %this.name, "actor started");
            }
            Err(fault) => Self::fail(this, body, &fault),
        }
    }

    fn close(this: &Arc<Self>, body: &mut Body<A>) {
        if this.state() == ActorState::CloseRequested || this.state() == ActorState::Started {
            // Pending jobs are cancelled before on_close runs.
            this.jobs.lock().clear();
            this.set_state(ActorState::Closing);
            let mut ctx = ActorCtx::new(this);
            let result = {
                let actor = &mut body.actor;
                run_guarded(|| {
                    actor.on_close(&mut ctx);
                    Ok(())
                })
            };
            if let Err(fault) = result {
                tracing::warn!(actor = %this.name, error = %fault, "on_close failed");
            }
            // Registrations made during on_close are discarded.
        }
        Self::cancel_subscriptions(body);
        this.jobs.lock().clear();
        this.set_state(ActorState::Closed);
        tracing::debug!(actor = %this.name, "actor closed");
        this.close_future.complete(());
    }

    fn run_one(this: &Arc<Self>, body: &mut Body<A>, kind: JobKind<A>) -> Result<(), ()> {
        let mut ctx = ActorCtx::new(this);
        let result = {
            let Body {
                actor,
                conditions,
                timers,
            } = body;
            match kind {
                JobKind::Once(job) => {
                    let ctx = &mut ctx;
                    run_guarded(move || job(actor, ctx))
                }
                JobKind::Timer(index) => {
                    let job = &mut timers[index].job;
                    let ctx = &mut ctx;
                    run_guarded(move || job(actor, ctx))
                }
                JobKind::Condition(index) => {
                    let job = &mut conditions[index].job;
                    let ctx = &mut ctx;
                    run_guarded(move || job(actor, ctx))
                }
            }
        };
        let outcome = ctx.into_outcome();
        Self::merge_registrations(this, body, outcome);
        match result {
            Ok(()) => Ok(()),
            Err(fault) => {
                Self::fail(this, body, &fault);
                Err(())
            }
        }
    }

    fn drain(this: &Arc<Self>, body: &mut Body<A>, max_jobs: usize) {
        let mut executed = 0;
        loop {
            if executed >= max_jobs
                || this.state() != ActorState::Started
                || this.close_requested.load(Ordering::Acquire)
            {
                return;
            }
            let mut ran = false;

            let job = this.jobs.lock().pop_front();
            if let Some(job) = job {
                if Self::run_one(this, body, JobKind::Once(job)).is_err() {
                    return;
                }
                ran = true;
                executed += 1;
            }

            let mut index = 0;
            while index < body.timers.len()
                && executed < max_jobs
                && this.state() == ActorState::Started
            {
                let due = {
                    let sub = &body.timers[index];
                    !sub.slot.cancelled.load(Ordering::Acquire)
                        && sub.slot.due.swap(false, Ordering::AcqRel)
                };
                if due {
                    if Self::run_one(this, body, JobKind::Timer(index)).is_err() {
                        return;
                    }
                    ran = true;
                    executed += 1;
                }
                index += 1;
            }

            let mut index = 0;
            while index < body.conditions.len()
                && executed < max_jobs
                && this.state() == ActorState::Started
            {
                let ready = {
                    let sub = &body.conditions[index];
                    sub.condition.poll((sub.predicate)())
                };
                if ready {
                    if Self::run_one(this, body, JobKind::Condition(index)).is_err() {
                        return;
                    }
                    body.conditions[index].condition.on_job_completed();
                    ran = true;
                    executed += 1;
                }
                index += 1;
            }

            if !ran {
                return;
            }
        }
    }

    fn has_pending_work(&self, body: &Body<A>) -> bool {
        if !self.jobs.lock().is_empty() {
            return true;
        }
        if body.timers.iter().any(|sub| {
            !sub.slot.cancelled.load(Ordering::Acquire) && sub.slot.due.load(Ordering::Acquire)
        }) {
            return true;
        }
        body.conditions
            .iter()
            .any(|sub| sub.condition.poll((sub.predicate)()))
    }
}

enum JobKind<A: Actor> {
    Once(Job<A>),
    Timer(usize),
    Condition(usize),
}

impl<A: Actor> Wake for ActorTask<A> {
    fn wake(&self) {
        self.try_wakeup();
    }
}

impl<A: Actor> CarrierTask for ActorTask<A> {
    fn run_batch(self: Arc<Self>, max_jobs: usize) {
        let mut body_guard = self.body.lock();
        let body = &mut *body_guard;

        if !self.state().is_terminal() {
            if self.state() == ActorState::New && !self.close_requested.load(Ordering::Acquire) {
                Self::start(&self, body);
            }

            if self.state() == ActorState::Started {
                Self::drain(&self, body, max_jobs);
            }

            if self.close_requested.load(Ordering::Acquire) && !self.state().is_terminal() {
                Self::close(&self, body);
            }
        }

        // Unschedule, then re-check: a signal landing after the check will
        // see scheduled == false and enqueue the task itself.
        self.scheduled.store(false, Ordering::Release);
        let more = !self.state().is_terminal() && self.has_pending_work(body);
        drop(body_guard);
        if more {
            self.try_wakeup();
        }
    }

    fn task_name(&self) -> &str {
        &self.name
    }

    fn request_task_close(&self) {
        self.request_close();
    }

    fn task_state(&self) -> ActorState {
        self.state()
    }
}

fn run_guarded(f: impl FnOnce() -> JobResult) -> JobResult {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => Err(ActorFault::new(panic_message(&panic))),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "job panicked".to_string()
    }
}

/// Capability surface handed to every job.
///
/// Registrations made through the context become active once the current
/// job returns.
pub struct ActorCtx<'t, A: Actor> {
    task: &'t Arc<ActorTask<A>>,
    pending_conditions: Vec<ConditionSub<A>>,
    pending_timers: Vec<TimerSub<A>>,
    close_requested: bool,
}

struct CtxOutcome<A: Actor> {
    conditions: Vec<ConditionSub<A>>,
    timers: Vec<TimerSub<A>>,
    close_requested: bool,
}

impl<'t, A: Actor> ActorCtx<'t, A> {
    fn new(task: &'t Arc<ActorTask<A>>) -> Self {
        Self {
            task,
            pending_conditions: Vec::new(),
            pending_timers: Vec::new(),
            close_requested: false,
        }
    }

    fn into_outcome(self) -> CtxOutcome<A> {
        CtxOutcome {
            conditions: self.pending_conditions,
            timers: self.pending_timers,
            close_requested: self.close_requested,
        }
    }

    /// Returns the actor name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.task.name
    }

    /// Returns a handle to this actor.
    #[must_use]
    pub fn handle(&self) -> ActorHandle<A> {
        ActorHandle {
            task: Arc::clone(self.task),
        }
    }

    /// Submits a follow-up job to this actor's own queue.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::ActorUnavailable`] if the actor is terminal.
    pub fn submit(
        &self,
        job: impl for<'c> FnOnce(&mut A, &mut ActorCtx<'c, A>) -> JobResult + Send + 'static,
    ) -> Result<(), SchedError> {
        self.task.submit_job(Box::new(job))
    }

    /// Registers a wakeup condition with a pending-work predicate and a
    /// recurring job that runs whenever the condition reports ready.
    pub fn condition(
        &mut self,
        name: &str,
        predicate: impl Fn() -> bool + Send + 'static,
        job: impl for<'c> FnMut(&mut A, &mut ActorCtx<'c, A>) -> JobResult + Send + 'static,
    ) -> Condition {
        let condition = Condition::new(name);
        self.pending_conditions.push(ConditionSub {
            condition: condition.clone(),
            predicate: Box::new(predicate),
            job: Box::new(job),
        });
        condition
    }

    /// Registers a recurring job firing approximately every `interval`
    /// while the actor is open; auto-cancelled on close.
    pub fn run_at_fixed_rate(
        &mut self,
        interval: Duration,
        job: impl for<'c> FnMut(&mut A, &mut ActorCtx<'c, A>) -> JobResult + Send + 'static,
    ) {
        self.pending_timers.push(TimerSub {
            slot: TimerSlot::new(interval),
            job: Box::new(job),
        });
    }

    /// Runs `job` on this actor once `future` completes.
    ///
    /// The continuation is delivered as a regular job, preserving per-actor
    /// ordering. If the future is already complete the job is submitted
    /// immediately.
    pub fn on_completion<T: Clone + Send + 'static>(
        &self,
        future: &ActorFuture<T>,
        job: impl for<'c> FnOnce(T, &mut A, &mut ActorCtx<'c, A>) -> JobResult + Send + 'static,
    ) {
        let task = Arc::downgrade(self.task);
        future.on_completion(move |value| {
            if let Some(task) = task.upgrade() {
                let _ = task.submit_job(Box::new(move |actor, ctx| job(value, actor, ctx)));
            }
        });
    }

    /// Requests a cooperative close of this actor after the current job.
    pub fn request_close(&mut self) {
        self.close_requested = true;
    }
}

/// Cloneable handle to a spawned actor.
pub struct ActorHandle<A: Actor> {
    task: Arc<ActorTask<A>>,
}

impl<A: Actor> Clone for ActorHandle<A> {
    fn clone(&self) -> Self {
        Self {
            task: Arc::clone(&self.task),
        }
    }
}

impl<A: Actor> ActorHandle<A> {
    pub(crate) fn new(task: Arc<ActorTask<A>>) -> Self {
        Self { task }
    }

    /// Returns the actor name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.task.name
    }

    /// Returns the actor's current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ActorState {
        self.task.state()
    }

    /// Submits a job to the actor's queue.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::ActorUnavailable`] if the actor is terminal.
    pub fn submit(
        &self,
        job: impl for<'c> FnOnce(&mut A, &mut ActorCtx<'c, A>) -> JobResult + Send + 'static,
    ) -> Result<(), SchedError> {
        self.task.submit_job(Box::new(job))
    }

    /// Requests a cooperative close and returns a future completing once
    /// the actor reaches a terminal state.
    pub fn close(&self) -> ActorFuture<()> {
        self.task.request_close();
        self.task.close_future()
    }

    /// Returns a future completing when the actor reaches a terminal
    /// state, without requesting a close.
    #[must_use]
    pub fn closed(&self) -> ActorFuture<()> {
        self.task.close_future()
    }
}

impl<A: Actor> std::fmt::Debug for ActorHandle<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorHandle")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}
