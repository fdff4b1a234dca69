//! Carrier-thread pool and run queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{Actor, ActorHandle, ActorTask, CarrierTask, SchedError, TimerWheel};

/// Configuration for the actor scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of carrier threads.
    pub carrier_threads: usize,
    /// Maximum jobs one actor may run per scheduling turn.
    pub job_batch_size: usize,
    /// CPU ids to pin carrier threads to, by carrier index (Linux only;
    /// ignored elsewhere). `None` disables pinning.
    pub cpu_affinity: Option<Vec<usize>>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            carrier_threads: 2,
            job_batch_size: 32,
            cpu_affinity: None,
        }
    }
}

impl SchedulerConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder::default()
    }
}

/// Builder for [`SchedulerConfig`].
#[derive(Debug, Default)]
pub struct SchedulerConfigBuilder {
    carrier_threads: Option<usize>,
    job_batch_size: Option<usize>,
    cpu_affinity: Option<Vec<usize>>,
}

impl SchedulerConfigBuilder {
    /// Sets the number of carrier threads.
    #[must_use]
    pub fn carrier_threads(mut self, threads: usize) -> Self {
        self.carrier_threads = Some(threads.max(1));
        self
    }

    /// Sets the per-turn job batch size.
    #[must_use]
    pub fn job_batch_size(mut self, batch: usize) -> Self {
        self.job_batch_size = Some(batch.max(1));
        self
    }

    /// Pins carrier threads to the given CPU ids, by carrier index.
    #[must_use]
    pub fn cpu_affinity(mut self, cpus: Vec<usize>) -> Self {
        self.cpu_affinity = Some(cpus);
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> SchedulerConfig {
        SchedulerConfig {
            carrier_threads: self.carrier_threads.unwrap_or(2),
            job_batch_size: self.job_batch_size.unwrap_or(32),
            cpu_affinity: self.cpu_affinity,
        }
    }
}

/// State shared between the scheduler handle, carriers, and actor tasks.
pub(crate) struct SchedulerShared {
    run_queue: Mutex<VecDeque<Arc<dyn CarrierTask>>>,
    work_ready: Condvar,
    shutdown: AtomicBool,
    pub(crate) timer: TimerWheel,
    actors: Mutex<Vec<Weak<dyn CarrierTask>>>,
}

impl SchedulerShared {
    fn new() -> Self {
        Self {
            run_queue: Mutex::new(VecDeque::new()),
            work_ready: Condvar::new(),
            shutdown: AtomicBool::new(false),
            timer: TimerWheel::new(),
            actors: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn enqueue(&self, task: Arc<dyn CarrierTask>) {
        self.run_queue.lock().push_back(task);
        self.work_ready.notify_one();
    }
}

/// Cooperative multiplexer of actors over a fixed carrier-thread pool.
///
/// Dropping the scheduler closes all actors and joins the carriers.
pub struct ActorScheduler {
    shared: Arc<SchedulerShared>,
    carriers: Vec<JoinHandle<()>>,
    timer_thread: Option<JoinHandle<()>>,
}

impl ActorScheduler {
    /// Starts the carrier-thread pool and timer thread.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::SpawnFailed`] if a thread cannot be spawned.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedError> {
        let shared = Arc::new(SchedulerShared::new());
        let mut carriers = Vec::with_capacity(config.carrier_threads);

        for index in 0..config.carrier_threads {
            let shared = Arc::clone(&shared);
            let batch = config.job_batch_size;
            let cpu = config
                .cpu_affinity
                .as_ref()
                .and_then(|cpus| cpus.get(index).copied());
            let handle = thread::Builder::new()
                .name(format!("millrace-carrier-{index}"))
                .spawn(move || {
                    if let Some(cpu) = cpu {
                        if let Err(message) = pin_current_thread(cpu) {
                            tracing::warn!(carrier = index, cpu, %message, "cpu pinning failed");
                        }
                    }
                    carrier_main(&shared, batch);
                })
                .map_err(|e| SchedError::SpawnFailed {
                    index,
                    message: e.to_string(),
                })?;
            carriers.push(handle);
        }

        let timer_shared = Arc::clone(&shared);
        let timer_thread = thread::Builder::new()
            .name("millrace-timer".to_string())
            .spawn(move || timer_shared.timer.run())
            .map_err(|e| SchedError::SpawnFailed {
                index: config.carrier_threads,
                message: e.to_string(),
            })?;

        Ok(Self {
            shared,
            carriers,
            timer_thread: Some(timer_thread),
        })
    }

    /// Spawns an actor, scheduling its `on_start` job.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::ShutDown`] if the scheduler is shut down.
    pub fn spawn<A: Actor>(&self, actor: A) -> Result<ActorHandle<A>, SchedError> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(SchedError::ShutDown);
        }
        let task = ActorTask::new(actor, Arc::downgrade(&self.shared));
        {
            let task_dyn: Arc<dyn CarrierTask> = task.clone();
            let weak: Weak<dyn CarrierTask> = Arc::downgrade(&task_dyn);
            self.shared.actors.lock().push(weak);
        }
        task.try_wakeup();
        Ok(ActorHandle::new(task))
    }

    /// Closes all actors, then stops carrier and timer threads.
    ///
    /// Waits up to `grace` for actors to finish closing; actors that do not
    /// close in time are abandoned (their state remains observable).
    pub fn shutdown(mut self, grace: Duration) {
        self.shutdown_inner(grace);
    }

    fn shutdown_inner(&mut self, grace: Duration) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        let actors: Vec<Arc<dyn CarrierTask>> = self
            .shared
            .actors
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for actor in &actors {
            actor.request_task_close();
        }

        let deadline = Instant::now() + grace;
        loop {
            let open = actors
                .iter()
                .filter(|a| !a.task_state().is_terminal())
                .count();
            if open == 0 {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!(open, "scheduler shutdown grace elapsed with open actors");
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }

        self.shared.timer.shutdown();
        self.shared.work_ready.notify_all();

        for carrier in self.carriers.drain(..) {
            let _ = carrier.join();
        }
        if let Some(timer) = self.timer_thread.take() {
            let _ = timer.join();
        }
    }
}

impl Drop for ActorScheduler {
    fn drop(&mut self) {
        self.shutdown_inner(Duration::from_secs(5));
    }
}

fn carrier_main(shared: &Arc<SchedulerShared>, batch: usize) {
    loop {
        let task = {
            let mut queue = shared.run_queue.lock();
            loop {
                if let Some(task) = queue.pop_front() {
                    break Some(task);
                }
                if shared.shutdown.load(Ordering::Acquire) {
                    break None;
                }
                shared.work_ready.wait(&mut queue);
            }
        };
        match task {
            Some(task) => task.run_batch(batch),
            None => return,
        }
    }
}

/// Pins the current thread to a CPU (Linux only; no-op elsewhere).
#[cfg(target_os = "linux")]
fn pin_current_thread(cpu: usize) -> Result<(), String> {
    use std::mem;

    // SAFETY: cpu_set_t is zero-initialized and populated via CPU_SET;
    // pid 0 refers to the calling thread.
    #[allow(unsafe_code)]
    unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        let result = libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set);
        if result != 0 {
            return Err(std::io::Error::last_os_error().to_string());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
#[allow(clippy::unnecessary_wraps)] // Signature shared with the Linux path
fn pin_current_thread(_cpu: usize) -> Result<(), String> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{ActorCtx, ActorFuture, ActorState, Condition, JobResult};
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Arc;

    struct Recorder {
        name: String,
        events: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn new(name: &str, events: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                events,
            }
        }

        fn record(&self, event: &str) {
            self.events.lock().push(event.to_string());
        }
    }

    impl Actor for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn on_start(&mut self, _ctx: &mut ActorCtx<'_, Self>) -> JobResult {
            self.record("start");
            Ok(())
        }

        fn on_close(&mut self, _ctx: &mut ActorCtx<'_, Self>) {
            self.record("close");
        }
    }

    fn wait_for<F: Fn() -> bool>(predicate: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if predicate() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        predicate()
    }

    #[test]
    fn test_spawn_runs_on_start() {
        let sched = ActorScheduler::new(SchedulerConfig::default()).unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));

        let handle = sched.spawn(Recorder::new("a", Arc::clone(&events))).unwrap();
        assert!(wait_for(
            || handle.state() == ActorState::Started,
            Duration::from_secs(1)
        ));
        assert_eq!(events.lock().as_slice(), ["start"]);

        sched.shutdown(Duration::from_secs(1));
        assert_eq!(events.lock().as_slice(), ["start", "close"]);
    }

    #[test]
    fn test_jobs_run_in_submission_order() {
        let sched = ActorScheduler::new(SchedulerConfig::default()).unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));

        let handle = sched.spawn(Recorder::new("a", Arc::clone(&events))).unwrap();
        for i in 0..10 {
            handle
                .submit(move |actor, _ctx| {
                    actor.record(&format!("job-{i}"));
                    Ok(())
                })
                .unwrap();
        }

        assert!(wait_for(|| events.lock().len() == 11, Duration::from_secs(1)));
        let seen = events.lock().clone();
        for (i, event) in seen[1..].iter().enumerate() {
            assert_eq!(event, &format!("job-{i}"));
        }

        sched.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_condition_wakes_actor() {
        let sched = ActorScheduler::new(SchedulerConfig::default()).unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let fired = Arc::new(AtomicUsize::new(0));

        let handle = sched.spawn(Recorder::new("a", Arc::clone(&events))).unwrap();

        let cond_cell: Arc<Mutex<Option<Condition>>> = Arc::new(Mutex::new(None));
        let cell = Arc::clone(&cond_cell);
        let fired_in_job = Arc::clone(&fired);
        handle
            .submit(move |_actor, ctx| {
                let condition = ctx.condition(
                    "work",
                    || false,
                    move |_actor, _ctx| {
                        fired_in_job.fetch_add(1, AtomicOrdering::SeqCst);
                        Ok(())
                    },
                );
                *cell.lock() = Some(condition);
                Ok(())
            })
            .unwrap();

        assert!(wait_for(
            || cond_cell.lock().is_some(),
            Duration::from_secs(1)
        ));
        let condition = cond_cell.lock().clone().unwrap();

        for _ in 0..3 {
            condition.signal();
        }
        assert!(wait_for(
            || fired.load(AtomicOrdering::SeqCst) == 3,
            Duration::from_secs(1)
        ));

        sched.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_fixed_rate_timer_fires() {
        let sched = ActorScheduler::new(SchedulerConfig::default()).unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let ticks = Arc::new(AtomicUsize::new(0));

        let handle = sched.spawn(Recorder::new("a", Arc::clone(&events))).unwrap();
        let ticks_in_job = Arc::clone(&ticks);
        handle
            .submit(move |_actor, ctx| {
                ctx.run_at_fixed_rate(Duration::from_millis(5), move |_actor, _ctx| {
                    ticks_in_job.fetch_add(1, AtomicOrdering::SeqCst);
                    Ok(())
                });
                Ok(())
            })
            .unwrap();

        assert!(wait_for(
            || ticks.load(AtomicOrdering::SeqCst) >= 3,
            Duration::from_secs(2)
        ));

        // After close, no further ticks.
        let _ = handle.close().join_timeout(Duration::from_secs(1));
        let after_close = ticks.load(AtomicOrdering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert!(ticks.load(AtomicOrdering::SeqCst) <= after_close + 1);

        sched.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_failed_job_isolates_actor() {
        let sched = ActorScheduler::new(SchedulerConfig::default()).unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));

        let failing = sched
            .spawn(Recorder::new("failing", Arc::clone(&events)))
            .unwrap();
        let healthy = sched
            .spawn(Recorder::new("healthy", Arc::clone(&events)))
            .unwrap();

        failing
            .submit(|_actor, _ctx| Err(crate::sched::ActorFault::new("boom")))
            .unwrap();
        assert!(wait_for(
            || failing.state() == ActorState::Failed,
            Duration::from_secs(1)
        ));

        // The sibling keeps running jobs.
        healthy
            .submit(|actor, _ctx| {
                actor.record("still-alive");
                Ok(())
            })
            .unwrap();
        assert!(wait_for(
            || events.lock().iter().any(|e| e == "still-alive"),
            Duration::from_secs(1)
        ));

        // A failed actor accepts no further jobs.
        assert!(failing.submit(|_a, _c| Ok(())).is_err());

        sched.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_panicking_job_fails_actor() {
        let sched = ActorScheduler::new(SchedulerConfig::default()).unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));

        let handle = sched.spawn(Recorder::new("a", Arc::clone(&events))).unwrap();
        handle
            .submit(|_actor, _ctx| panic!("deliberate panic"))
            .unwrap();

        assert!(wait_for(
            || handle.state() == ActorState::Failed,
            Duration::from_secs(1)
        ));

        sched.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_close_discards_pending_jobs() {
        let sched = ActorScheduler::new(SchedulerConfig::builder().carrier_threads(1).build())
            .unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));

        let handle = sched.spawn(Recorder::new("a", Arc::clone(&events))).unwrap();
        assert!(wait_for(
            || handle.state() == ActorState::Started,
            Duration::from_secs(1)
        ));

        // Occupy the single carrier so the jobs below cannot run before the
        // close request is observed.
        let blocker = sched.spawn(Recorder::new("b", Arc::clone(&events))).unwrap();
        assert!(wait_for(
            || blocker.state() == ActorState::Started,
            Duration::from_secs(1)
        ));
        blocker
            .submit(|_actor, _ctx| {
                thread::sleep(Duration::from_millis(30));
                Ok(())
            })
            .unwrap();
        thread::sleep(Duration::from_millis(5));

        for _ in 0..5 {
            handle
                .submit(|actor, _ctx| {
                    actor.record("should-not-run");
                    Ok(())
                })
                .unwrap();
        }
        let close = handle.close();
        assert!(close.join_timeout(Duration::from_secs(1)).is_some());
        assert_eq!(handle.state(), ActorState::Closed);
        assert!(!events.lock().iter().any(|e| e == "should-not-run"));

        sched.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_on_completion_delivers_value_as_job() {
        let sched = ActorScheduler::new(SchedulerConfig::default()).unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));

        let handle = sched.spawn(Recorder::new("a", Arc::clone(&events))).unwrap();
        let future: ActorFuture<u64> = ActorFuture::new();

        let registered = future.clone();
        handle
            .submit(move |_actor, ctx| {
                ctx.on_completion(&registered, |value, actor, _ctx| {
                    actor.record(&format!("got-{value}"));
                    Ok(())
                });
                Ok(())
            })
            .unwrap();

        thread::sleep(Duration::from_millis(10));
        future.complete(99);

        assert!(wait_for(
            || events.lock().iter().any(|e| e == "got-99"),
            Duration::from_secs(1)
        ));

        sched.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_shutdown_closes_all_actors() {
        let sched = ActorScheduler::new(SchedulerConfig::default()).unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));

        let a = sched.spawn(Recorder::new("a", Arc::clone(&events))).unwrap();
        let b = sched.spawn(Recorder::new("b", Arc::clone(&events))).unwrap();
        assert!(wait_for(
            || a.state() == ActorState::Started && b.state() == ActorState::Started,
            Duration::from_secs(1)
        ));

        sched.shutdown(Duration::from_secs(1));
        assert_eq!(a.state(), ActorState::Closed);
        assert_eq!(b.state(), ActorState::Closed);
        assert_eq!(events.lock().iter().filter(|e| *e == "close").count(), 2);
    }
}
