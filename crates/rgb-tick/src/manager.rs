//! Per-unit task registry and dispatcher

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{error, trace};

use crate::error::{SchedulerError, SchedulerResult, TaskResult};
use crate::priority::TaskPriority;
use crate::queue::TaskQueue;
use crate::task::{Owner, PulseOutcome, Runnable, Task, TaskContext, TaskId, TaskOptions, runnable};
use crate::worker::{Worker, WorkerInfo};

/// Call-time step applied to deferred tasks when no pulse period is known
pub const DEFAULT_DEFER_STEP: u64 = 50;

/// Shared overload flag; deferrable tasks are postponed while it is set
#[derive(Debug, Clone, Default)]
pub struct LoadSignal(Arc<AtomicBool>);

impl LoadSignal {
    pub fn set(&self, overloaded: bool) {
        self.0.store(overloaded, Ordering::Release);
    }

    #[must_use]
    pub fn is_overloaded(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct Registry {
    queue: TaskQueue,
    /// Every task scheduled and not yet finished, queued or executing
    active: HashMap<TaskId, Arc<Task>>,
}

struct Inner {
    name: String,
    allows_async: bool,
    defer_step: u64,
    load: LoadSignal,
    alive: AtomicBool,
    up_time: AtomicU64,
    registry: Mutex<Registry>,
    workers: Mutex<HashMap<TaskId, Worker>>,
    workers_idle: Condvar,
    thread: OnceLock<ThreadId>,
}

impl Inner {
    fn run(&self, task: &Arc<Task>, now: u64, overloaded: bool) {
        match task.pulse(now, overloaded, self.defer_step) {
            PulseOutcome::Failed(failure) => error!(
                manager = %self.name,
                task = %task.id(),
                owner = %task.owner(),
                error = %failure,
                "task execution failed"
            ),
            PulseOutcome::Deferred => trace!(
                manager = %self.name,
                task = %task.id(),
                priority = %task.options().priority,
                "task deferred under load"
            ),
            PulseOutcome::Busy => {
                task.advance_call_time(0, now);
            }
            PulseOutcome::Completed | PulseOutcome::NotAlive => {}
        }
    }

    /// Re-queue a task after execution, or forget it if it died
    fn repeat_schedule(&self, task: &Arc<Task>) {
        let mut registry = self.registry.lock();
        let requeued = self.alive.load(Ordering::Acquire) && registry.queue.push(Arc::clone(task));
        if !requeued {
            registry.active.remove(&task.id());
        }
    }

    fn spawn_worker(inner: &Arc<Self>, task: Arc<Task>) -> SchedulerResult<()> {
        let name = format!("{}-worker-{}", inner.name, task.id().raw());
        let mut workers = inner.workers.lock();
        let handle = {
            let inner = Arc::clone(inner);
            let task = Arc::clone(&task);
            thread::Builder::new()
                .name(name.clone())
                .spawn(move || inner.run_worker(&task))
        }
        .map_err(|source| SchedulerError::Spawn { name, source })?;
        workers.insert(task.id(), Worker::new(task, handle.thread().clone()));
        Ok(())
    }

    fn run_worker(&self, task: &Arc<Task>) {
        let now = self.up_time.load(Ordering::Acquire);
        self.run(task, now, self.load.is_overloaded());
        self.repeat_schedule(task);

        let mut workers = self.workers.lock();
        workers.remove(&task.id());
        if workers.is_empty() {
            self.workers_idle.notify_all();
        }
    }
}

/// Task registry and time-ordered ready queue for one thread
///
/// Sync tasks run inline on the thread that calls [`heartbeat`](Self::heartbeat);
/// the first heartbeat binds the manager to that thread for good. Async tasks
/// run on a fresh [`Worker`] thread each time they are due and are only
/// accepted by managers created with `allows_async`.
///
/// Cloning is cheap and yields another handle to the same manager.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

impl TaskManager {
    pub fn new(name: impl Into<String>, allows_async: bool) -> Self {
        Self::with_load(name, allows_async, LoadSignal::default(), DEFAULT_DEFER_STEP)
    }

    /// Manager sharing an overload signal; deferred tasks move by `defer_step`
    pub fn with_load(
        name: impl Into<String>,
        allows_async: bool,
        load: LoadSignal,
        defer_step: u64,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                allows_async,
                defer_step,
                load,
                alive: AtomicBool::new(true),
                up_time: AtomicU64::new(0),
                registry: Mutex::new(Registry::default()),
                workers: Mutex::new(HashMap::new()),
                workers_idle: Condvar::new(),
                thread: OnceLock::new(),
            }),
        }
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[inline]
    #[must_use]
    pub fn allows_async(&self) -> bool {
        self.inner.allows_async
    }

    #[inline]
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    /// Sum of every delta passed to [`heartbeat`](Self::heartbeat)
    #[inline]
    #[must_use]
    pub fn up_time(&self) -> u64 {
        self.inner.up_time.load(Ordering::Acquire)
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    pub fn schedule<F>(&self, owner: &Owner, options: TaskOptions, body: F) -> SchedulerResult<TaskId>
    where
        F: FnMut(&TaskContext) -> TaskResult + Send + 'static,
    {
        self.schedule_runnable(owner, options, runnable(body))
    }

    pub fn schedule_runnable(
        &self,
        owner: &Owner,
        options: TaskOptions,
        body: Runnable,
    ) -> SchedulerResult<TaskId> {
        let task = Task::new(owner.clone(), options, body, self.up_time());
        self.submit(Arc::new(task))
    }

    /// Register a prepared task. Async one-shot tasks without delay start a
    /// worker right away; everything else waits in the queue.
    pub fn submit(&self, task: Arc<Task>) -> SchedulerResult<TaskId> {
        let id = task.id();
        let options = task.options();
        if !options.sync && !self.inner.allows_async {
            task.stop();
            return Err(SchedulerError::AsyncNotSupported(self.inner.name.clone()));
        }
        let immediate = !options.sync && options.delay == 0 && !options.is_repeating();

        {
            let mut registry = self.inner.registry.lock();
            if !self.is_alive() {
                task.stop();
                return Err(SchedulerError::ShutDown(self.inner.name.clone()));
            }
            registry.active.insert(id, Arc::clone(&task));
            if !immediate {
                registry.queue.push(Arc::clone(&task));
            }
        }

        if immediate {
            if let Err(err) = Inner::spawn_worker(&self.inner, Arc::clone(&task)) {
                task.stop();
                self.inner.registry.lock().active.remove(&id);
                return Err(err);
            }
        }
        Ok(id)
    }

    pub fn schedule_sync_delayed<F>(
        &self,
        owner: &Owner,
        delay: u64,
        priority: TaskPriority,
        body: F,
    ) -> SchedulerResult<TaskId>
    where
        F: FnMut(&TaskContext) -> TaskResult + Send + 'static,
    {
        self.schedule(owner, TaskOptions::sync().delay(delay).priority(priority), body)
    }

    pub fn schedule_sync_repeating<F>(
        &self,
        owner: &Owner,
        delay: u64,
        period: u64,
        priority: TaskPriority,
        body: F,
    ) -> SchedulerResult<TaskId>
    where
        F: FnMut(&TaskContext) -> TaskResult + Send + 'static,
    {
        let options = TaskOptions::sync().delay(delay).period(period).priority(priority);
        self.schedule(owner, options, body)
    }

    pub fn schedule_async<F>(&self, owner: &Owner, body: F) -> SchedulerResult<TaskId>
    where
        F: FnMut(&TaskContext) -> TaskResult + Send + 'static,
    {
        self.schedule(owner, TaskOptions::asynchronous(), body)
    }

    pub fn schedule_async_delayed<F>(
        &self,
        owner: &Owner,
        delay: u64,
        priority: TaskPriority,
        body: F,
    ) -> SchedulerResult<TaskId>
    where
        F: FnMut(&TaskContext) -> TaskResult + Send + 'static,
    {
        let options = TaskOptions::asynchronous().delay(delay).priority(priority);
        self.schedule(owner, options, body)
    }

    pub fn schedule_async_repeating<F>(
        &self,
        owner: &Owner,
        delay: u64,
        period: u64,
        priority: TaskPriority,
        body: F,
    ) -> SchedulerResult<TaskId>
    where
        F: FnMut(&TaskContext) -> TaskResult + Send + 'static,
    {
        let options = TaskOptions::asynchronous()
            .delay(delay)
            .period(period)
            .priority(priority);
        self.schedule(owner, options, body)
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Bind the manager to the calling thread. Returns `false` if it was
    /// already bound to another thread.
    pub fn bind_current_thread(&self) -> bool {
        let current = thread::current().id();
        *self.inner.thread.get_or_init(|| current) == current
    }

    /// Advance up-time by `delta` and run everything that became due.
    ///
    /// # Panics
    ///
    /// Panics when called from a thread other than the one the manager is
    /// bound to.
    pub fn heartbeat(&self, delta: u64) {
        assert!(
            self.bind_current_thread(),
            "task manager `{}` heartbeat from foreign thread {:?}",
            self.inner.name,
            thread::current().name().unwrap_or("<unnamed>")
        );

        let now = self.inner.up_time.fetch_add(delta, Ordering::AcqRel) + delta;
        let overloaded = self.inner.load.is_overloaded();

        loop {
            let Some(task) = self.inner.registry.lock().queue.pop_due(now) else {
                break;
            };
            if task.is_sync() {
                self.inner.run(&task, now, overloaded);
                self.inner.repeat_schedule(&task);
            } else if let Err(err) = Inner::spawn_worker(&self.inner, Arc::clone(&task)) {
                error!(manager = %self.inner.name, task = %task.id(), error = %err, "failed to start worker");
                task.stop();
                self.inner.repeat_schedule(&task);
            }
        }
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    /// Kill a task and interrupt its worker if one is running.
    /// The current execution, if any, is allowed to finish.
    pub fn cancel(&self, id: TaskId) -> bool {
        {
            let mut registry = self.inner.registry.lock();
            let Some(task) = registry.active.remove(&id) else {
                return false;
            };
            task.stop();
            registry.queue.remove(id);
        }
        if let Some(worker) = self.inner.workers.lock().get(&id) {
            worker.interrupt();
        }
        true
    }

    /// Cancel every task attributed to `owner`; returns how many were cancelled
    pub fn cancel_owner(&self, owner: &Owner) -> usize {
        let ids: Vec<TaskId> = {
            let registry = self.inner.registry.lock();
            registry
                .active
                .values()
                .filter(|task| task.owner() == owner)
                .map(|task| task.id())
                .collect()
        };
        ids.into_iter().filter(|&id| self.cancel(id)).count()
    }

    pub fn cancel_all(&self) -> usize {
        let ids: Vec<TaskId> = self.inner.registry.lock().active.keys().copied().collect();
        ids.into_iter().filter(|&id| self.cancel(id)).count()
    }

    /// Stop accepting work and cancel everything still registered
    pub fn shutdown(&self) -> usize {
        self.inner.alive.store(false, Ordering::Release);
        self.cancel_all()
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Whether the task is still registered (queued or executing)
    #[must_use]
    pub fn is_queued(&self, id: TaskId) -> bool {
        self.inner.registry.lock().active.contains_key(&id)
    }

    #[must_use]
    pub fn task(&self, id: TaskId) -> Option<Arc<Task>> {
        self.inner.registry.lock().active.get(&id).cloned()
    }

    /// Live tasks waiting in the queue, in call order
    #[must_use]
    pub fn pending_tasks(&self) -> Vec<Arc<Task>> {
        self.inner.registry.lock().queue.pending()
    }

    #[must_use]
    pub fn active_task_count(&self) -> usize {
        self.inner.registry.lock().active.len()
    }

    #[must_use]
    pub fn active_workers(&self) -> Vec<WorkerInfo> {
        self.inner.workers.lock().values().map(Worker::info).collect()
    }

    /// Block until no async worker is running or `timeout` elapses.
    /// Returns `true` if all workers finished.
    pub fn wait_for_async_tasks(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut workers = self.inner.workers.lock();
        while !workers.is_empty() {
            if self.inner.workers_idle.wait_until(&mut workers, deadline).timed_out() {
                return workers.is_empty();
            }
        }
        true
    }
}

impl fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.inner.registry.lock();
        f.debug_struct("TaskManager")
            .field("name", &self.inner.name)
            .field("up_time", &self.up_time())
            .field("active", &registry.active.len())
            .field("queue", &registry.queue)
            .field("workers", &self.inner.workers.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::task::QueueState;

    fn counter() -> (Arc<AtomicUsize>, Runnable) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let body = runnable(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (count, body)
    }

    #[test]
    fn test_delayed_task_runs_when_due() {
        let manager = TaskManager::new("test", false);
        let owner = Owner::from("plugin");
        let (count, body) = counter();
        let id = manager
            .schedule_sync_delayed(&owner, 3, TaskPriority::Critical, body)
            .expect("schedule");

        manager.heartbeat(2);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(manager.is_queued(id));

        manager.heartbeat(1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!manager.is_queued(id));
        assert!(manager.pending_tasks().is_empty());
    }

    #[test]
    fn test_sync_tasks_run_in_call_order() {
        let manager = TaskManager::new("test", false);
        let owner = Owner::from("plugin");
        let order = Arc::new(Mutex::new(Vec::new()));
        for (label, delay) in [("c", 3), ("a", 1), ("b", 2)] {
            let order = Arc::clone(&order);
            manager
                .schedule(&owner, TaskOptions::sync().delay(delay), move |_| {
                    order.lock().push(label);
                    Ok(())
                })
                .expect("schedule");
        }
        manager.heartbeat(5);
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cancel_by_owner() {
        let manager = TaskManager::new("test", false);
        let keep = Owner::from("keep");
        let doomed = Owner::from("doomed");
        let (kept, body) = counter();
        manager
            .schedule_sync_repeating(&keep, 0, 1, TaskPriority::Normal, body)
            .expect("schedule");
        for _ in 0..3 {
            let (_, body) = counter();
            manager
                .schedule_sync_repeating(&doomed, 0, 1, TaskPriority::Normal, body)
                .expect("schedule");
        }

        assert_eq!(manager.cancel_owner(&doomed), 3);
        assert_eq!(manager.pending_tasks().len(), 1);
        manager.heartbeat(1);
        assert_eq!(kept.load(Ordering::SeqCst), 1);
        assert_eq!(manager.active_task_count(), 1);
    }

    #[test]
    fn test_cancelled_task_is_dead() {
        let manager = TaskManager::new("test", false);
        let (count, body) = counter();
        let id = manager
            .schedule(&Owner::from("x"), TaskOptions::sync().delay(1), body)
            .expect("schedule");
        let task = manager.task(id).expect("registered");
        assert!(manager.cancel(id));
        assert!(!manager.cancel(id));
        assert_eq!(task.state(), QueueState::Dead);
        manager.heartbeat(10);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_async_rejected_on_unit_manager() {
        let manager = TaskManager::new("region", false);
        let err = manager
            .schedule_async(&Owner::from("x"), |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::AsyncNotSupported(ref name) if name == "region"));
        assert_eq!(manager.active_task_count(), 0);
    }

    #[test]
    fn test_shutdown_rejects_new_work() {
        let manager = TaskManager::new("main", true);
        let (_, body) = counter();
        manager
            .schedule_sync_repeating(&Owner::from("x"), 0, 1, TaskPriority::Normal, body)
            .expect("schedule");
        assert_eq!(manager.shutdown(), 1);
        let err = manager.schedule(&Owner::from("x"), TaskOptions::sync(), |_| Ok(())).unwrap_err();
        assert!(matches!(err, SchedulerError::ShutDown(_)));
    }

    #[test]
    fn test_async_delayed_runs_on_worker() {
        let manager = TaskManager::new("main", true);
        let caller = thread::current().id();
        let ran_elsewhere = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran_elsewhere);
        manager
            .schedule_async_delayed(&Owner::from("x"), 2, TaskPriority::Normal, move |_| {
                flag.store(thread::current().id() != caller, Ordering::SeqCst);
                Ok(())
            })
            .expect("schedule");

        manager.heartbeat(1);
        assert!(manager.active_workers().is_empty());
        manager.heartbeat(1);
        assert!(manager.wait_for_async_tasks(Duration::from_secs(5)));
        assert!(ran_elsewhere.load(Ordering::SeqCst));
        assert_eq!(manager.active_task_count(), 0);
    }

    #[test]
    fn test_cancel_interrupts_worker() {
        let manager = TaskManager::new("main", true);
        let id = manager
            .schedule_async(&Owner::from("x"), |ctx| {
                while !ctx.is_cancelled() {
                    thread::park_timeout(Duration::from_millis(10));
                }
                Ok(())
            })
            .expect("schedule");

        assert_eq!(manager.active_workers().len(), 1);
        assert!(manager.cancel(id));
        assert!(manager.wait_for_async_tasks(Duration::from_secs(5)));
        assert!(manager.active_workers().is_empty());
    }

    #[test]
    fn test_deferral_under_load() {
        let load = LoadSignal::default();
        let manager = TaskManager::with_load("test", false, load.clone(), 50);
        let (count, body) = counter();
        manager
            .schedule(&Owner::from("x"), TaskOptions::sync().priority(TaskPriority::Highest), body)
            .expect("schedule");

        load.set(true);
        manager.heartbeat(50);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        load.set(false);
        manager.heartbeat(50);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_heartbeat_from_foreign_thread_panics() {
        let manager = TaskManager::new("bound", false);
        manager.heartbeat(1);
        let other = manager.clone();
        let result = thread::spawn(move || other.heartbeat(1)).join();
        assert!(result.is_err());
    }
}
