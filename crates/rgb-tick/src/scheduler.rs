//! The tick engine
//!
//! One pulse:
//!
//! ```text
//! TickStart   apply topology, main heartbeat, spatial-task heartbeat
//! Stage(k)    start_tick(k) on every unit that wants stage k, join all
//! Finalize    finalize_tick on every unit, join all
//! ── snapshot write lock ──────────────────────────────────────────────
//! PreSnapshot pre_snapshot on every unit, join all
//! Snapshot    copy_snapshot on every unit, join all, run core tasks
//! ── unlock ───────────────────────────────────────────────────────────
//! sleep for the rest of the period (none if the pulse overran)
//! ```

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};

use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::diagnostics::{self, Backoff};
use crate::error::{SchedulerError, SchedulerResult, TaskFailure, TaskResult};
use crate::lock::SnapshotLock;
use crate::manager::{LoadSignal, TaskManager};
use crate::parallel::{ParallelTask, ParallelTaskCoordinator};
use crate::priority::TaskPriority;
use crate::registry::{TopologyChanges, UnitRegistry};
use crate::stage::{TickContext, TickStage};
use crate::task::{Owner, Runnable, Task, TaskContext, TaskId, TaskOptions};
use crate::unit::{ExecutorState, UnitExecutor, UnitId, UnitManager};
use crate::worker::WorkerInfo;

/// Closure run once by the scheduler outside of the task system
pub type DeferredTask = Box<dyn FnOnce() + Send + 'static>;

type Refusal = (Arc<UnitExecutor>, SchedulerError);

struct Inner {
    config: SchedulerConfig,
    task_manager: TaskManager,
    parallel: ParallelTaskCoordinator,
    units: UnitRegistry,
    snapshot_lock: SnapshotLock,
    load: LoadSignal,
    running: AtomicBool,
    terminated: AtomicBool,
    tick_count: AtomicU64,
    tick_start: Mutex<Instant>,
    main_thread: Mutex<Option<Thread>>,
    core_tasks: SegQueue<DeferredTask>,
    last_tick_tasks: SegQueue<DeferredTask>,
    final_tasks: Mutex<VecDeque<DeferredTask>>,
}

impl Inner {
    // ========================================================================
    // Pulse
    // ========================================================================

    fn pulse(&self, delta: u64) {
        let tick = self.tick_count.fetch_add(1, Ordering::AcqRel) + 1;
        let ctx = TickContext::new(TickStage::TickStart, delta, tick);

        self.apply_topology();
        self.task_manager.heartbeat(delta);
        let mut units = self.units.units();
        self.parallel.heartbeat(&units);

        let mut stage = 0;
        loop {
            let participants: Vec<Arc<UnitExecutor>> =
                units.iter().filter(|unit| stage < unit.stages()).cloned().collect();
            if participants.is_empty() {
                break;
            }
            let refused = self.drive(&participants, ctx.with_stage(TickStage::Stage(stage)), |unit, ctx| {
                unit.start_tick(stage, ctx)
            });
            self.evict(&mut units, refused);
            stage += 1;
        }

        let refused = self.drive(&units, ctx.with_stage(TickStage::Finalize), UnitExecutor::finalize_tick);
        self.evict(&mut units, refused);

        self.lock_snapshot();
        self.snapshot(&mut units, ctx);
        self.snapshot_lock.write_unlock();
    }

    fn snapshot(&self, units: &mut Vec<Arc<UnitExecutor>>, ctx: TickContext) {
        let refused = self.drive(units, ctx.with_stage(TickStage::PreSnapshot), UnitExecutor::pre_snapshot);
        self.evict(units, refused);
        let refused = self.drive(units, ctx.with_stage(TickStage::Snapshot), UnitExecutor::copy_snapshot);
        self.evict(units, refused);
        while let Some(task) = self.core_tasks.pop() {
            run_contained("core task", task);
        }
    }

    /// Hand `ctx.stage()` to every unit, then wait for all of them.
    /// Units that refused the handoff are returned and not waited on.
    fn drive<F>(&self, units: &[Arc<UnitExecutor>], ctx: TickContext, op: F) -> Vec<Refusal>
    where
        F: Fn(&UnitExecutor, TickContext) -> SchedulerResult<()>,
    {
        debug_assert_eq!(
            ctx.stage().allows_live_mutation(),
            !self.snapshot_lock.is_write_locked(),
            "{} handed out with the wrong snapshot lock state",
            ctx.stage()
        );
        let mut refused = Vec::new();
        let mut started = Vec::with_capacity(units.len());
        for unit in units {
            match op(unit, ctx) {
                Ok(()) => started.push(Arc::clone(unit)),
                Err(err) => refused.push((Arc::clone(unit), err)),
            }
        }
        let retries =
            diagnostics::join_with_retry(&started, ctx.stage(), self.config.stage_join_timeout());
        if retries > 0 {
            warn!(stage = %ctx.stage(), tick = ctx.tick(), retries, "stage completed after retries");
        }
        refused
    }

    /// Drop refusing units from the rest of this pulse. A unit that has
    /// halted also leaves the topology, taking its spatial children with it.
    fn evict(&self, units: &mut Vec<Arc<UnitExecutor>>, refused: Vec<Refusal>) {
        for (unit, err) in refused {
            units.retain(|live| live.id() != unit.id());
            if matches!(unit.state(), ExecutorState::Halting | ExecutorState::Halted) {
                warn!(unit = %unit.name(), id = %unit.id(), error = %err, "evicting halted unit");
                self.parallel.unregister_unit(unit.id());
                self.units.remove(unit.id());
            } else {
                error!(unit = %unit.name(), id = %unit.id(), error = %err, "unit refused tick phase");
            }
        }
    }

    fn apply_topology(&self) -> TopologyChanges {
        let changes = self.units.apply();
        if changes.is_empty() {
            return changes;
        }
        for unit in &changes.added {
            self.parallel.register_unit(unit);
            info!(unit = %unit.name(), id = %unit.id(), "unit added");
        }
        for unit in &changes.removed {
            self.parallel.unregister_unit(unit.id());
            unit.halt_executor();
            info!(unit = %unit.name(), id = %unit.id(), "unit removed");
        }
        debug!(
            added = changes.added.len(),
            removed = changes.removed.len(),
            live = self.units.len(),
            "topology changed"
        );
        changes
    }

    /// Take the write lock, growing the timeout and naming the holders on
    /// every failed attempt.
    fn lock_snapshot(&self) {
        let started = Instant::now();
        let threshold = self.config.lock_violation_threshold();
        let mut backoff = Backoff::from_config(&self.config);
        let mut attempt = 0_u32;

        while !self.snapshot_lock.write_lock(backoff.current()) {
            attempt += 1;
            let stalled = started.elapsed();
            warn!(
                attempt,
                stalled_ms = stalled.as_millis() as u64,
                timeout_ms = backoff.current().as_millis() as u64,
                "unable to lock snapshot"
            );
            for holder in self.snapshot_lock.locking_owners(threshold) {
                warn!(
                    owner = %holder.owner,
                    held_ms = holder.held_for.as_millis() as u64,
                    threshold_ms = threshold.as_millis() as u64,
                    count = holder.count,
                    "owner has held the snapshot lock past the threshold"
                );
            }
            for task in self.snapshot_lock.locking_tasks() {
                warn!(task = %task, "core task is holding the snapshot lock");
            }
            if stalled > self.config.stall_dump_after() {
                for thread in self.snapshot_lock.core_locking_threads() {
                    warn!(thread = %thread, "thread is holding a core snapshot lock");
                }
            }
            backoff.advance();
        }
    }

    // ========================================================================
    // Main loop
    // ========================================================================

    fn run_loop(&self) {
        let period = self.config.pulse();
        let behind_limit = Duration::from_millis(self.config.behind_schedule_warn_ms);
        let mut last_start = Instant::now();
        let mut behind = Duration::ZERO;

        info!(pulse_ms = self.config.pulse_ms, "scheduler started");
        while self.running.load(Ordering::Acquire) {
            let start = Instant::now();
            *self.tick_start.lock() = start;
            let delta = start.duration_since(last_start).as_millis() as u64;
            last_start = start;

            self.pulse(delta);

            let elapsed = start.elapsed();
            self.load.set(elapsed > period);
            if let Some(remaining) = period.checked_sub(elapsed) {
                behind = Duration::ZERO;
                let wake = Instant::now() + remaining;
                while self.running.load(Ordering::Acquire) {
                    let Some(left) = wake.checked_duration_since(Instant::now()) else {
                        break;
                    };
                    thread::park_timeout(left);
                }
            } else {
                behind += elapsed - period;
                debug!(elapsed_ms = elapsed.as_millis() as u64, "pulse overran its period");
                if behind > behind_limit {
                    warn!(
                        behind_ms = behind.as_millis() as u64,
                        "can't keep up! is the server overloaded?"
                    );
                    behind = Duration::ZERO;
                }
            }
        }
        self.shutdown_sequence();
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    fn shutdown_sequence(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("scheduler shutting down");
        self.load.set(false);
        self.apply_topology();

        let ctx = TickContext::new(
            TickStage::Shutdown,
            0,
            self.tick_count.load(Ordering::Acquire),
        );
        let units = self.units.units();
        let (primary, others): (Vec<_>, Vec<_>) = units.iter().cloned().partition(|u| u.is_primary());

        for unit in &others {
            unit.halt_executor();
        }
        diagnostics::join_with_retry(&others, TickStage::Shutdown, self.config.stage_join_timeout());

        self.lock_snapshot();
        for (unit, err) in self
            .drive(&units, ctx.with_stage(TickStage::PreSnapshot), UnitExecutor::pre_snapshot)
            .into_iter()
            .chain(self.drive(&units, ctx.with_stage(TickStage::Snapshot), UnitExecutor::copy_snapshot))
        {
            debug!(unit = %unit.name(), error = %err, "unit skipped final snapshot");
        }
        self.snapshot_lock.write_unlock();

        for unit in &primary {
            unit.halt_executor();
        }
        diagnostics::join_with_retry(&units, TickStage::Shutdown, self.config.stage_join_timeout());

        self.task_manager.heartbeat(self.config.pulse_ms * 4);
        self.task_manager.shutdown();
        self.parallel.cancel_all();
        self.drain_async_workers();

        while let Some(task) = self.last_tick_tasks.pop() {
            run_contained("last-tick task", task);
        }
        loop {
            let Some(task) = self.final_tasks.lock().pop_front() else {
                break;
            };
            run_contained("final task", task);
        }
        info!(ticks = self.tick_count.load(Ordering::Acquire), "scheduler stopped");
    }

    fn drain_async_workers(&self) {
        let max = Duration::from_millis(self.config.shutdown_wait_max_ms);
        let mut wait = Duration::from_millis(self.config.shutdown_wait_ms).min(max);
        while !self.task_manager.wait_for_async_tasks(wait) {
            let workers = self.task_manager.active_workers();
            if workers.is_empty() {
                break;
            }
            warn!(
                count = workers.len(),
                waited_ms = wait.as_millis() as u64,
                "async tasks are still running"
            );
            for worker in &workers {
                warn!(
                    task = %worker.task,
                    owner = %worker.owner,
                    thread = %worker.thread,
                    running_ms = worker.running_for.as_millis() as u64,
                    "async worker still running"
                );
            }
            wait = (wait * 2).min(max);
        }
    }
}

fn run_contained(kind: &'static str, task: DeferredTask) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
        error!(kind, error = %TaskFailure::from_panic(payload), "scheduled closure panicked");
    }
}

/// Top-level tick engine
///
/// Owns the main [`TaskManager`], the [`ParallelTaskCoordinator`], the set of
/// execution units and the [`SnapshotLock`]. It can be driven from a
/// dedicated thread ([`start`](Self::start) / [`stop`](Self::stop)) or pulse
/// by pulse with [`tick`](Self::tick).
pub struct GlobalScheduler {
    inner: Arc<Inner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl GlobalScheduler {
    pub fn new(config: SchedulerConfig) -> SchedulerResult<Self> {
        config.validate()?;
        let load = LoadSignal::default();
        Ok(Self {
            inner: Arc::new(Inner {
                task_manager: TaskManager::with_load("main", true, load.clone(), config.pulse_ms),
                parallel: ParallelTaskCoordinator::new(config.prune_interval_ticks),
                units: UnitRegistry::new(),
                snapshot_lock: SnapshotLock::new(),
                load,
                running: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
                tick_count: AtomicU64::new(0),
                tick_start: Mutex::new(Instant::now()),
                main_thread: Mutex::new(None),
                core_tasks: SegQueue::new(),
                last_tick_tasks: SegQueue::new(),
                final_tasks: Mutex::new(VecDeque::new()),
                config,
            }),
            handle: Mutex::new(None),
        })
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Spawn the scheduler thread and start pulsing
    pub fn start(&self) -> SchedulerResult<()> {
        let mut handle = self.handle.lock();
        if handle.is_some() || self.inner.terminated.load(Ordering::Acquire) {
            return Err(SchedulerError::AlreadyStarted("scheduler".to_string()));
        }
        self.inner.running.store(true, Ordering::Release);
        let inner = Arc::clone(&self.inner);
        let name = "scheduler-main".to_string();
        let spawned = thread::Builder::new()
            .name(name.clone())
            .spawn(move || inner.run_loop())
            .map_err(|source| SchedulerError::Spawn { name, source })?;
        *self.inner.main_thread.lock() = Some(spawned.thread().clone());
        *handle = Some(spawned);
        Ok(())
    }

    /// Ask the scheduler thread to finish its pulse and shut down
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::Release);
        if let Some(thread) = self.inner.main_thread.lock().as_ref() {
            thread.unpark();
        }
    }

    /// Wait for the scheduler thread to complete its shutdown sequence
    pub fn join(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        if handle.join().is_err() {
            error!("scheduler thread panicked");
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Run one pulse on the calling thread. Units that refuse a phase are
    /// evicted; the pulse itself only fails if the scheduler cannot tick.
    pub fn tick(&self, delta: u64) -> SchedulerResult<()> {
        if self.inner.terminated.load(Ordering::Acquire) {
            return Err(SchedulerError::ShutDown("scheduler".to_string()));
        }
        if self.handle.lock().is_some() {
            return Err(SchedulerError::AlreadyStarted("scheduler".to_string()));
        }
        *self.inner.tick_start.lock() = Instant::now();
        self.inner.pulse(delta);
        Ok(())
    }

    /// Halt every unit and drain all work. With a scheduler thread running
    /// this is `stop` + `join`; otherwise the sequence runs on the calling
    /// thread, which must be the one that has been calling [`tick`](Self::tick).
    pub fn shutdown(&self) {
        if self.handle.lock().is_some() {
            self.stop();
            self.join();
        } else {
            self.inner.shutdown_sequence();
        }
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::Acquire)
    }

    // ========================================================================
    // Topology
    // ========================================================================

    /// Start a unit for `manager`; it joins at the next pulse
    pub fn add_unit(&self, manager: impl UnitManager) -> SchedulerResult<Arc<UnitExecutor>> {
        self.add_built(Box::new(manager), false)
    }

    /// Like [`add_unit`](Self::add_unit), for the unit halted last on shutdown
    pub fn add_primary_unit(&self, manager: impl UnitManager) -> SchedulerResult<Arc<UnitExecutor>> {
        self.add_built(Box::new(manager), true)
    }

    fn add_built(&self, manager: Box<dyn UnitManager>, primary: bool) -> SchedulerResult<Arc<UnitExecutor>> {
        let unit = UnitExecutor::build(manager, primary, self.inner.load.clone(), self.inner.config.pulse_ms);
        self.add_executor(Arc::clone(&unit))?;
        Ok(unit)
    }

    /// Register an existing executor, starting it if needed. A halted
    /// executor cannot rejoin.
    pub fn add_executor(&self, unit: Arc<UnitExecutor>) -> SchedulerResult<()> {
        match unit.state() {
            ExecutorState::Halting | ExecutorState::Halted => {
                return Err(SchedulerError::Halted(unit.name().to_string()));
            }
            ExecutorState::Created => match unit.start() {
                Ok(()) | Err(SchedulerError::AlreadyStarted(_)) => {}
                Err(err) => return Err(err),
            },
            ExecutorState::Started => {}
        }
        self.inner.units.add(unit);
        Ok(())
    }

    /// Remove and halt a unit at the next pulse
    pub fn remove_unit(&self, unit: UnitId) {
        self.inner.units.remove(unit);
    }

    #[must_use]
    pub fn units(&self) -> Vec<Arc<UnitExecutor>> {
        self.inner.units.units()
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    /// Schedule on the main task manager (sync tasks run on the scheduler thread)
    pub fn schedule<F>(&self, owner: &Owner, options: TaskOptions, body: F) -> SchedulerResult<TaskId>
    where
        F: FnMut(&TaskContext) -> TaskResult + Send + 'static,
    {
        self.inner.task_manager.schedule(owner, options, body)
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
        self.inner
            .task_manager
            .schedule_sync_delayed(owner, delay, priority, body)
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
        self.inner
            .task_manager
            .schedule_sync_repeating(owner, delay, period, priority, body)
    }

    pub fn schedule_async<F>(&self, owner: &Owner, body: F) -> SchedulerResult<TaskId>
    where
        F: FnMut(&TaskContext) -> TaskResult + Send + 'static,
    {
        self.inner.task_manager.schedule_async(owner, body)
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
        self.inner
            .task_manager
            .schedule_async_delayed(owner, delay, priority, body)
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
        self.inner
            .task_manager
            .schedule_async_repeating(owner, delay, period, priority, body)
    }

    /// Schedule a spatial task: one child per execution unit
    pub fn schedule_parallel<F>(&self, owner: &Owner, options: TaskOptions, factory: F) -> SchedulerResult<TaskId>
    where
        F: Fn(&UnitExecutor, &ParallelTask) -> Runnable + Send + Sync + 'static,
    {
        self.inner.parallel.schedule(owner, options, factory)
    }

    /// Run on the scheduler thread at the end of the next snapshot phase,
    /// while the snapshot lock is held
    pub fn schedule_core_task(&self, task: impl FnOnce() + Send + 'static) {
        self.inner.core_tasks.push(Box::new(task));
    }

    /// Run once during shutdown, after async tasks have drained
    pub fn submit_last_tick_task(&self, task: impl FnOnce() + Send + 'static) {
        self.inner.last_tick_tasks.push(Box::new(task));
    }

    /// Run at the very end of shutdown
    pub fn submit_final_task(&self, task: impl FnOnce() + Send + 'static, to_front: bool) {
        let mut tasks = self.inner.final_tasks.lock();
        if to_front {
            tasks.push_front(Box::new(task));
        } else {
            tasks.push_back(Box::new(task));
        }
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    pub fn cancel_task(&self, id: TaskId) -> bool {
        self.inner.task_manager.cancel(id) || self.inner.parallel.cancel(id)
    }

    pub fn cancel_tasks(&self, owner: &Owner) -> usize {
        self.inner.task_manager.cancel_owner(owner) + self.inner.parallel.cancel_owner(owner)
    }

    pub fn cancel_all_tasks(&self) -> usize {
        self.inner.task_manager.cancel_all() + self.inner.parallel.cancel_all()
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    #[must_use]
    pub fn active_workers(&self) -> Vec<WorkerInfo> {
        self.inner.task_manager.active_workers()
    }

    #[must_use]
    pub fn pending_tasks(&self) -> Vec<Arc<Task>> {
        self.inner.task_manager.pending_tasks()
    }

    #[must_use]
    pub fn is_queued(&self, id: TaskId) -> bool {
        self.inner.task_manager.is_queued(id) || self.inner.parallel.is_registered(id)
    }

    #[must_use]
    pub fn up_time(&self) -> u64 {
        self.inner.task_manager.up_time()
    }

    #[must_use]
    pub fn tick_count(&self) -> u64 {
        self.inner.tick_count.load(Ordering::Acquire)
    }

    #[inline]
    #[must_use]
    pub fn task_manager(&self) -> &TaskManager {
        &self.inner.task_manager
    }

    #[inline]
    #[must_use]
    pub fn parallel(&self) -> &ParallelTaskCoordinator {
        &self.inner.parallel
    }

    #[inline]
    #[must_use]
    pub fn snapshot_lock(&self) -> &SnapshotLock {
        &self.inner.snapshot_lock
    }

    /// Time since the current pulse started
    #[must_use]
    pub fn tick_time(&self) -> Duration {
        self.inner.tick_start.lock().elapsed()
    }

    /// Milliseconds left in the current pulse's budget; negative once overrun
    #[must_use]
    pub fn remaining_tick_time(&self) -> i64 {
        self.inner.config.pulse_ms as i64 - self.tick_time().as_millis() as i64
    }

    /// Whether the previous pulse overran, or the current one is past its
    /// budget by more than the configured grace
    pub fn is_overloaded(&self) -> bool {
        if self.inner.load.is_overloaded() {
            return true;
        }
        if self.remaining_tick_time() < -(self.inner.config.overload_grace_ms as i64) {
            self.inner.load.set(true);
            return true;
        }
        false
    }

    // ========================================================================
    // Safe execution
    // ========================================================================

    /// Run `f` holding snapshot read access attributed to `owner`; panics are
    /// contained
    pub fn safe_call<R>(&self, owner: &Owner, f: impl FnOnce() -> R) -> Result<R, TaskFailure> {
        let _guard = self.inner.snapshot_lock.read(owner);
        panic::catch_unwind(AssertUnwindSafe(f)).map_err(TaskFailure::from_panic)
    }

    /// Like [`safe_call`](Self::safe_call) for fallible closures; failures are
    /// logged. Returns `true` on success.
    pub fn safe_run(&self, owner: &Owner, f: impl FnOnce() -> TaskResult) -> bool {
        let failure = match self.safe_call(owner, f) {
            Ok(Ok(())) => return true,
            Ok(Err(err)) => TaskFailure::Failed(err),
            Err(failure) => failure,
        };
        error!(owner = %owner, error = %failure, "safe run failed");
        false
    }

    /// Run `f` holding core read access attributed to `task_name`
    pub fn core_safe_run(&self, task_name: &str, f: impl FnOnce() -> TaskResult) -> bool {
        let lock = &self.inner.snapshot_lock;
        lock.core_read_lock(task_name);
        let result = panic::catch_unwind(AssertUnwindSafe(f));
        lock.core_read_unlock(task_name);
        let failure = match result {
            Ok(Ok(())) => return true,
            Ok(Err(err)) => TaskFailure::Failed(err),
            Err(payload) => TaskFailure::from_panic(payload),
        };
        error!(task = task_name, error = %failure, "core safe run failed");
        false
    }
}

impl Drop for GlobalScheduler {
    fn drop(&mut self) {
        if self.handle.lock().is_some() {
            self.stop();
            self.join();
        }
    }
}

impl std::fmt::Debug for GlobalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalScheduler")
            .field("ticks", &self.tick_count())
            .field("units", &self.inner.units.len())
            .field("running", &self.is_running())
            .field("task_manager", &self.inner.task_manager)
            .field("parallel", &self.inner.parallel)
            .finish_non_exhaustive()
    }
}
