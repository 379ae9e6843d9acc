//! Execution units
//!
//! An execution unit is a simulation partition (a region, or the server
//! itself) stepped through each pulse on its own thread. Application logic
//! plugs in through [`UnitManager`]; the scheduler talks to the
//! [`UnitExecutor`] handle, which hands phases to the unit thread and lets the
//! scheduler join on their completion.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::error::{SchedulerError, SchedulerResult, TaskFailure, TaskResult};
use crate::lock;
use crate::manager::{DEFAULT_DEFER_STEP, LoadSignal, TaskManager};
use crate::stage::{TickContext, TickStage};

static NEXT_UNIT_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identifier of an execution unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(u64);

impl UnitId {
    fn next() -> Self {
        Self(NEXT_UNIT_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit#{}", self.0)
    }
}

/// Application hooks of an execution unit
///
/// Every hook runs on the unit's own thread. Hooks may mutate live state in
/// [`start_tick_run`](Self::start_tick_run) and
/// [`finalize_run`](Self::finalize_run) only; the pre-snapshot hook gets a
/// shared reference, and [`copy_snapshot_run`](Self::copy_snapshot_run) is the
/// sole writer of stable state.
pub trait UnitManager: Send + 'static {
    fn name(&self) -> &str;

    /// Number of parallel stages this unit wants in the current pulse
    fn stages(&self) -> u32 {
        1
    }

    fn start_tick_run(&mut self, ctx: &TickContext) -> TaskResult;

    fn finalize_run(&mut self, _ctx: &TickContext) -> TaskResult {
        Ok(())
    }

    fn pre_snapshot_run(&self, _ctx: &TickContext) -> TaskResult {
        Ok(())
    }

    fn copy_snapshot_run(&mut self, _ctx: &TickContext) -> TaskResult {
        Ok(())
    }

    fn halt_run(&mut self) {}
}

/// Lifecycle of a unit executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExecutorState {
    Created = 0,
    Started = 1,
    Halting = 2,
    Halted = 3,
}

impl ExecutorState {
    #[inline]
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Started,
            2 => Self::Halting,
            _ => Self::Halted,
        }
    }
}

enum Command {
    Run(TickContext),
    Wake,
}

#[derive(Default)]
struct Pending {
    outstanding: bool,
    current: Option<(TickStage, Instant)>,
}

struct Shared {
    id: UnitId,
    name: String,
    primary: bool,
    manager: Mutex<Box<dyn UnitManager>>,
    task_manager: TaskManager,
    state: AtomicU8,
    pending: Mutex<Pending>,
    idle: Condvar,
}

impl Shared {
    fn state(&self) -> ExecutorState {
        ExecutorState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: ExecutorState, to: ExecutorState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn run(&self, receiver: &Receiver<Command>) {
        lock::exempt_current_thread();
        self.task_manager.bind_current_thread();
        debug!(unit = %self.name, id = %self.id, "executor started");

        loop {
            let disconnected = match receiver.recv() {
                Ok(Command::Run(ctx)) => {
                    self.run_phase(ctx);
                    false
                }
                Ok(Command::Wake) => false,
                Err(_) => true,
            };

            let halting = disconnected || self.state() == ExecutorState::Halting;
            if halting {
                self.manager.lock().halt_run();
                self.task_manager.shutdown();
            }

            let mut pending = self.pending.lock();
            if halting {
                self.state.store(ExecutorState::Halted as u8, Ordering::Release);
            }
            pending.outstanding = false;
            pending.current = None;
            self.idle.notify_all();
            if halting {
                break;
            }
        }
        debug!(unit = %self.name, id = %self.id, "executor halted");
    }

    fn run_phase(&self, ctx: TickContext) {
        if ctx.stage_index() == Some(0) {
            self.task_manager.heartbeat(ctx.delta());
        }
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut manager = self.manager.lock();
            match ctx.stage() {
                TickStage::Stage(_) => manager.start_tick_run(&ctx),
                TickStage::Finalize => manager.finalize_run(&ctx),
                TickStage::PreSnapshot => manager.pre_snapshot_run(&ctx),
                TickStage::Snapshot => manager.copy_snapshot_run(&ctx),
                TickStage::TickStart | TickStage::Shutdown => Ok(()),
            }
        }));
        let failure = match result {
            Ok(Ok(())) => return,
            Ok(Err(err)) => TaskFailure::Failed(err),
            Err(payload) => TaskFailure::from_panic(payload),
        };
        error!(unit = %self.name, stage = %ctx.stage(), tick = ctx.tick(), error = %failure, "unit phase failed");
    }
}

/// Handle to an execution unit and its thread
pub struct UnitExecutor {
    shared: Arc<Shared>,
    sender: Sender<Command>,
    receiver: Mutex<Option<Receiver<Command>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl UnitExecutor {
    pub fn new(manager: impl UnitManager) -> Arc<Self> {
        Self::build(Box::new(manager), false, LoadSignal::default(), DEFAULT_DEFER_STEP)
    }

    /// The unit halted last during shutdown (typically the server itself)
    pub fn primary(manager: impl UnitManager) -> Arc<Self> {
        Self::build(Box::new(manager), true, LoadSignal::default(), DEFAULT_DEFER_STEP)
    }

    pub fn build(
        manager: Box<dyn UnitManager>,
        primary: bool,
        load: LoadSignal,
        defer_step: u64,
    ) -> Arc<Self> {
        let name = manager.name().to_string();
        let (sender, receiver) = crossbeam_channel::unbounded();
        Arc::new(Self {
            shared: Arc::new(Shared {
                id: UnitId::next(),
                task_manager: TaskManager::with_load(name.clone(), false, load, defer_step),
                name,
                primary,
                manager: Mutex::new(manager),
                state: AtomicU8::new(ExecutorState::Created as u8),
                pending: Mutex::new(Pending::default()),
                idle: Condvar::new(),
            }),
            sender,
            receiver: Mutex::new(Some(receiver)),
            thread: Mutex::new(None),
        })
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> UnitId {
        self.shared.id
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    #[inline]
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.shared.primary
    }

    /// Task manager whose sync tasks run on this unit's thread
    #[inline]
    #[must_use]
    pub fn task_manager(&self) -> &TaskManager {
        &self.shared.task_manager
    }

    #[must_use]
    pub fn state(&self) -> ExecutorState {
        self.shared.state()
    }

    /// Parallel stages requested for the current pulse
    #[must_use]
    pub fn stages(&self) -> u32 {
        self.shared.manager.lock().stages()
    }

    /// Run `f` against the unit's application logic
    pub fn with_manager<R>(&self, f: impl FnOnce(&mut dyn UnitManager) -> R) -> R {
        f(self.shared.manager.lock().as_mut())
    }

    /// Spawn the unit thread
    pub fn start(&self) -> SchedulerResult<()> {
        if !self.shared.transition(ExecutorState::Created, ExecutorState::Started) {
            return Err(SchedulerError::AlreadyStarted(self.shared.name.clone()));
        }
        let Some(receiver) = self.receiver.lock().take() else {
            return Err(SchedulerError::AlreadyStarted(self.shared.name.clone()));
        };
        let name = format!("unit-{}", self.shared.name);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || shared.run(&receiver))
            .map_err(|source| {
                self.shared
                    .state
                    .store(ExecutorState::Halted as u8, Ordering::Release);
                SchedulerError::Spawn { name, source }
            })?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    // ========================================================================
    // Phase handoff
    // ========================================================================

    /// Begin parallel stage `stage` on the unit thread; returns immediately
    pub fn start_tick(&self, stage: u32, ctx: TickContext) -> SchedulerResult<()> {
        self.pulse(ctx.with_stage(TickStage::Stage(stage)))
    }

    pub fn finalize_tick(&self, ctx: TickContext) -> SchedulerResult<()> {
        self.pulse(ctx.with_stage(TickStage::Finalize))
    }

    pub fn pre_snapshot(&self, ctx: TickContext) -> SchedulerResult<()> {
        self.pulse(ctx.with_stage(TickStage::PreSnapshot))
    }

    pub fn copy_snapshot(&self, ctx: TickContext) -> SchedulerResult<()> {
        self.pulse(ctx.with_stage(TickStage::Snapshot))
    }

    fn pulse(&self, ctx: TickContext) -> SchedulerResult<()> {
        let mut pending = self.shared.pending.lock();
        match self.state() {
            ExecutorState::Started | ExecutorState::Halting => {}
            ExecutorState::Created => return Err(SchedulerError::NotStarted(self.shared.name.clone())),
            ExecutorState::Halted => return Err(SchedulerError::Halted(self.shared.name.clone())),
        }
        if pending.outstanding {
            return Err(SchedulerError::PulseRejected {
                unit: self.shared.name.clone(),
                stage: ctx.stage(),
            });
        }
        if self.sender.send(Command::Run(ctx)).is_err() {
            return Err(SchedulerError::Halted(self.shared.name.clone()));
        }
        pending.outstanding = true;
        pending.current = Some((ctx.stage(), Instant::now()));
        Ok(())
    }

    /// Ask the unit to halt after its current operation.
    /// Returns `false` if it was already halting or halted.
    pub fn halt_executor(&self) -> bool {
        if self.shared.transition(ExecutorState::Created, ExecutorState::Halted) {
            self.shared.task_manager.shutdown();
            return true;
        }
        if self.shared.transition(ExecutorState::Started, ExecutorState::Halting) {
            // the thread may be idle in recv
            let _ = self.sender.send(Command::Wake);
            return true;
        }
        false
    }

    // ========================================================================
    // Joining
    // ========================================================================

    /// Whether the last handed-off phase (or a requested halt) has completed
    #[must_use]
    pub fn is_pulse_finished(&self) -> bool {
        let pending = self.shared.pending.lock();
        !pending.outstanding && self.state() != ExecutorState::Halting
    }

    /// Wait until [`is_pulse_finished`](Self::is_pulse_finished) or `deadline`
    pub fn pulse_join(&self, deadline: Instant) -> bool {
        let mut pending = self.shared.pending.lock();
        while pending.outstanding || self.state() == ExecutorState::Halting {
            if self.shared.idle.wait_until(&mut pending, deadline).timed_out() {
                return !pending.outstanding && self.state() != ExecutorState::Halting;
            }
        }
        true
    }

    /// Stage currently running on the unit thread and for how long
    #[must_use]
    pub fn current_phase(&self) -> Option<(TickStage, Duration)> {
        self.shared
            .pending
            .lock()
            .current
            .map(|(stage, started)| (stage, started.elapsed()))
    }
}

impl fmt::Debug for UnitExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitExecutor")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("primary", &self.shared.primary)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
