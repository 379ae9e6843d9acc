#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::type_complexity)]

//! Tick-staged scheduler for RGB execution units
//!
//! Drives a simulation forward in fixed-period pulses. Every pulse moves all
//! execution units (spatial regions, the server itself) through the same
//! sequence of phases, with a barrier after each one:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                           GlobalScheduler                             │
//! │  TickStart: main TaskManager heartbeat, spatial-task fan-out          │
//! ├───────────────┬───────────────┬───────────────┬───────────────────────┤
//! │   unit A      │   unit B      │   unit C      │                       │
//! │  Stage(0) ────┼── Stage(0) ───┼── Stage(0)    │ ← join barrier        │
//! │  Stage(1) ────┼── Stage(1)    │               │ ← join barrier        │
//! │  Finalize ────┼── Finalize ───┼── Finalize    │ ← join barrier        │
//! ├───────────────┴───────────────┴───────────────┴───────────────────────┤
//! │  SnapshotLock (write)                                                 │
//! │  PreSnapshot (read-only) → Snapshot (live → stable copy) → core tasks │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Tasks
//!
//! - **Sync** tasks run on the thread of the [`TaskManager`] they were
//!   scheduled on: the scheduler thread for the main manager, the unit thread
//!   for a unit's manager (heartbeat at the start of stage 0).
//! - **Async** tasks run on a fresh [`Worker`] thread each time they are due.
//! - **Spatial** tasks are registered once with the
//!   [`ParallelTaskCoordinator`] and replicated onto every unit.
//!
//! Tasks may be delayed, repeating, and deferred under overload within the
//! budget of their [`TaskPriority`].
//!
//! # Example
//!
//! ```ignore
//! let scheduler = GlobalScheduler::new(SchedulerConfig::default())?;
//! scheduler.add_unit(Region::new("region(0,0)"))?;
//! scheduler.schedule_sync_repeating(&Owner::from("autosave"), 0, 6000, TaskPriority::Low, |_| {
//!     save_world()
//! })?;
//! scheduler.start()?;
//! ```

mod config;
mod diagnostics;
mod error;
mod lock;
mod manager;
mod parallel;
mod priority;
mod queue;
mod registry;
mod scheduler;
mod stage;
mod task;
mod unit;
mod worker;

pub use config::{ENV_PREFIX, SchedulerConfig};
pub use diagnostics::{Backoff, check_deadlocks, join_units, join_with_retry};
pub use error::{
    ConfigError, SchedulerError, SchedulerResult, StageTimeout, StalledUnit, TaskError, TaskFailure,
    TaskResult,
};
pub use lock::{LockHolder, ReadGuard, SnapshotLock};
pub use manager::{DEFAULT_DEFER_STEP, LoadSignal, TaskManager};
pub use parallel::{ParallelFactory, ParallelTask, ParallelTaskCoordinator};
pub use priority::TaskPriority;
pub use queue::TaskQueue;
pub use registry::{TopologyChanges, UnitRegistry};
pub use scheduler::{DeferredTask, GlobalScheduler};
pub use stage::{TickContext, TickStage};
pub use task::{
    Owner, PulseOutcome, QueueState, Runnable, Task, TaskContext, TaskId, TaskOptions, runnable,
};
pub use unit::{ExecutorState, UnitExecutor, UnitId, UnitManager};
pub use worker::{Worker, WorkerInfo};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        GlobalScheduler, Owner, SchedulerConfig, SchedulerResult, TaskContext, TaskOptions,
        TaskPriority, TaskResult, TickContext, TickStage, UnitExecutor, UnitManager, runnable,
    };
}
