//! Spatial tasks
//!
//! A spatial task is registered once and executed once per execution unit.
//! The coordinator keeps one child [`Task`] per unit, created through the
//! task's factory so each child can capture unit-scoped state:
//!
//! ```text
//!   ParallelTask ──factory(unit)──▶ child on unit A's TaskManager
//!                 ──factory(unit)──▶ child on unit B's TaskManager
//!                 ...
//! ```
//!
//! Children are added when units register and removed when they unregister.
//! Units are held weakly; a periodic prune sweep drops bookkeeping for units
//! that were reclaimed without an unregister event.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crossbeam::queue::SegQueue;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::task::{Owner, Runnable, Task, TaskId, TaskOptions};
use crate::unit::{UnitExecutor, UnitId};

/// Produces the unit-scoped body of a spatial task's child
pub type ParallelFactory = Arc<dyn Fn(&UnitExecutor, &ParallelTask) -> Runnable + Send + Sync>;

/// Logical parent of a spatial task
#[derive(Debug, Clone)]
pub struct ParallelTask {
    id: TaskId,
    owner: Owner,
    options: TaskOptions,
}

impl ParallelTask {
    #[inline]
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }

    #[inline]
    #[must_use]
    pub const fn owner(&self) -> &Owner {
        &self.owner
    }

    #[inline]
    #[must_use]
    pub const fn options(&self) -> TaskOptions {
        self.options
    }
}

struct Child {
    task: TaskId,
    unit: Weak<UnitExecutor>,
}

impl Child {
    fn is_live(&self) -> bool {
        self.unit
            .upgrade()
            .is_some_and(|unit| unit.task_manager().is_queued(self.task))
    }
}

struct Children {
    alive: bool,
    /// Set once the task has been offered to the units present at registration
    fanned_out: bool,
    by_unit: HashMap<UnitId, Child>,
}

struct Registration {
    parent: ParallelTask,
    factory: ParallelFactory,
    children: Mutex<Children>,
}

impl Registration {
    /// One-shot tasks only reach units present when they were fanned out
    fn accepts_new_units(&self) -> bool {
        let children = self.children.lock();
        children.alive && (self.parent.options.is_repeating() || !children.fanned_out)
    }

    fn attach(&self, unit: &Arc<UnitExecutor>) {
        let mut children = self.children.lock();
        if !children.alive || children.by_unit.contains_key(&unit.id()) {
            return;
        }
        let body = (self.factory)(unit, &self.parent);
        let manager = unit.task_manager();
        let task = Task::new(self.parent.owner.clone(), self.parent.options, body, manager.up_time())
            .with_parent(self.parent.id);
        match manager.submit(Arc::new(task)) {
            Ok(task) => {
                children.by_unit.insert(
                    unit.id(),
                    Child {
                        task,
                        unit: Arc::downgrade(unit),
                    },
                );
            }
            Err(err) => warn!(
                task = %self.parent.id,
                unit = %unit.name(),
                error = %err,
                "failed to schedule spatial child"
            ),
        }
    }

    fn detach(&self, unit: UnitId) {
        let Some(child) = self.children.lock().by_unit.remove(&unit) else {
            return;
        };
        if let Some(unit) = child.unit.upgrade() {
            unit.task_manager().cancel(child.task);
        }
    }

    fn stop(&self) {
        let mut children = self.children.lock();
        children.alive = false;
        for (_, child) in children.by_unit.drain() {
            if let Some(unit) = child.unit.upgrade() {
                unit.task_manager().cancel(child.task);
            }
        }
    }
}

/// Keeps exactly one child per registered unit for every spatial task
pub struct ParallelTaskCoordinator {
    registrations: Mutex<HashMap<TaskId, Arc<Registration>>>,
    new_tasks: SegQueue<Arc<Registration>>,
    new_units: SegQueue<Weak<UnitExecutor>>,
    dead_units: SegQueue<UnitId>,
    prune_interval: u64,
    heartbeats: AtomicU64,
}

impl Default for ParallelTaskCoordinator {
    fn default() -> Self {
        Self::new(20)
    }
}

impl ParallelTaskCoordinator {
    /// `prune_interval` is the number of heartbeats between prune sweeps
    #[must_use]
    pub fn new(prune_interval: u64) -> Self {
        Self {
            registrations: Mutex::new(HashMap::new()),
            new_tasks: SegQueue::new(),
            new_units: SegQueue::new(),
            dead_units: SegQueue::new(),
            prune_interval: prune_interval.max(1),
            heartbeats: AtomicU64::new(0),
        }
    }

    /// Register a spatial task; children are created on the next heartbeat.
    pub fn schedule<F>(&self, owner: &Owner, options: TaskOptions, factory: F) -> SchedulerResult<TaskId>
    where
        F: Fn(&UnitExecutor, &ParallelTask) -> Runnable + Send + Sync + 'static,
    {
        if !options.sync {
            return Err(SchedulerError::AsyncNotSupported("spatial tasks".to_string()));
        }
        let registration = Arc::new(Registration {
            parent: ParallelTask {
                id: TaskId::next(),
                owner: owner.clone(),
                options,
            },
            factory: Arc::new(factory),
            children: Mutex::new(Children {
                alive: true,
                fanned_out: false,
                by_unit: HashMap::new(),
            }),
        });
        let id = registration.parent.id;
        self.registrations.lock().insert(id, Arc::clone(&registration));
        self.new_tasks.push(registration);
        Ok(id)
    }

    /// Queue a unit to receive children on the next heartbeat
    pub fn register_unit(&self, unit: &Arc<UnitExecutor>) {
        self.new_units.push(Arc::downgrade(unit));
    }

    /// Queue removal of a unit's children on the next heartbeat
    pub fn unregister_unit(&self, unit: UnitId) {
        self.dead_units.push(unit);
    }

    /// Apply queued task and unit changes. `units` is the current topology.
    pub fn heartbeat(&self, units: &[Arc<UnitExecutor>]) {
        while let Some(registration) = self.new_tasks.pop() {
            for unit in units {
                registration.attach(unit);
            }
            registration.children.lock().fanned_out = true;
        }

        while let Some(unit) = self.new_units.pop() {
            let Some(unit) = unit.upgrade() else {
                continue;
            };
            for registration in self.snapshot() {
                if registration.accepts_new_units() {
                    registration.attach(&unit);
                }
            }
        }

        while let Some(unit) = self.dead_units.pop() {
            for registration in self.snapshot() {
                registration.detach(unit);
            }
        }

        let beats = self.heartbeats.fetch_add(1, Ordering::Relaxed) + 1;
        if beats % self.prune_interval == 0 {
            self.prune();
        }
    }

    /// Drop children whose unit has been reclaimed, and finished one-shot
    /// registrations. Returns the number of children removed.
    pub fn prune(&self) -> usize {
        let mut pruned = 0;
        let mut finished = Vec::new();
        for registration in self.snapshot() {
            let mut children = registration.children.lock();
            let before = children.by_unit.len();
            children.by_unit.retain(|_, child| child.unit.strong_count() > 0);
            pruned += before - children.by_unit.len();

            let one_shot = !registration.parent.options.is_repeating();
            if one_shot && children.fanned_out && !children.by_unit.values().any(Child::is_live) {
                finished.push(registration.parent.id);
            }
        }
        if !finished.is_empty() {
            let mut registrations = self.registrations.lock();
            for id in &finished {
                registrations.remove(id);
            }
        }
        if pruned > 0 {
            debug!(pruned, "pruned spatial children of reclaimed units");
        }
        pruned
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    /// Stop a spatial task and every child on every live unit
    pub fn cancel(&self, id: TaskId) -> bool {
        let Some(registration) = self.registrations.lock().remove(&id) else {
            return false;
        };
        registration.stop();
        true
    }

    pub fn cancel_owner(&self, owner: &Owner) -> usize {
        let ids: Vec<TaskId> = self
            .registrations
            .lock()
            .values()
            .filter(|r| r.parent.owner == *owner)
            .map(|r| r.parent.id)
            .collect();
        ids.into_iter().filter(|&id| self.cancel(id)).count()
    }

    pub fn cancel_all(&self) -> usize {
        let ids: Vec<TaskId> = self.registrations.lock().keys().copied().collect();
        ids.into_iter().filter(|&id| self.cancel(id)).count()
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    #[must_use]
    pub fn is_registered(&self, id: TaskId) -> bool {
        self.registrations.lock().contains_key(&id)
    }

    #[must_use]
    pub fn registration_count(&self) -> usize {
        self.registrations.lock().len()
    }

    /// Children whose unit is alive and whose task is still scheduled
    #[must_use]
    pub fn active_children(&self, id: TaskId) -> usize {
        let Some(registration) = self.registrations.lock().get(&id).cloned() else {
            return 0;
        };
        let children = registration.children.lock();
        children.by_unit.values().filter(|child| child.is_live()).count()
    }

    /// Units holding bookkeeping for this task, in id order
    #[must_use]
    pub fn child_units(&self, id: TaskId) -> Vec<UnitId> {
        let Some(registration) = self.registrations.lock().get(&id).cloned() else {
            return Vec::new();
        };
        let mut units: Vec<UnitId> = registration.children.lock().by_unit.keys().copied().collect();
        units.sort_unstable();
        units
    }

    fn snapshot(&self) -> Vec<Arc<Registration>> {
        self.registrations.lock().values().cloned().collect()
    }
}

impl fmt::Debug for ParallelTaskCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelTaskCoordinator")
            .field("registrations", &self.registrations.lock().len())
            .field("new_tasks", &self.new_tasks.len())
            .field("new_units", &self.new_units.len())
            .field("dead_units", &self.dead_units.len())
            .finish_non_exhaustive()
    }
}
