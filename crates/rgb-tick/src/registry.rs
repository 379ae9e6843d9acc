//! Unit topology with changes applied at pulse boundaries

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::unit::{UnitExecutor, UnitId};

enum Change {
    Add(Arc<UnitExecutor>),
    Remove(UnitId),
}

/// Units added or removed by [`UnitRegistry::apply`]
#[derive(Debug, Default)]
pub struct TopologyChanges {
    pub added: Vec<Arc<UnitExecutor>>,
    pub removed: Vec<Arc<UnitExecutor>>,
}

impl TopologyChanges {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// The set of execution units stepped by the scheduler
///
/// Additions and removals may be requested from any thread at any time; they
/// take effect only when the scheduler calls [`apply`](Self::apply) at the
/// start of a pulse, so the set never changes in the middle of a stage.
#[derive(Default)]
pub struct UnitRegistry {
    live: RwLock<Vec<Arc<UnitExecutor>>>,
    pending: Mutex<Vec<Change>>,
}

impl UnitRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, unit: Arc<UnitExecutor>) {
        self.pending.lock().push(Change::Add(unit));
    }

    pub fn remove(&self, unit: UnitId) {
        self.pending.lock().push(Change::Remove(unit));
    }

    /// Apply pending changes in request order
    pub fn apply(&self) -> TopologyChanges {
        let pending = std::mem::take(&mut *self.pending.lock());
        let mut changes = TopologyChanges::default();
        if pending.is_empty() {
            return changes;
        }

        let mut live = self.live.write();
        for change in pending {
            match change {
                Change::Add(unit) => {
                    if live.iter().any(|u| u.id() == unit.id()) {
                        continue;
                    }
                    live.push(Arc::clone(&unit));
                    changes.added.push(unit);
                }
                Change::Remove(id) => {
                    if let Some(index) = live.iter().position(|u| u.id() == id) {
                        changes.removed.push(live.remove(index));
                    }
                }
            }
        }
        changes
    }

    /// Current units, in insertion order
    #[must_use]
    pub fn units(&self) -> Vec<Arc<UnitExecutor>> {
        self.live.read().clone()
    }

    #[must_use]
    pub fn get(&self, id: UnitId) -> Option<Arc<UnitExecutor>> {
        self.live.read().iter().find(|u| u.id() == id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.live.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live.read().is_empty()
    }
}
