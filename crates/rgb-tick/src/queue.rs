//! Time-ordered ready queue

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Arc;

use hashbrown::HashMap;

use crate::task::{Task, TaskId};

/// Min-heap of tasks keyed by `(next_call_time, id)`
///
/// Removal is lazy: cancelled tasks leave their heap entry behind and are
/// skipped when popped. Once stale entries outnumber live ones the heap is
/// rebuilt from the live set.
#[derive(Default)]
pub struct TaskQueue {
    heap: BinaryHeap<Reverse<(u64, TaskId)>>,
    tasks: HashMap<TaskId, Arc<Task>>,
}

impl TaskQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a task at its current call time. Returns `false` if it is dead.
    ///
    /// # Panics
    ///
    /// Panics if the task is already queued.
    pub fn push(&mut self, task: Arc<Task>) -> bool {
        if !task.mark_queued() {
            return false;
        }
        self.heap.push(Reverse((task.next_call_time(), task.id())));
        self.tasks.insert(task.id(), task);
        true
    }

    /// Pop the earliest task due at or before `now`
    pub fn pop_due(&mut self, now: u64) -> Option<Arc<Task>> {
        while let Some(&Reverse((time, id))) = self.heap.peek() {
            if time > now {
                return None;
            }
            self.heap.pop();
            let Some(task) = self.tasks.remove(&id) else {
                continue;
            };
            if task.mark_unqueued() {
                return Some(task);
            }
        }
        None
    }

    /// Drop a task from the queue; its heap entry is skipped later
    pub fn remove(&mut self, id: TaskId) -> Option<Arc<Task>> {
        let task = self.tasks.remove(&id)?;
        task.mark_unqueued();
        self.compact();
        Some(task)
    }

    fn compact(&mut self) {
        if self.heap.len() <= 2 * self.tasks.len() + 1 {
            return;
        }
        self.heap = self
            .tasks
            .values()
            .map(|task| Reverse((task.next_call_time(), task.id())))
            .collect();
    }

    #[must_use]
    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.contains_key(&id)
    }

    /// Queued, still-alive tasks in call order
    #[must_use]
    pub fn pending(&self) -> Vec<Arc<Task>> {
        let mut pending: Vec<_> = self.tasks.values().filter(|t| t.is_alive()).cloned().collect();
        pending.sort_by_key(|t| (t.next_call_time(), t.id()));
        pending
    }

    /// Earliest call time still in the heap
    #[must_use]
    pub fn next_due(&self) -> Option<u64> {
        self.heap.peek().map(|Reverse((time, _))| *time)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("len", &self.tasks.len())
            .field("heap_entries", &self.heap.len())
            .field("next_due", &self.next_due())
            .finish()
    }
}
