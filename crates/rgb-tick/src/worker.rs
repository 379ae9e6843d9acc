//! Ephemeral worker threads for async tasks

use std::fmt;
use std::sync::Arc;
use std::thread::Thread;
use std::time::{Duration, Instant};

use crate::task::{Owner, Task, TaskId};

/// A thread executing one invocation of an async task
///
/// Created by the owning [`TaskManager`](crate::TaskManager) when the task is
/// due, removed again once the body returns.
pub struct Worker {
    task: Arc<Task>,
    thread: Thread,
    started: Instant,
}

impl Worker {
    pub fn new(task: Arc<Task>, thread: Thread) -> Self {
        Self {
            task,
            thread,
            started: Instant::now(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn task(&self) -> &Arc<Task> {
        &self.task
    }

    /// Best-effort interrupt: flags the task and unparks the thread
    pub fn interrupt(&self) {
        self.task.interrupt();
        self.thread.unpark();
    }

    #[must_use]
    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            task: self.task.id(),
            owner: self.task.owner().clone(),
            thread: self.thread.name().unwrap_or("<unnamed>").to_string(),
            running_for: self.started.elapsed(),
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("task", &self.task.id())
            .field("thread", &self.thread.name())
            .field("running_for", &self.started.elapsed())
            .finish()
    }
}

/// Snapshot of an in-flight worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub task: TaskId,
    pub owner: Owner,
    pub thread: String,
    pub running_for: Duration,
}

impl fmt::Display for WorkerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (owner {}) on {} for {}ms",
            self.task,
            self.owner,
            self.thread,
            self.running_for.as_millis()
        )
    }
}
