//! Schedulable tasks
//!
//! A [`Task`] carries its timing metadata and a lock-free queue-state machine:
//!
//! ```text
//!   Unqueued ──push──▶ Queued
//!      ▲                  │
//!      └──────pop─────────┘
//!   (any) ──stop──▶ Dead   (terminal)
//! ```

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{TaskFailure, TaskResult};
use crate::priority::TaskPriority;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Unique task identifier, never reused within a process
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Opaque attribution key used for cancel-by-owner and diagnostics
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Owner(Arc<str>);

impl Owner {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Owner {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Debug for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Owner({:?})", &*self.0)
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Queue state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum QueueState {
    Unqueued = 0,
    Queued = 1,
    /// Terminal
    Dead = 2,
}

impl QueueState {
    #[inline]
    const fn as_u8(self) -> u8 {
        self as u8
    }

    #[inline]
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Unqueued,
            1 => Self::Queued,
            _ => Self::Dead,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Dead)
    }
}

/// Atomic cell holding a [`QueueState`]
struct QueueStateCell(AtomicU8);

impl QueueStateCell {
    const fn new() -> Self {
        Self(AtomicU8::new(QueueState::Unqueued.as_u8()))
    }

    fn load(&self) -> QueueState {
        QueueState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// CAS `from → to`; on failure returns the observed state.
    /// Leaving `Dead` is never allowed.
    fn transition(&self, from: QueueState, to: QueueState) -> Result<(), QueueState> {
        if from.is_terminal() {
            return Err(QueueState::Dead);
        }
        self.0
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(QueueState::from_u8)
    }

    /// Move to `Dead`, returning the previous state
    fn kill(&self) -> QueueState {
        QueueState::from_u8(self.0.swap(QueueState::Dead.as_u8(), Ordering::AcqRel))
    }
}

/// Timing and placement of a task
///
/// `delay` and `period` are measured in up-time units of the owning task
/// manager (milliseconds when driven by the scheduler). A `period` of zero
/// makes the task one-shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskOptions {
    pub sync: bool,
    pub delay: u64,
    pub period: u64,
    pub priority: TaskPriority,
}

impl TaskOptions {
    /// One-shot task on the owning manager's thread
    #[must_use]
    pub const fn sync() -> Self {
        Self {
            sync: true,
            delay: 0,
            period: 0,
            priority: TaskPriority::Critical,
        }
    }

    /// One-shot task on its own worker thread
    #[must_use]
    pub const fn asynchronous() -> Self {
        Self {
            sync: false,
            ..Self::sync()
        }
    }

    #[must_use]
    pub const fn delay(self, delay: u64) -> Self {
        Self { delay, ..self }
    }

    #[must_use]
    pub const fn period(self, period: u64) -> Self {
        Self { period, ..self }
    }

    #[must_use]
    pub const fn priority(self, priority: TaskPriority) -> Self {
        Self { priority, ..self }
    }

    #[inline]
    #[must_use]
    pub const fn is_repeating(&self) -> bool {
        self.period > 0
    }
}

/// Boxed task body
pub type Runnable = Box<dyn FnMut(&TaskContext) -> TaskResult + Send + 'static>;

/// Box a closure as a task body
pub fn runnable<F>(body: F) -> Runnable
where
    F: FnMut(&TaskContext) -> TaskResult + Send + 'static,
{
    Box::new(body)
}

/// What a task body can see about its own execution
pub struct TaskContext {
    task: Arc<Task>,
    up_time: u64,
}

impl TaskContext {
    #[inline]
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.task.id
    }

    #[inline]
    #[must_use]
    pub fn owner(&self) -> &Owner {
        &self.task.owner
    }

    /// Up-time of the manager when this execution started
    #[inline]
    #[must_use]
    pub const fn up_time(&self) -> u64 {
        self.up_time
    }

    /// Long-running bodies should poll this and return early
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        !self.task.is_alive() || self.task.is_interrupted()
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("task", &self.task.id)
            .field("up_time", &self.up_time)
            .finish()
    }
}

/// Result of [`Task::pulse`]
#[derive(Debug)]
pub enum PulseOutcome {
    /// The task was already dead
    NotAlive,
    /// Postponed under overload; call time moved forward
    Deferred,
    /// Another thread is executing the body
    Busy,
    Completed,
    Failed(TaskFailure),
}

const NOT_DEFERRED: u64 = u64::MAX;

/// A schedulable unit of work
pub struct Task {
    id: TaskId,
    owner: Owner,
    options: TaskOptions,
    parent: Option<TaskId>,
    runnable: Mutex<Runnable>,
    state: QueueStateCell,
    next_call_time: AtomicU64,
    executing: AtomicBool,
    interrupted: AtomicBool,
    defer_begin: AtomicU64,
}

impl Task {
    /// Create a task first due at `up_time + options.delay`
    pub fn new(owner: Owner, options: TaskOptions, runnable: Runnable, up_time: u64) -> Self {
        Self {
            id: TaskId::next(),
            owner,
            options,
            parent: None,
            runnable: Mutex::new(runnable),
            state: QueueStateCell::new(),
            next_call_time: AtomicU64::new(up_time.saturating_add(options.delay)),
            executing: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            defer_begin: AtomicU64::new(NOT_DEFERRED),
        }
    }

    /// Mark this task as the per-unit child of a spatial task
    #[must_use]
    pub fn with_parent(mut self, parent: TaskId) -> Self {
        self.parent = Some(parent);
        self
    }

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

    #[inline]
    #[must_use]
    pub const fn is_sync(&self) -> bool {
        self.options.sync
    }

    #[inline]
    #[must_use]
    pub const fn parent(&self) -> Option<TaskId> {
        self.parent
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> QueueState {
        self.state.load()
    }

    #[inline]
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.state().is_terminal()
    }

    #[inline]
    #[must_use]
    pub fn is_executing(&self) -> bool {
        self.executing.load(Ordering::Acquire)
    }

    #[inline]
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    #[inline]
    #[must_use]
    pub fn next_call_time(&self) -> u64 {
        self.next_call_time.load(Ordering::Acquire)
    }

    /// Kill the task. Returns `true` if it was alive.
    pub fn stop(&self) -> bool {
        !self.state.kill().is_terminal()
    }

    /// Request that an in-flight body stops early
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    /// `Unqueued → Queued`. Returns `false` if the task is dead.
    ///
    /// # Panics
    ///
    /// Panics if the task is already queued.
    pub(crate) fn mark_queued(&self) -> bool {
        match self.state.transition(QueueState::Unqueued, QueueState::Queued) {
            Ok(()) => true,
            Err(QueueState::Dead) => false,
            Err(state) => panic!("{} enqueued twice (state {state:?})", self.id),
        }
    }

    /// `Queued → Unqueued`. Returns `false` if the task died while queued.
    pub(crate) fn mark_unqueued(&self) -> bool {
        self.state
            .transition(QueueState::Queued, QueueState::Unqueued)
            .is_ok()
    }

    /// Move the next call time forward by `offset`, clamped past `now`.
    ///
    /// # Panics
    ///
    /// Panics if the task is currently queued; its heap position depends on
    /// the call time.
    pub(crate) fn advance_call_time(&self, offset: u64, now: u64) -> u64 {
        assert!(
            self.state() != QueueState::Queued,
            "{} call time changed while queued",
            self.id
        );
        let mut next = self.next_call_time().saturating_add(offset);
        if next <= now {
            next = now + 1;
        }
        self.next_call_time.store(next, Ordering::Release);
        next
    }

    fn attempt_defer(&self, now: u64) -> bool {
        let budget = self.options.priority.max_deferred();
        if budget == 0 {
            return false;
        }
        let begin = self.defer_begin.load(Ordering::Acquire);
        if begin == NOT_DEFERRED {
            self.defer_begin.store(now, Ordering::Release);
            return true;
        }
        if now.saturating_sub(begin) > budget {
            self.defer_begin.store(NOT_DEFERRED, Ordering::Release);
            return false;
        }
        true
    }

    /// Execute the body once at up-time `now`.
    ///
    /// Repeating tasks get their call time advanced by one period afterwards,
    /// one-shot tasks die. Errors and panics from the body are returned, not
    /// propagated.
    pub fn pulse(self: &Arc<Self>, now: u64, overloaded: bool, defer_step: u64) -> PulseOutcome {
        if !self.is_alive() {
            return PulseOutcome::NotAlive;
        }
        if overloaded && self.attempt_defer(now) {
            self.advance_call_time(defer_step, now);
            return PulseOutcome::Deferred;
        }
        if self
            .executing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return PulseOutcome::Busy;
        }

        let ctx = TaskContext {
            task: Arc::clone(self),
            up_time: now,
        };
        let result = {
            let mut guard = self.runnable.lock();
            let body: &mut Runnable = &mut guard;
            panic::catch_unwind(AssertUnwindSafe(|| body(&ctx)))
        };

        self.defer_begin.store(NOT_DEFERRED, Ordering::Release);
        if self.options.is_repeating() {
            self.advance_call_time(self.options.period, now);
        } else {
            self.stop();
        }
        self.executing.store(false, Ordering::Release);

        match result {
            Ok(Ok(())) => PulseOutcome::Completed,
            Ok(Err(err)) => PulseOutcome::Failed(TaskFailure::Failed(err)),
            Err(payload) => PulseOutcome::Failed(TaskFailure::from_panic(payload)),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("options", &self.options)
            .field("state", &self.state())
            .field("next_call_time", &self.next_call_time())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn counting(options: TaskOptions) -> (Arc<Task>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let body = runnable(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (Arc::new(Task::new(Owner::from("test"), options, body, 0)), count)
    }

    #[test]
    fn test_ids_unique() {
        let (a, _) = counting(TaskOptions::sync());
        let (b, _) = counting(TaskOptions::sync());
        assert_ne!(a.id(), b.id());
        assert!(a.id() < b.id());
    }

    #[test]
    fn test_queue_transitions() {
        let (task, _) = counting(TaskOptions::sync());
        assert_eq!(task.state(), QueueState::Unqueued);
        assert!(task.mark_queued());
        assert_eq!(task.state(), QueueState::Queued);
        assert!(task.mark_unqueued());
        assert_eq!(task.state(), QueueState::Unqueued);
    }

    #[test]
    fn test_dead_is_terminal() {
        let (task, _) = counting(TaskOptions::sync());
        assert!(task.mark_queued());
        assert!(task.stop());
        assert!(!task.stop());
        assert!(!task.mark_unqueued());
        assert!(!task.mark_queued());
        assert_eq!(task.state(), QueueState::Dead);
        assert_eq!(
            task.state.transition(QueueState::Dead, QueueState::Unqueued),
            Err(QueueState::Dead)
        );
    }

    #[test]
    #[should_panic(expected = "enqueued twice")]
    fn test_double_enqueue_panics() {
        let (task, _) = counting(TaskOptions::sync());
        task.mark_queued();
        task.mark_queued();
    }

    #[test]
    #[should_panic(expected = "changed while queued")]
    fn test_call_time_locked_while_queued() {
        let (task, _) = counting(TaskOptions::sync().period(1));
        task.mark_queued();
        task.advance_call_time(1, 0);
    }

    #[test]
    fn test_one_shot_dies_after_run() {
        let (task, count) = counting(TaskOptions::sync());
        assert!(matches!(task.pulse(0, false, 50), PulseOutcome::Completed));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!task.is_alive());
        assert!(matches!(task.pulse(1, false, 50), PulseOutcome::NotAlive));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_periodic_reschedule_monotonic() {
        let (task, _) = counting(TaskOptions::sync().delay(10).period(5));
        assert_eq!(task.next_call_time(), 10);

        // on time: exactly one period later
        task.pulse(10, false, 50);
        assert_eq!(task.next_call_time(), 15);

        // far behind: skip ahead to now + 1
        let before = task.next_call_time();
        task.pulse(100, false, 50);
        let after = task.next_call_time();
        assert!(after >= before + 5);
        assert!(after > 100);
        assert_eq!(after, 101);
    }

    #[test]
    fn test_failure_does_not_kill_repeating_task() {
        let task = Arc::new(Task::new(
            Owner::from("test"),
            TaskOptions::sync().period(1),
            runnable(|_| Err("nope".into())),
            0,
        ));
        assert!(matches!(task.pulse(0, false, 50), PulseOutcome::Failed(TaskFailure::Failed(_))));
        assert!(task.is_alive());
        assert!(!task.is_executing());
    }

    #[test]
    fn test_panic_is_contained() {
        let task = Arc::new(Task::new(
            Owner::from("test"),
            TaskOptions::sync(),
            runnable(|_| panic!("body exploded")),
            0,
        ));
        match task.pulse(0, false, 50) {
            PulseOutcome::Failed(TaskFailure::Panicked(msg)) => assert_eq!(msg, "body exploded"),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(!task.is_alive());
    }

    #[test]
    fn test_deferral_respects_budget() {
        let (task, count) = counting(TaskOptions::sync().period(50).priority(TaskPriority::Highest));

        assert!(matches!(task.pulse(0, true, 50), PulseOutcome::Deferred));
        assert_eq!(task.next_call_time(), 50);
        assert!(matches!(task.pulse(400, true, 50), PulseOutcome::Deferred));
        // 501ms past the first deferral: budget of 500 exhausted
        assert!(matches!(task.pulse(501, true, 50), PulseOutcome::Completed));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_critical_never_deferred() {
        let (task, count) = counting(TaskOptions::sync());
        assert!(matches!(task.pulse(0, true, 50), PulseOutcome::Completed));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_context_reports_cancellation() {
        let observed = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&observed);
        let task = Arc::new(Task::new(
            Owner::from("test"),
            TaskOptions::sync(),
            runnable(move |ctx| {
                seen.store(ctx.is_cancelled(), Ordering::SeqCst);
                Ok(())
            }),
            0,
        ));
        task.interrupt();
        task.pulse(0, false, 50);
        assert!(observed.load(Ordering::SeqCst));
    }
}
