//! Diagnostic read/write lock guarding the snapshot phase
//!
//! The scheduler takes the write side while live state is copied into the
//! stable snapshot. Anything that wants a consistent view outside the tick
//! takes the read side, attributed either to an [`Owner`] or to a named core
//! task, so that a stalled snapshot can be traced back to whoever is holding
//! it.

use std::cell::Cell;
use std::fmt;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};

use crate::task::Owner;

thread_local! {
    static LOCK_EXEMPT: Cell<bool> = const { Cell::new(false) };
}

/// Let the calling thread skip read locking. Unit executor threads call this:
/// they are only ever running when the scheduler allows them to.
pub fn exempt_current_thread() {
    LOCK_EXEMPT.with(|exempt| exempt.set(true));
}

fn is_exempt() -> bool {
    LOCK_EXEMPT.with(Cell::get)
}

#[derive(Debug, Default)]
struct State {
    readers: usize,
    writer: Option<ThreadId>,
    writers_waiting: usize,
}

impl State {
    const fn blocks_readers(&self) -> bool {
        self.writer.is_some() || self.writers_waiting > 0
    }

    const fn blocks_writer(&self) -> bool {
        self.writer.is_some() || self.readers > 0
    }
}

#[derive(Debug, Clone, Copy)]
struct Hold {
    since: Instant,
    count: usize,
}

/// An owner currently holding read access
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub owner: Owner,
    pub held_for: Duration,
    pub count: usize,
}

/// Writer-preferring read/write lock with holder attribution
#[derive(Default)]
pub struct SnapshotLock {
    state: Mutex<State>,
    changed: Condvar,
    owners: Mutex<HashMap<Owner, Hold>>,
    core_tasks: Mutex<HashMap<String, usize>>,
    core_threads: Mutex<HashMap<ThreadId, (String, usize)>>,
}

impl SnapshotLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Read side
    // ========================================================================

    /// Exempt threads and the thread holding the write side read freely
    fn bypass(&self) -> bool {
        is_exempt() || self.state.lock().writer == Some(thread::current().id())
    }

    /// Block until read access is granted to `owner`
    pub fn read_lock(&self, owner: &Owner) {
        if self.bypass() {
            return;
        }
        self.acquire_read();
        self.record_owner(owner);
    }

    /// Take read access only if no writer holds or waits for the lock
    pub fn read_try_lock(&self, owner: &Owner) -> bool {
        if self.bypass() {
            return true;
        }
        if !self.try_acquire_read() {
            return false;
        }
        self.record_owner(owner);
        true
    }

    /// # Panics
    ///
    /// Panics if `owner` does not hold read access.
    pub fn read_unlock(&self, owner: &Owner) {
        if self.bypass() {
            return;
        }
        {
            let mut owners = self.owners.lock();
            let hold = owners
                .get_mut(owner)
                .unwrap_or_else(|| panic!("read_unlock by `{owner}` without a matching read_lock"));
            hold.count -= 1;
            if hold.count == 0 {
                owners.remove(owner);
            }
        }
        self.release_read();
    }

    /// Scoped read access, released on drop
    pub fn read(&self, owner: &Owner) -> ReadGuard<'_> {
        self.read_lock(owner);
        ReadGuard {
            lock: self,
            owner: owner.clone(),
        }
    }

    /// Read access attributed to a core task and the calling thread
    pub fn core_read_lock(&self, task_name: &str) {
        if self.bypass() {
            return;
        }
        self.acquire_read();
        self.record_core(task_name);
    }

    pub fn core_read_try_lock(&self, task_name: &str) -> bool {
        if self.bypass() {
            return true;
        }
        if !self.try_acquire_read() {
            return false;
        }
        self.record_core(task_name);
        true
    }

    /// # Panics
    ///
    /// Panics if `task_name` does not hold read access on this thread.
    pub fn core_read_unlock(&self, task_name: &str) {
        if self.bypass() {
            return;
        }
        {
            let mut tasks = self.core_tasks.lock();
            let count = tasks
                .get_mut(task_name)
                .unwrap_or_else(|| panic!("core_read_unlock by `{task_name}` without a matching lock"));
            *count -= 1;
            if *count == 0 {
                tasks.remove(task_name);
            }
        }
        {
            let id = thread::current().id();
            let mut threads = self.core_threads.lock();
            if let Some((_, count)) = threads.get_mut(&id) {
                *count -= 1;
                if *count == 0 {
                    threads.remove(&id);
                }
            }
        }
        self.release_read();
    }

    fn acquire_read(&self) {
        let mut state = self.state.lock();
        while state.blocks_readers() {
            self.changed.wait(&mut state);
        }
        state.readers += 1;
    }

    fn try_acquire_read(&self) -> bool {
        let mut state = self.state.lock();
        if state.blocks_readers() {
            return false;
        }
        state.readers += 1;
        true
    }

    fn release_read(&self) {
        let mut state = self.state.lock();
        state.readers = state.readers.saturating_sub(1);
        if state.readers == 0 {
            self.changed.notify_all();
        }
    }

    fn record_owner(&self, owner: &Owner) {
        self.owners
            .lock()
            .entry(owner.clone())
            .or_insert(Hold {
                since: Instant::now(),
                count: 0,
            })
            .count += 1;
    }

    fn record_core(&self, task_name: &str) {
        *self.core_tasks.lock().entry(task_name.to_string()).or_insert(0) += 1;
        let current = thread::current();
        self.core_threads
            .lock()
            .entry(current.id())
            .or_insert_with(|| (current.name().unwrap_or("<unnamed>").to_string(), 0))
            .1 += 1;
    }

    // ========================================================================
    // Write side
    // ========================================================================

    /// Try to take exclusive access within `timeout`.
    ///
    /// New readers are held back while this call waits.
    pub fn write_lock(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        state.writers_waiting += 1;
        while state.blocks_writer() {
            if self.changed.wait_until(&mut state, deadline).timed_out() && state.blocks_writer() {
                state.writers_waiting -= 1;
                self.changed.notify_all();
                return false;
            }
        }
        state.writers_waiting -= 1;
        state.writer = Some(thread::current().id());
        true
    }

    /// # Panics
    ///
    /// Panics if the write lock is not held.
    pub fn write_unlock(&self) {
        let mut state = self.state.lock();
        assert!(state.writer.is_some(), "write_unlock without holding the snapshot lock");
        state.writer = None;
        self.changed.notify_all();
    }

    #[must_use]
    pub fn is_write_locked(&self) -> bool {
        self.state.lock().writer.is_some()
    }

    #[must_use]
    pub fn reader_count(&self) -> usize {
        self.state.lock().readers
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// Owners that have held read access for at least `threshold`, longest first
    #[must_use]
    pub fn locking_owners(&self, threshold: Duration) -> Vec<LockHolder> {
        let mut holders: Vec<LockHolder> = self
            .owners
            .lock()
            .iter()
            .map(|(owner, hold)| LockHolder {
                owner: owner.clone(),
                held_for: hold.since.elapsed(),
                count: hold.count,
            })
            .filter(|holder| holder.held_for >= threshold)
            .collect();
        holders.sort_by(|a, b| b.held_for.cmp(&a.held_for));
        holders
    }

    /// Core tasks currently holding read access
    #[must_use]
    pub fn locking_tasks(&self) -> Vec<String> {
        let mut tasks: Vec<String> = self.core_tasks.lock().keys().cloned().collect();
        tasks.sort();
        tasks
    }

    /// Names of threads holding core read access
    #[must_use]
    pub fn core_locking_threads(&self) -> Vec<String> {
        let mut threads: Vec<String> = self
            .core_threads
            .lock()
            .values()
            .map(|(name, _)| name.clone())
            .collect();
        threads.sort();
        threads
    }
}

impl fmt::Debug for SnapshotLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotLock")
            .field("state", &*self.state.lock())
            .field("owners", &self.owners.lock().len())
            .field("core_tasks", &self.core_tasks.lock().len())
            .finish()
    }
}

/// RAII read access returned by [`SnapshotLock::read`]
pub struct ReadGuard<'a> {
    lock: &'a SnapshotLock,
    owner: Owner,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.read_unlock(&self.owner);
    }
}

impl fmt::Debug for ReadGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadGuard").field("owner", &self.owner).finish()
    }
}
