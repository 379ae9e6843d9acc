//! End-to-end scenarios for task managers, spatial tasks and the snapshot lock

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rgb_tick::prelude::*;
use rgb_tick::{
    ParallelTaskCoordinator, QueueState, SchedulerError, SnapshotLock, TaskManager, UnitExecutor,
};

// ============================================================================
// Test Units
// ============================================================================

struct Region {
    name: String,
}

impl Region {
    fn executor(name: &str) -> Arc<UnitExecutor> {
        UnitExecutor::new(Self {
            name: name.to_string(),
        })
    }
}

impl UnitManager for Region {
    fn name(&self) -> &str {
        &self.name
    }

    fn start_tick_run(&mut self, _ctx: &TickContext) -> TaskResult {
        Ok(())
    }
}

fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        pulse_ms: 50,
        stage_join_timeout_ms: 500,
        shutdown_wait_ms: 200,
        ..SchedulerConfig::default()
    }
}

// ============================================================================
// TaskManager
// ============================================================================

#[test]
fn test_repeating_sync_task_runs_once_per_heartbeat() {
    let manager = TaskManager::new("main", false);
    let runs = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&runs);
    manager
        .schedule_sync_repeating(&Owner::from("ticker"), 0, 1, TaskPriority::Normal, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .expect("schedule");

    for _ in 0..5 {
        manager.heartbeat(1);
    }
    assert_eq!(runs.load(Ordering::SeqCst), 5);
}

#[test]
fn test_failing_async_task_leaves_nothing_behind() {
    let manager = TaskManager::new("main", true);
    let id = manager
        .schedule_async(&Owner::from("flaky"), |_| Err("disk on fire".into()))
        .expect("schedule");

    assert!(manager.wait_for_async_tasks(Duration::from_secs(5)));
    assert!(manager.active_workers().is_empty());
    assert!(manager.pending_tasks().iter().all(|task| task.id() != id));
    assert!(!manager.is_queued(id));
}

#[test]
fn test_reschedule_never_moves_backwards() {
    let manager = TaskManager::new("main", false);
    let id = manager
        .schedule_sync_repeating(&Owner::from("ticker"), 0, 7, TaskPriority::Normal, |_| Ok(()))
        .expect("schedule");
    let task = manager.task(id).expect("registered");

    let mut previous = task.next_call_time();
    for delta in [1, 7, 3, 250, 1, 40] {
        manager.heartbeat(delta);
        let next = task.next_call_time();
        let now = manager.up_time();
        if next != previous {
            assert!(next >= previous + 7, "{next} < {previous} + 7");
            assert!(next > now, "{next} <= {now}");
        }
        assert!(next >= previous);
        previous = next;
    }
}

#[test]
fn test_cancelled_task_never_revives() {
    let manager = TaskManager::new("main", false);
    let id = manager
        .schedule_sync_repeating(&Owner::from("ticker"), 0, 1, TaskPriority::Normal, |_| Ok(()))
        .expect("schedule");
    let task = manager.task(id).expect("registered");

    manager.heartbeat(1);
    assert!(manager.cancel(id));
    for _ in 0..3 {
        manager.heartbeat(1);
        assert_eq!(task.state(), QueueState::Dead);
    }
    assert!(manager.pending_tasks().is_empty());
}

// ============================================================================
// Spatial Tasks
// ============================================================================

#[test]
fn test_spatial_task_registered_before_units() {
    let scheduler = GlobalScheduler::new(test_config()).expect("config");
    let id = scheduler
        .schedule_parallel(&Owner::from("spatial"), TaskOptions::sync().period(50), |_, _| {
            runnable(|_| Ok(()))
        })
        .expect("schedule");

    scheduler.tick(50).expect("empty tick");
    assert_eq!(scheduler.parallel().active_children(id), 0);

    let units: Vec<_> = (0..3)
        .map(|i| {
            scheduler
                .add_unit(Region {
                    name: format!("region-{i}"),
                })
                .expect("add unit")
        })
        .collect();
    scheduler.tick(50).expect("tick");

    assert_eq!(scheduler.parallel().active_children(id), 3);
    let mut owners = scheduler.parallel().child_units(id);
    owners.dedup();
    assert_eq!(owners.len(), 3);
    for unit in &units {
        assert_eq!(unit.task_manager().active_task_count(), 1);
    }
    scheduler.shutdown();
}

#[test]
fn test_spatial_cancel_and_prune() {
    let coordinator = ParallelTaskCoordinator::new(1000);
    let u1 = Region::executor("u1");
    let u2 = Region::executor("u2");
    let options = TaskOptions::sync().period(1);

    let first = coordinator
        .schedule(&Owner::from("spatial"), options, |_, _| runnable(|_| Ok(())))
        .expect("schedule");
    coordinator.heartbeat(&[Arc::clone(&u1), Arc::clone(&u2)]);
    assert_eq!(coordinator.active_children(first), 2);

    assert!(coordinator.cancel(first));
    assert_eq!(coordinator.active_children(first), 0);
    assert_eq!(u1.task_manager().active_task_count(), 0);
    assert_eq!(u2.task_manager().active_task_count(), 0);

    let second = coordinator
        .schedule(&Owner::from("spatial"), options, |_, _| runnable(|_| Ok(())))
        .expect("schedule");
    coordinator.heartbeat(&[Arc::clone(&u1), Arc::clone(&u2)]);
    let u2_id = u2.id();
    drop(u1);

    assert_eq!(coordinator.prune(), 1);
    assert_eq!(coordinator.child_units(second), vec![u2_id]);
    assert_eq!(coordinator.active_children(second), 1);
}

#[test]
fn test_removed_unit_loses_children() {
    let scheduler = GlobalScheduler::new(test_config()).expect("config");
    let keep = scheduler
        .add_unit(Region {
            name: "keep".into(),
        })
        .expect("add");
    let gone = scheduler
        .add_unit(Region {
            name: "gone".into(),
        })
        .expect("add");
    let id = scheduler
        .schedule_parallel(&Owner::from("spatial"), TaskOptions::sync().period(50), |_, _| {
            runnable(|_| Ok(()))
        })
        .expect("schedule");
    scheduler.tick(50).expect("tick");
    assert_eq!(scheduler.parallel().active_children(id), 2);

    scheduler.remove_unit(gone.id());
    scheduler.tick(50).expect("tick");
    assert_eq!(scheduler.parallel().child_units(id), vec![keep.id()]);
    assert!(gone.pulse_join(Instant::now() + Duration::from_secs(5)));
    assert_eq!(gone.state(), rgb_tick::ExecutorState::Halted);
    scheduler.shutdown();
}

// ============================================================================
// Snapshot Lock
// ============================================================================

/// Two threads race for the write lock; returns (acquired, acquired_at, released_at)
fn race(timeout: Duration, hold: Duration) -> Vec<(bool, Instant, Option<Instant>)> {
    let lock = Arc::new(SnapshotLock::new());
    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let acquired = lock.write_lock(timeout);
                let at = Instant::now();
                let released = acquired.then(|| {
                    thread::sleep(hold);
                    let released = Instant::now();
                    lock.write_unlock();
                    released
                });
                (acquired, at, released)
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().expect("thread")).collect()
}

#[test]
fn test_write_lock_exclusive_with_short_timeout() {
    let results = race(Duration::from_millis(20), Duration::from_millis(200));
    let winners = results.iter().filter(|(acquired, _, _)| *acquired).count();
    assert_eq!(winners, 1);
}

#[test]
fn test_write_lock_second_waits_for_release() {
    let results = race(Duration::from_secs(5), Duration::from_millis(50));
    assert!(results.iter().all(|(acquired, _, _)| *acquired));

    let mut results = results;
    results.sort_by_key(|(_, at, _)| *at);
    let first_released = results[0].2.expect("first holder released");
    assert!(results[1].1 >= first_released);
}

#[test]
fn test_readers_wait_for_snapshot() {
    let scheduler = Arc::new(GlobalScheduler::new(test_config()).expect("config"));
    assert!(scheduler.snapshot_lock().write_lock(Duration::from_millis(10)));

    let reader = {
        let scheduler = Arc::clone(&scheduler);
        thread::spawn(move || {
            let started = Instant::now();
            assert!(scheduler.safe_run(&Owner::from("reader"), || Ok(())));
            started.elapsed()
        })
    };
    thread::sleep(Duration::from_millis(50));
    scheduler.snapshot_lock().write_unlock();
    let waited = reader.join().expect("reader");
    assert!(waited >= Duration::from_millis(40));
}

#[test]
fn test_async_rejected_on_unit_manager() {
    let unit = Region::executor("region");
    let err = unit
        .task_manager()
        .schedule_async(&Owner::from("x"), |_| Ok(()))
        .unwrap_err();
    assert!(matches!(err, SchedulerError::AsyncNotSupported(_)));
}

#[test]
fn test_worker_interrupt_on_cancel_owner() {
    let scheduler = GlobalScheduler::new(test_config()).expect("config");
    let owner = Owner::from("plugin");
    let finished = Arc::new(Mutex::new(false));
    let started = Arc::new(Barrier::new(2));
    let (flag, entered) = (Arc::clone(&finished), Arc::clone(&started));
    scheduler
        .schedule_async(&owner, move |ctx| {
            entered.wait();
            while !ctx.is_cancelled() {
                thread::park_timeout(Duration::from_millis(5));
            }
            *flag.lock() = true;
            Ok(())
        })
        .expect("schedule");

    // cancel only once the body is running, so it has to observe the interrupt
    started.wait();
    assert_eq!(scheduler.active_workers().len(), 1);
    assert_eq!(scheduler.cancel_tasks(&owner), 1);
    assert!(scheduler.task_manager().wait_for_async_tasks(Duration::from_secs(5)));
    assert!(*finished.lock());
}
