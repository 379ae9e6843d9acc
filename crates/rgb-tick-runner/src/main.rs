//! Demo server on top of `rgb-tick`
//!
//! Starts a primary server unit plus a square grid of region units, runs a
//! spatial movement task in every region and logs stats from the main task
//! manager until Ctrl-C (or until `TICKS` pulses have run).
//!
//! Environment:
//! - `RGB_TICK_CONFIG` - path to a JSON scheduler config
//! - `RGB_TICK_*` - individual config overrides (see `SchedulerConfig`)
//! - `REGIONS` - regions per side of the grid (default 2)
//! - `TICKS` - stop after this many pulses

mod region;

use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use eyre::WrapErr;
use hashbrown::HashMap;
use rgb_tick::prelude::*;
use rgb_tick::{TaskId, UnitId};
use tracing::{info, warn};

use crate::region::{Region, RegionStats, Server};

const ENTITIES_PER_REGION: u64 = 64;

fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rgb_tick=info".parse()?)
                .add_directive("rgb_tick_runner=info".parse()?),
        )
        .init();

    let config = load_config()?;
    let side: i32 = env_or("REGIONS", 2)?;
    let tick_limit: Option<u64> = std::env::var("TICKS").ok().map(|t| t.parse()).transpose()?;
    let pulse = config.pulse();

    info!(pulse_ms = config.pulse_ms, regions = side * side, "starting tick runner");
    let scheduler = Arc::new(GlobalScheduler::new(config)?);

    scheduler.add_primary_unit(Server::default())?;
    let regions = add_regions(&scheduler, side)?;

    schedule_spawner(&scheduler, &regions)?;
    schedule_stats(&scheduler, &regions)?;

    let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .wrap_err("failed to install Ctrl-C handler")?;

    scheduler.start()?;
    loop {
        match stop_rx.recv_timeout(pulse) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                info!("interrupted");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }
        if tick_limit.is_some_and(|limit| scheduler.tick_count() >= limit) {
            break;
        }
    }
    scheduler.shutdown();

    let total: u64 = regions.values().map(|stats| stats.stable()).sum();
    info!(ticks = scheduler.tick_count(), entities = total, "runner finished");
    Ok(())
}

fn load_config() -> eyre::Result<SchedulerConfig> {
    let Ok(path) = std::env::var("RGB_TICK_CONFIG") else {
        return Ok(SchedulerConfig::from_env()?);
    };
    let json = std::fs::read_to_string(&path).wrap_err_with(|| format!("reading {path}"))?;
    let config = SchedulerConfig::from_json(&json)?.with_overrides(|key| std::env::var(key).ok())?;
    Ok(config)
}

fn env_or<T>(key: &str, default: T) -> eyre::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(value) => value.parse().wrap_err_with(|| format!("invalid {key}={value}")),
        Err(_) => Ok(default),
    }
}

type Regions = Arc<HashMap<UnitId, Arc<RegionStats>>>;

/// A `side` x `side` grid of region units, keyed by unit id
fn add_regions(scheduler: &GlobalScheduler, side: i32) -> SchedulerResult<Regions> {
    let mut regions = HashMap::new();
    for x in 0..side {
        for z in 0..side {
            let stats = Arc::new(RegionStats::default());
            let unit = scheduler.add_unit(Region::new(x, z, Arc::clone(&stats)))?;
            regions.insert(unit.id(), stats);
        }
    }
    Ok(Arc::new(regions))
}

/// Every region gets a repeating child that spawns a few entities per second
fn schedule_spawner(scheduler: &GlobalScheduler, regions: &Regions) -> SchedulerResult<TaskId> {
    let regions = Arc::clone(regions);
    scheduler.schedule_parallel(
        &Owner::from("spawner"),
        TaskOptions::sync().period(1000),
        move |unit, _| {
            let stats = regions.get(&unit.id()).cloned();
            runnable(move |_| {
                if let Some(stats) = &stats {
                    stats.spawn(ENTITIES_PER_REGION);
                }
                Ok(())
            })
        },
    )
}

/// Summarize the last published snapshots every five seconds
fn schedule_stats(scheduler: &Arc<GlobalScheduler>, regions: &Regions) -> SchedulerResult<TaskId> {
    let regions = Arc::clone(regions);
    let weak: Weak<GlobalScheduler> = Arc::downgrade(scheduler);
    let owner = Owner::from("stats");
    let reader = owner.clone();
    scheduler.schedule_async_repeating(&owner, 5000, 5000, TaskPriority::Low, move |_| {
        let Some(scheduler) = weak.upgrade() else {
            return Ok(());
        };
        let _guard = scheduler.snapshot_lock().read(&reader);
        let entities: u64 = regions.values().map(|stats| stats.stable()).sum();
        let moved: u64 = regions.values().map(|stats| stats.moved()).sum();
        if scheduler.is_overloaded() {
            warn!(tick_time = ?scheduler.tick_time(), "server overloaded");
        }
        info!(
            tick = scheduler.tick_count(),
            up_time = ?Duration::from_millis(scheduler.up_time()),
            entities,
            moved,
            "stats"
        );
        Ok(())
    })
}
