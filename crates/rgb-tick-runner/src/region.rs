//! Demo execution units: a primary server unit and square world regions.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rgb_tick::prelude::*;
use tracing::{debug, trace};

/// Counters shared between a region, its spatial tasks and the stats task
#[derive(Debug, Default)]
pub struct RegionStats {
    /// Entities alive in the working copy
    live: AtomicU64,
    /// Entities visible in the last published snapshot
    stable: AtomicU64,
    moved: AtomicU64,
}

impl RegionStats {
    pub fn spawn(&self, count: u64) {
        self.live.fetch_add(count, Ordering::Relaxed);
    }

    pub fn stable(&self) -> u64 {
        self.stable.load(Ordering::Acquire)
    }

    pub fn moved(&self) -> u64 {
        self.moved.load(Ordering::Relaxed)
    }
}

pub struct Region {
    name: String,
    stats: Arc<RegionStats>,
    /// Moves queued in stage 0 and applied in stage 1
    staged: u64,
}

impl Region {
    pub fn new(x: i32, z: i32, stats: Arc<RegionStats>) -> Self {
        Self {
            name: format!("region[{x},{z}]"),
            stats,
            staged: 0,
        }
    }
}

impl UnitManager for Region {
    fn name(&self) -> &str {
        &self.name
    }

    fn stages(&self) -> u32 {
        2
    }

    fn start_tick_run(&mut self, ctx: &TickContext) -> TaskResult {
        match ctx.stage_index() {
            Some(0) => self.staged = self.stats.live.load(Ordering::Relaxed),
            Some(_) => {
                self.stats.moved.fetch_add(self.staged, Ordering::Relaxed);
                self.staged = 0;
            }
            None => {}
        }
        Ok(())
    }

    fn pre_snapshot_run(&self, ctx: &TickContext) -> TaskResult {
        trace!(region = %self.name, tick = ctx.tick(), "publishing snapshot");
        Ok(())
    }

    fn copy_snapshot_run(&mut self, _ctx: &TickContext) -> TaskResult {
        let live = self.stats.live.load(Ordering::Relaxed);
        self.stats.stable.store(live, Ordering::Release);
        Ok(())
    }

    fn halt_run(&mut self) {
        debug!(region = %self.name, entities = self.stats.stable(), "region halted");
    }
}

/// Unit halted last on shutdown; owns server-wide state
#[derive(Debug, Default)]
pub struct Server {
    ticks: u64,
}

impl UnitManager for Server {
    fn name(&self) -> &str {
        "server"
    }

    fn start_tick_run(&mut self, _ctx: &TickContext) -> TaskResult {
        self.ticks += 1;
        Ok(())
    }

    fn halt_run(&mut self) {
        debug!(ticks = self.ticks, "server unit halted");
    }
}
