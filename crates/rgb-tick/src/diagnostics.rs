//! Stage-join and lock-contention diagnostics

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use smallvec::SmallVec;
use tracing::warn;

use crate::config::SchedulerConfig;
use crate::error::{StageTimeout, StalledUnit};
use crate::stage::TickStage;
use crate::unit::UnitExecutor;

/// Wait for every unit to finish its current phase within `timeout`
pub fn join_units(
    units: &[Arc<UnitExecutor>],
    stage: TickStage,
    timeout: Duration,
) -> Result<(), StageTimeout> {
    let deadline = Instant::now() + timeout;
    let stalled: SmallVec<[StalledUnit; 4]> = units
        .iter()
        .filter(|unit| !unit.pulse_join(deadline))
        .map(|unit| {
            let phase = unit.current_phase();
            StalledUnit {
                unit: unit.name().to_string(),
                stage: phase.map(|(stage, _)| stage),
                elapsed: phase.map_or(Duration::ZERO, |(_, elapsed)| elapsed),
            }
        })
        .collect();

    if stalled.is_empty() {
        Ok(())
    } else {
        Err(StageTimeout {
            stage,
            timeout,
            stalled,
        })
    }
}

/// Join, and on timeout log diagnostics and wait again. Never gives up on a
/// unit; returns how many retries were needed.
pub fn join_with_retry(units: &[Arc<UnitExecutor>], stage: TickStage, timeout: Duration) -> u32 {
    let mut retries = 0;
    while let Err(timeout) = join_units(units, stage, timeout) {
        retries += 1;
        report_stall(&timeout, retries);
        check_deadlocks();
    }
    retries
}

/// Log one warning per stalled unit
pub fn report_stall(timeout: &StageTimeout, attempt: u32) {
    warn!(
        stage = %timeout.stage,
        timeout_ms = timeout.timeout.as_millis() as u64,
        stalled = timeout.stalled.len(),
        attempt,
        "tick stage has not completed"
    );
    for unit in &timeout.stalled {
        warn!(
            unit = %unit.unit,
            phase = ?unit.stage,
            elapsed_ms = unit.elapsed.as_millis() as u64,
            "unit has not finished its phase"
        );
    }
}

/// Log every deadlock cycle parking_lot can see; returns the number of cycles
#[cfg(feature = "deadlock_detection")]
pub fn check_deadlocks() -> usize {
    let deadlocks = parking_lot::deadlock::check_deadlock();
    for (cycle, threads) in deadlocks.iter().enumerate() {
        for thread in threads {
            tracing::error!(
                cycle,
                thread_id = ?thread.thread_id(),
                backtrace = ?thread.backtrace(),
                "deadlock detected"
            );
        }
    }
    deadlocks.len()
}

#[cfg(not(feature = "deadlock_detection"))]
pub fn check_deadlocks() -> usize {
    0
}

/// Growing, capped, jittered timeout for snapshot lock attempts
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    factor: f64,
    max: Duration,
    jitter: f64,
}

impl Backoff {
    #[must_use]
    pub fn new(initial: Duration, factor: f64, max: Duration, jitter: f64) -> Self {
        Self {
            current: initial.min(max),
            factor: factor.max(1.0),
            max,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    #[must_use]
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(
            Duration::from_millis(config.snapshot_lock_timeout_ms),
            config.snapshot_lock_backoff,
            Duration::from_millis(config.snapshot_lock_max_timeout_ms),
            config.snapshot_lock_jitter,
        )
    }

    #[inline]
    #[must_use]
    pub const fn current(&self) -> Duration {
        self.current
    }

    /// Grow the timeout and return the new value
    pub fn advance(&mut self) -> Duration {
        let spread = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..=self.jitter)
        } else {
            0.0
        };
        let grown = self.current.as_secs_f64() * self.factor * (1.0 + spread);
        self.current = Duration::try_from_secs_f64(grown)
            .unwrap_or(self.max)
            .min(self.max);
        self.current
    }
}
