//! Scheduler configuration
//!
//! Defaults match a 20 pulses-per-second server. Values can be loaded from
//! JSON or overridden through `RGB_TICK_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Prefix for environment overrides, e.g. `RGB_TICK_PULSE_MS=25`
pub const ENV_PREFIX: &str = "RGB_TICK_";

/// Timing and diagnostic knobs for [`GlobalScheduler`](crate::GlobalScheduler)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Target pulse period
    pub pulse_ms: u64,
    /// How long a stage join waits before logging diagnostics and retrying
    pub stage_join_timeout_ms: u64,
    /// First snapshot write-lock attempt
    pub snapshot_lock_timeout_ms: u64,
    /// Timeout multiplier applied after each failed write-lock attempt
    pub snapshot_lock_backoff: f64,
    /// Upper bound for the write-lock timeout
    pub snapshot_lock_max_timeout_ms: u64,
    /// Random fraction added on top of each backoff step
    pub snapshot_lock_jitter: f64,
    /// Read-lock owners holding access longer than this are named in warnings
    pub lock_violation_threshold_ms: u64,
    /// After stalling this long, also list threads holding core read locks
    pub stall_dump_after_ms: u64,
    /// Warn (and resynchronize) when the loop falls this far behind
    pub behind_schedule_warn_ms: u64,
    /// Negative remaining tick time tolerated before reporting overload
    pub overload_grace_ms: u64,
    /// Pulses between weak-reference prune sweeps of spatial tasks
    pub prune_interval_ticks: u64,
    /// First wait for async workers during shutdown
    pub shutdown_wait_ms: u64,
    /// Cap for the shutdown wait
    pub shutdown_wait_max_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let pulse_ms = 50;
        Self {
            pulse_ms,
            stage_join_timeout_ms: pulse_ms << 4,
            snapshot_lock_timeout_ms: 500,
            snapshot_lock_backoff: 1.5,
            snapshot_lock_max_timeout_ms: 8000,
            snapshot_lock_jitter: 0.1,
            lock_violation_threshold_ms: 50,
            stall_dump_after_ms: 2000,
            behind_schedule_warn_ms: 10_000,
            overload_grace_ms: 10,
            prune_interval_ticks: 20,
            shutdown_wait_ms: 2000,
            shutdown_wait_max_ms: 8000,
        }
    }
}

impl SchedulerConfig {
    /// Parse a JSON document; missing fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `RGB_TICK_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup (keys include [`ENV_PREFIX`])
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        read(&lookup, "PULSE_MS", &mut self.pulse_ms)?;
        read(&lookup, "STAGE_JOIN_TIMEOUT_MS", &mut self.stage_join_timeout_ms)?;
        read(&lookup, "SNAPSHOT_LOCK_TIMEOUT_MS", &mut self.snapshot_lock_timeout_ms)?;
        read(&lookup, "SNAPSHOT_LOCK_BACKOFF", &mut self.snapshot_lock_backoff)?;
        read(&lookup, "SNAPSHOT_LOCK_MAX_TIMEOUT_MS", &mut self.snapshot_lock_max_timeout_ms)?;
        read(&lookup, "SNAPSHOT_LOCK_JITTER", &mut self.snapshot_lock_jitter)?;
        read(&lookup, "LOCK_VIOLATION_THRESHOLD_MS", &mut self.lock_violation_threshold_ms)?;
        read(&lookup, "STALL_DUMP_AFTER_MS", &mut self.stall_dump_after_ms)?;
        read(&lookup, "BEHIND_SCHEDULE_WARN_MS", &mut self.behind_schedule_warn_ms)?;
        read(&lookup, "OVERLOAD_GRACE_MS", &mut self.overload_grace_ms)?;
        read(&lookup, "PRUNE_INTERVAL_TICKS", &mut self.prune_interval_ticks)?;
        read(&lookup, "SHUTDOWN_WAIT_MS", &mut self.shutdown_wait_ms)?;
        read(&lookup, "SHUTDOWN_WAIT_MAX_MS", &mut self.shutdown_wait_max_ms)?;
        self.validate()?;
        Ok(self)
    }

    /// Reject values the scheduler cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("pulse_ms", self.pulse_ms),
            ("stage_join_timeout_ms", self.stage_join_timeout_ms),
            ("snapshot_lock_timeout_ms", self.snapshot_lock_timeout_ms),
            ("prune_interval_ticks", self.prune_interval_ticks),
            ("shutdown_wait_ms", self.shutdown_wait_ms),
            ("snapshot_lock_max_timeout_ms", self.snapshot_lock_max_timeout_ms),
            ("shutdown_wait_max_ms", self.shutdown_wait_max_ms),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero(name));
        }
        if !self.snapshot_lock_backoff.is_finite() || self.snapshot_lock_backoff < 1.0 {
            return Err(ConfigError::Backoff(self.snapshot_lock_backoff));
        }
        if self.snapshot_lock_max_timeout_ms < self.snapshot_lock_timeout_ms {
            return Err(ConfigError::Inverted {
                max: "snapshot_lock_max_timeout_ms",
                min: "snapshot_lock_timeout_ms",
            });
        }
        Ok(())
    }

    #[inline]
    #[must_use]
    pub const fn pulse(&self) -> Duration {
        Duration::from_millis(self.pulse_ms)
    }

    #[inline]
    #[must_use]
    pub const fn stage_join_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_join_timeout_ms)
    }

    #[inline]
    #[must_use]
    pub const fn lock_violation_threshold(&self) -> Duration {
        Duration::from_millis(self.lock_violation_threshold_ms)
    }

    #[inline]
    #[must_use]
    pub const fn stall_dump_after(&self) -> Duration {
        Duration::from_millis(self.stall_dump_after_ms)
    }
}

fn read<T, F>(lookup: &F, key: &str, slot: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let name = format!("{ENV_PREFIX}{key}");
    let Some(raw) = lookup(&name) else {
        return Ok(());
    };
    *slot = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: name,
        value: raw.clone(),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.pulse_ms, 50);
        assert_eq!(config.stage_join_timeout_ms, 800);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let config = SchedulerConfig::from_json(r#"{ "pulse_ms": 25, "prune_interval_ticks": 5 }"#)
            .expect("valid json");
        assert_eq!(config.pulse_ms, 25);
        assert_eq!(config.prune_interval_ticks, 5);
        assert_eq!(config.snapshot_lock_timeout_ms, 500);
    }

    #[test]
    fn test_from_json_rejects_zero_pulse() {
        let err = SchedulerConfig::from_json(r#"{ "pulse_ms": 0 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Zero("pulse_ms")));
    }

    #[test]
    fn test_overrides() {
        let config = SchedulerConfig::default()
            .with_overrides(|key| match key {
                "RGB_TICK_PULSE_MS" => Some("20".into()),
                "RGB_TICK_SNAPSHOT_LOCK_BACKOFF" => Some(" 2.0 ".into()),
                _ => None,
            })
            .expect("valid overrides");
        assert_eq!(config.pulse(), Duration::from_millis(20));
        assert!((config.snapshot_lock_backoff - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_overrides_invalid_value() {
        let err = SchedulerConfig::default()
            .with_overrides(|key| (key == "RGB_TICK_PULSE_MS").then(|| "fast".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "RGB_TICK_PULSE_MS"));
    }

    #[test]
    fn test_backoff_below_one() {
        let config = SchedulerConfig {
            snapshot_lock_backoff: 0.5,
            ..SchedulerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Backoff(_))));
    }

    #[test]
    fn test_backoff_must_be_finite() {
        for backoff in [f64::INFINITY, f64::NAN] {
            let config = SchedulerConfig {
                snapshot_lock_backoff: backoff,
                ..SchedulerConfig::default()
            };
            assert!(matches!(config.validate(), Err(ConfigError::Backoff(_))), "{backoff}");
        }
        let err = SchedulerConfig::default()
            .with_overrides(|key| (key == "RGB_TICK_SNAPSHOT_LOCK_BACKOFF").then(|| "inf".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Backoff(_)));

        // large but finite factors are fine; the timeout saturates at the cap
        let config = SchedulerConfig {
            snapshot_lock_backoff: 1e30,
            ..SchedulerConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_inverted_lock_timeouts() {
        let config = SchedulerConfig {
            snapshot_lock_timeout_ms: 500,
            snapshot_lock_max_timeout_ms: 100,
            ..SchedulerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Inverted { max: "snapshot_lock_max_timeout_ms", .. })
        ));
    }

    #[test]
    fn test_rejects_zero_caps() {
        let err = SchedulerConfig::from_json(r#"{ "snapshot_lock_max_timeout_ms": 0 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Zero(_)));
        let err = SchedulerConfig::from_json(r#"{ "shutdown_wait_max_ms": 0 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Zero("shutdown_wait_max_ms")));
    }
}
