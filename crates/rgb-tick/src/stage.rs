//! Tick stages and the context handed to every phase call

use std::fmt;

/// Phase of a pulse
///
/// A pulse always moves through the stages in declaration order:
/// `TickStart → Stage(0..N) → Finalize → PreSnapshot → Snapshot`.
/// `Shutdown` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TickStage {
    /// Serial phase on the scheduler thread
    TickStart,
    /// Parallel stage `k` across all execution units
    Stage(u32),
    /// Per-unit resolution of cross-unit effects
    Finalize,
    /// Read-only monitor stage
    PreSnapshot,
    /// Live state is copied into the stable snapshot under the exclusive lock
    Snapshot,
    /// Units are being halted
    Shutdown,
}

impl TickStage {
    /// Whether units may mutate live state during this stage
    #[must_use]
    pub const fn allows_live_mutation(self) -> bool {
        matches!(self, Self::Stage(_) | Self::Finalize)
    }
}

impl fmt::Display for TickStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TickStart => f.write_str("tick start"),
            Self::Stage(k) => write!(f, "stage {k}"),
            Self::Finalize => f.write_str("finalize"),
            Self::PreSnapshot => f.write_str("pre-snapshot"),
            Self::Snapshot => f.write_str("snapshot"),
            Self::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// Context passed explicitly into every unit phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickContext {
    stage: TickStage,
    delta: u64,
    tick: u64,
}

impl TickContext {
    #[must_use]
    pub const fn new(stage: TickStage, delta: u64, tick: u64) -> Self {
        Self { stage, delta, tick }
    }

    /// Same pulse, different stage
    #[must_use]
    pub const fn with_stage(self, stage: TickStage) -> Self {
        Self { stage, ..self }
    }

    #[inline]
    #[must_use]
    pub const fn stage(&self) -> TickStage {
        self.stage
    }

    /// Milliseconds elapsed since the previous pulse started
    #[inline]
    #[must_use]
    pub const fn delta(&self) -> u64 {
        self.delta
    }

    /// Pulse counter, starting at 1
    #[inline]
    #[must_use]
    pub const fn tick(&self) -> u64 {
        self.tick
    }

    /// Index of the parallel stage, if this is one
    #[inline]
    #[must_use]
    pub const fn stage_index(&self) -> Option<u32> {
        match self.stage {
            TickStage::Stage(k) => Some(k),
            _ => None,
        }
    }
}
