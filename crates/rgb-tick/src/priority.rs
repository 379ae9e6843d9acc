//! Task priority classes and their deferral budgets

use std::fmt;

use serde::{Deserialize, Serialize};

/// Priority class of a task
///
/// Under overload a due task may be postponed by one pulse at a time until it
/// has been deferred for longer than [`max_deferred`](Self::max_deferred).
/// `Critical` tasks are never deferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    #[default]
    Critical,
    Highest,
    High,
    AboveNormal,
    Normal,
    BelowNormal,
    Low,
    Lowest,
}

impl TaskPriority {
    pub const ALL: [Self; 8] = [
        Self::Critical,
        Self::Highest,
        Self::High,
        Self::AboveNormal,
        Self::Normal,
        Self::BelowNormal,
        Self::Low,
        Self::Lowest,
    ];

    /// Maximum time (in up-time milliseconds) a task of this class may be deferred
    #[inline]
    #[must_use]
    pub const fn max_deferred(self) -> u64 {
        match self {
            Self::Critical => 0,
            Self::Highest => 500,
            Self::High => 2000,
            Self::AboveNormal => 5000,
            Self::Normal => 10_000,
            Self::BelowNormal => 20_000,
            Self::Low => 35_000,
            Self::Lowest => 50_000,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_deferrable(self) -> bool {
        self.max_deferred() > 0
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Critical => "critical",
            Self::Highest => "highest",
            Self::High => "high",
            Self::AboveNormal => "above-normal",
            Self::Normal => "normal",
            Self::BelowNormal => "below-normal",
            Self::Low => "low",
            Self::Lowest => "lowest",
        };
        f.write_str(name)
    }
}
