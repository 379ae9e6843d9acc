//! Error types for the tick scheduler

use std::time::Duration;

use smallvec::SmallVec;
use thiserror::Error;

use crate::stage::TickStage;

/// Boxed error returned by task bodies and unit hooks
pub type TaskError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result of running a task body or a unit phase hook
pub type TaskResult = Result<(), TaskError>;

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors raised by scheduling and unit operations
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The task manager no longer accepts work
    #[error("task manager `{0}` has been shut down")]
    ShutDown(String),

    /// Async work was submitted to a manager bound to a unit thread
    #[error("async tasks can only be scheduled on the main task manager, not `{0}`")]
    AsyncNotSupported(String),

    /// An OS thread could not be created
    #[error("failed to spawn thread `{name}`: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// A unit was asked to start a phase while the previous one was still running
    #[error("unit `{unit}` rejected {stage}: previous operation still active")]
    PulseRejected { unit: String, stage: TickStage },

    /// The unit executor has not been started
    #[error("unit `{0}` has not been started")]
    NotStarted(String),

    /// The unit executor has halted
    #[error("unit `{0}` has halted")]
    Halted(String),

    /// The executor (or scheduler loop) was already started
    #[error("`{0}` was already started")]
    AlreadyStarted(String),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors produced while loading or validating [`SchedulerConfig`](crate::SchedulerConfig)
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value could not be parsed
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    /// A duration that must be positive was zero
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    /// Backoff factor below one would shrink the timeout
    #[error("snapshot lock backoff must be finite and >= 1.0, got {0}")]
    Backoff(f64),

    /// An upper bound is below the value it caps
    #[error("{max} must be >= {min}")]
    Inverted { max: &'static str, min: &'static str },

    /// JSON parse failure
    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure of a single task execution, contained at the pulse boundary
#[derive(Debug, Error)]
pub enum TaskFailure {
    /// The body returned an error
    #[error("task returned an error: {0}")]
    Failed(TaskError),

    /// The body panicked
    #[error("task panicked: {0}")]
    Panicked(String),
}

impl TaskFailure {
    /// Convert a `catch_unwind` payload into a failure
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "<non-string panic payload>".to_string());
        Self::Panicked(message)
    }
}

/// A unit that had not finished its phase when a join deadline passed
#[derive(Debug, Clone)]
pub struct StalledUnit {
    pub unit: String,
    pub stage: Option<TickStage>,
    pub elapsed: Duration,
}

/// A stage join did not complete in time
#[derive(Debug, Error)]
#[error("{stage} did not complete within {timeout:?} ({} unit(s) stalled)", stalled.len())]
pub struct StageTimeout {
    pub stage: TickStage,
    pub timeout: Duration,
    pub stalled: SmallVec<[StalledUnit; 4]>,
}
