//! Errors surfaced by the worker pool
//!
//! Pool-level failures ([`InitError`]) abort startup. Per-task failures
//! ([`TaskError`]) are delivered only to the task they belong to.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::unit::{TerminationReason, UnitId};

/// Fatal startup errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InitError {
    /// Invalid pool configuration
    #[error("invalid pool configuration: {0}")]
    Config(#[from] ConfigError),

    /// A unit could not be started at all
    #[error("worker unit {unit} failed to launch: {message}")]
    Launch { unit: UnitId, message: String },

    /// A unit started but its job engine failed to load
    #[error("worker unit {unit} failed to initialize: {message}")]
    Engine { unit: UnitId, message: String },

    /// A unit exited before signalling readiness
    #[error("worker unit {unit} exited during startup: {reason}")]
    Exited {
        unit: UnitId,
        reason: TerminationReason,
    },

    /// Not every unit became ready in time
    #[error("worker units not ready after {0:?}")]
    StartupTimeout(Duration),

    /// The pool was shut down before or during initialization
    #[error("worker pool has been shut down")]
    ShutDown,
}

/// Per-task failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    /// The job engine reported an error for this task
    #[error("job engine failure: {0}")]
    EngineFailure(String),

    /// The task overran its deadline and its unit was killed
    #[error("task timed out after {0:?}")]
    TimedOut(Duration),

    /// The unit running the task died unexpectedly
    #[error("worker unit {unit} crashed: {reason}")]
    UnitCrashed {
        unit: UnitId,
        reason: TerminationReason,
    },

    /// `submit` was called before `initialize` completed
    #[error("worker pool is not initialized")]
    PoolNotInitialized,

    /// `submit` was called after shutdown started
    #[error("worker pool is shutting down")]
    PoolShuttingDown,

    /// The task was queued or running when shutdown started
    #[error("task abandoned by pool shutdown")]
    ShutdownAbandoned,

    /// The wait queue is at its configured limit
    #[error("wait queue is full ({0} tasks)")]
    QueueFull(usize),

    /// `submit` was given a zero deadline
    #[error("task deadline must be greater than zero")]
    InvalidDeadline,

    /// Every unit is gone and replacement has given up
    #[error("worker pool has no remaining capacity")]
    NoCapacity,
}

impl TaskError {
    /// Whether the task failed because it ran past its deadline
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut(_))
    }

    /// Whether the failure came from the pool rather than from the job itself
    pub fn is_pool_failure(&self) -> bool {
        matches!(
            self,
            Self::PoolNotInitialized
                | Self::PoolShuttingDown
                | Self::ShutdownAbandoned
                | Self::QueueFull(_)
                | Self::NoCapacity
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_error_classification() {
        assert!(TaskError::TimedOut(Duration::from_millis(50)).is_timeout());
        assert!(!TaskError::EngineFailure("bad image".into()).is_timeout());

        assert!(TaskError::QueueFull(8).is_pool_failure());
        assert!(TaskError::ShutdownAbandoned.is_pool_failure());
        assert!(!TaskError::EngineFailure("bad image".into()).is_pool_failure());
        assert!(!TaskError::UnitCrashed {
            unit: UnitId::new(3),
            reason: TerminationReason::Exited(1),
        }
        .is_pool_failure());
    }

    #[test]
    fn test_error_display() {
        let err = TaskError::UnitCrashed {
            unit: UnitId::new(7),
            reason: TerminationReason::Exited(101),
        };
        assert_eq!(err.to_string(), "worker unit unit-7 crashed: exited with code 101");

        let err = InitError::Engine {
            unit: UnitId::new(1),
            message: "tesseract not found".into(),
        };
        assert!(err.to_string().contains("tesseract not found"));
    }
}
