//! Worker units
//!
//! A unit is an isolated executor that owns one job engine and runs at most
//! one task at a time. Units report back to the coordinator through a shared
//! event channel; the coordinator talks to them through [`UnitHandle`].
//!
//! Two launchers are provided:
//! - [`ProcessLauncher`]: each unit is an OS process speaking the
//!   [`protocol`](crate::protocol) over stdio. Hard kill is `SIGKILL`, so a
//!   unit stuck in native code is always reclaimed.
//! - [`LocalLauncher`]: each unit is a tokio task. Kill is `abort()`, which
//!   only takes effect at an await point.

mod local;
mod process;
mod signals;

use std::fmt;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::envelope::{TaskEnvelope, TaskId, TaskOutcome};

pub use local::LocalLauncher;
pub use process::{ProcessLauncher, UNIT_ID_ENV};
pub use signals::{classify_exit, TerminationReason};

/// Identity of a unit instance
///
/// Replacements get a fresh id, so events from a dead unit can never be
/// mistaken for events from its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(u64);

impl UnitId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit-{}", self.0)
    }
}

/// Unit state as tracked by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    /// Launched, job engine still loading
    Initializing,
    /// Idle, in the free list
    Ready,
    /// Running exactly one task
    Busy,
}

/// Something a unit reports to the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum UnitEvent {
    /// Job engine loaded
    Ready,
    /// Job engine failed to load
    InitFailed(String),
    /// Terminal outcome for a dispatched task
    Finished { task: TaskId, outcome: TaskOutcome },
    /// The unit died without being told to
    Exited(TerminationReason),
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnitMessage {
    pub unit: UnitId,
    pub event: UnitEvent,
}

pub type EventSender = mpsc::UnboundedSender<UnitMessage>;

/// Failure to start a unit
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn worker process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Starts worker units
pub trait UnitLauncher: Send + Sync + 'static {
    /// Start a unit. Must be called inside a tokio runtime; the unit reports
    /// `Ready` or `InitFailed` on `events` once its engine has loaded.
    fn launch(&self, id: UnitId, events: EventSender) -> Result<Box<dyn UnitHandle>, LaunchError>;
}

/// Coordinator-side handle to a running unit
pub trait UnitHandle: Send {
    fn id(&self) -> UnitId;

    /// Hand a task to the unit. Gives the task back if the unit is gone.
    fn dispatch(&mut self, task: TaskEnvelope) -> Result<(), TaskEnvelope>;

    /// Hard-kill the unit and wait until it is gone
    ///
    /// A unit that is terminated does not report `Exited`.
    fn terminate(self: Box<Self>) -> BoxFuture<'static, TerminationReason>;
}
