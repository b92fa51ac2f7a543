//! # Scribe Worker Pool
//!
//! A bounded execution engine for CPU-intensive, long-running jobs such as OCR.
//!
//! ## Features
//!
//! - **Isolated worker units**: each unit owns its job engine; no shared mutable state
//! - **Bounded concurrency**: one task per unit, overflow waits in a FIFO queue
//! - **Hard deadlines**: a task that overruns its deadline gets its unit killed
//! - **Self-healing**: crashed or killed units are replaced asynchronously
//! - **Explicit lifecycle**: `initialize` / `shutdown` barriers and a health snapshot
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 WorkerPool (cloneable handle)                │
//! │        submit() / initialize() / shutdown() / snapshot()     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ commands (mpsc)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Coordinator (single tokio task)              │
//! │   idle free-list · FIFO wait queue · deadline timers         │
//! └─────────────────────────────────────────────────────────────┘
//!                 │ TaskEnvelope              ▲ UnitEvent
//!                 ▼                           │
//! ┌───────────────────┐ ┌───────────────────┐ ┌───────────────────┐
//! │   Worker unit 1   │ │   Worker unit 2   │ │   Worker unit N   │
//! │ (process / task)  │ │ (process / task)  │ │ (process / task)  │
//! └───────────────────┘ └───────────────────┘ └───────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use scribe_pool::prelude::*;
//!
//! let launcher = ProcessLauncher::new("/usr/local/bin/scribe-worker")
//!     .with_args(["--engine", "tesseract"]);
//! let pool = WorkerPool::new(WorkerPoolConfig::from_env(), launcher);
//!
//! pool.initialize().await?;
//! let output = pool.submit(TaskPayload::new(image_bytes), Duration::from_secs(30)).await?;
//! println!("{}", output.text);
//! pool.shutdown().await;
//! ```

pub mod config;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod lifecycle;
pub mod pool;
pub mod protocol;
pub mod sim;
pub mod telemetry;
pub mod unit;
pub mod worker_main;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::WorkerPoolConfig;
    pub use crate::engine::{EngineFactory, JobEngine};
    pub use crate::envelope::{JobOutput, TaskEnvelope, TaskId, TaskPayload};
    pub use crate::error::{InitError, TaskError};
    pub use crate::lifecycle::Lifecycle;
    pub use crate::pool::{PoolSnapshot, ReplacementPolicy, TaskHandle, WorkerPool};
    pub use crate::unit::{LocalLauncher, ProcessLauncher, UnitLauncher};
}

// Re-export key types at crate root
pub use config::{ConfigError, WorkerPoolConfig};
pub use engine::{EngineFactory, JobEngine};
pub use envelope::{JobOutput, TaskEnvelope, TaskId, TaskOutcome, TaskPayload};
pub use error::{InitError, TaskError};
pub use lifecycle::Lifecycle;
pub use pool::{PoolSnapshot, ReplacementPolicy, TaskHandle, WorkerPool};
pub use unit::{
    LaunchError, LocalLauncher, ProcessLauncher, TerminationReason, UnitHandle, UnitId,
    UnitLauncher, UnitState,
};
