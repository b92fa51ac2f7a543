//! Job engine abstraction
//!
//! A job engine is the expensive-to-load thing a worker unit owns (an OCR
//! model, a codec). It is created once per unit by an [`EngineFactory`] and
//! then reused for every task the unit runs.

use async_trait::async_trait;

use crate::envelope::{JobOutput, TaskPayload};

/// Runs jobs inside a single worker unit
///
/// Engines are never shared between units; `run` gets exclusive access.
#[async_trait]
pub trait JobEngine: Send + 'static {
    /// Run one job. An `Err` is reported to the submitter as an engine
    /// failure; the unit stays alive.
    async fn run(&mut self, payload: TaskPayload) -> Result<JobOutput, String>;
}

/// Builds one job engine per worker unit
#[async_trait]
pub trait EngineFactory: Send + Sync + 'static {
    type Engine: JobEngine;

    /// Load the engine. Called once when a unit starts.
    async fn init(&self) -> Result<Self::Engine, String>;
}
