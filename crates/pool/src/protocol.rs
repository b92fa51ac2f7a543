//! Wire protocol between the pool and out-of-process worker units
//!
//! Messages are JSON objects tagged by `"type"`, one per line, on the unit's
//! stdin (requests) and stdout (responses). A unit writes `ready` once its
//! job engine is loaded and exactly one `result` or `error` per task.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::LinesCodecError;

use crate::envelope::{JobOutput, TaskId, TaskOutcome, TaskPayload};

/// Longest accepted line; large enough for a base64 encoded image upload
pub const MAX_LINE_LENGTH: usize = 32 * 1024 * 1024;

/// Protocol failures
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("line codec error: {0}")]
    Codec(#[from] LinesCodecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Pool → unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnitRequest {
    /// Run one job
    Task { id: TaskId, payload: TaskPayload },

    /// Finish and exit cleanly
    Exit,
}

/// Unit → pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnitResponse {
    /// Job engine loaded, accepting tasks
    Ready,

    /// Job engine failed to load; the unit exits after sending this
    InitError { message: String },

    /// Task succeeded
    Result { id: TaskId, output: JobOutput },

    /// Task failed inside the job engine
    Error { id: TaskId, message: String },
}

impl UnitRequest {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

impl UnitResponse {
    /// Build the terminal response for a task
    pub fn from_outcome(id: TaskId, outcome: TaskOutcome) -> Self {
        match outcome {
            Ok(output) => Self::Result { id, output },
            Err(message) => Self::Error { id, message },
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(line.trim())?)
    }
}
