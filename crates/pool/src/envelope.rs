//! Task envelope: what goes into a worker unit and what comes back

use std::fmt;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Pool-assigned task identifier
///
/// Only used for log correlation and for matching results and deadline
/// timers to the dispatch they belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Opaque job input
///
/// The pool never looks inside; only the job engine in the unit interprets
/// `input` and `options`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    /// Raw job input (e.g. image bytes), base64 on the wire
    #[serde(with = "base64_bytes")]
    pub input: Vec<u8>,

    /// Engine-specific options
    #[serde(default)]
    pub options: serde_json::Value,
}

impl TaskPayload {
    /// Create a payload with no options
    pub fn new(input: impl Into<Vec<u8>>) -> Self {
        Self {
            input: input.into(),
            options: serde_json::Value::Null,
        }
    }

    /// Attach engine options
    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }

    /// Decode the options into an engine-specific type
    ///
    /// Missing options decode as an empty object, so option structs with
    /// `#[serde(default)]` get their defaults.
    pub fn options_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        if self.options.is_null() {
            serde_json::from_value(serde_json::Value::Object(Default::default()))
        } else {
            serde_json::from_value(self.options.clone())
        }
    }
}

/// Successful job result: text plus engine metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutput {
    pub text: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl JobOutput {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A task as delivered to a worker unit
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEnvelope {
    pub id: TaskId,
    pub payload: TaskPayload,
    /// Deadline counted from the moment of dispatch
    pub deadline: Duration,
}

/// The single terminal message a unit produces per accepted task
pub type TaskOutcome = Result<JobOutput, String>;

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
