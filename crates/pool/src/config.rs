//! Worker pool configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::pool::ReplacementPolicy;

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Pool must have at least one unit
    #[error("pool_size must be at least 1")]
    EmptyPool,

    /// A timeout was configured as zero
    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),

    /// The replacement backoff cannot produce valid delays
    #[error("invalid replacement policy: {0}")]
    InvalidReplacement(&'static str),
}

/// Worker pool configuration
///
/// # Example
///
/// ```
/// use scribe_pool::WorkerPoolConfig;
/// use std::time::Duration;
///
/// let config = WorkerPoolConfig::default()
///     .with_pool_size(4)
///     .with_task_timeout(Duration::from_secs(10))
///     .with_max_queue(64);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerPoolConfig {
    /// Number of worker units kept alive
    pub pool_size: usize,

    /// Default per-task deadline, counted from dispatch
    #[serde(with = "duration_millis")]
    pub task_timeout: Duration,

    /// How long `initialize` waits for every unit to become ready
    #[serde(with = "duration_millis")]
    pub startup_timeout: Duration,

    /// Wait queue bound (None = unbounded)
    #[serde(default)]
    pub max_queue: Option<usize>,

    /// Backoff for replacing dead units
    #[serde(default)]
    pub replacement: ReplacementPolicy,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 2,
            task_timeout: Duration::from_secs(30),
            startup_timeout: Duration::from_secs(60),
            max_queue: None,
            replacement: ReplacementPolicy::default(),
        }
    }
}

impl WorkerPoolConfig {
    /// Create a configuration with the given pool size
    pub fn new(pool_size: usize) -> Self {
        Self {
            pool_size,
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `OCR_WORKER_THREADS`: Number of worker units (default: 2)
    /// - `OCR_TIMEOUT_MS`: Per-task deadline in milliseconds (default: 30000)
    /// - `OCR_STARTUP_TIMEOUT_MS`: Unit readiness timeout (default: 60000)
    /// - `OCR_QUEUE_LIMIT`: Maximum queued tasks (default: unbounded)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let pool_size = env_parse("OCR_WORKER_THREADS").unwrap_or(defaults.pool_size);
        let task_timeout = env_parse("OCR_TIMEOUT_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.task_timeout);
        let startup_timeout = env_parse("OCR_STARTUP_TIMEOUT_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.startup_timeout);
        let max_queue = env_parse("OCR_QUEUE_LIMIT");

        Self {
            pool_size,
            task_timeout,
            startup_timeout,
            max_queue,
            ..defaults
        }
    }

    /// Set the number of worker units
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the default task deadline
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Set the startup readiness timeout
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Bound the wait queue
    pub fn with_max_queue(mut self, limit: usize) -> Self {
        self.max_queue = Some(limit);
        self
    }

    /// Set the replacement policy
    pub fn with_replacement(mut self, policy: ReplacementPolicy) -> Self {
        self.replacement = policy;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::EmptyPool);
        }
        if self.task_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("task_timeout"));
        }
        if self.startup_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("startup_timeout"));
        }
        self.replacement.validate()
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    let raw = std::env::var(var).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var, value = %raw, "Ignoring unparsable environment variable");
            None
        }
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
