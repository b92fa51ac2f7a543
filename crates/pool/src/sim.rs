// Simulation Engine
//
// A fake job engine for tests and smoke runs. Each job's behavior is driven
// by the payload options:
// - `delay_ms`: await this long (cooperative)
// - `spin_ms`: busy-loop this long without ever yielding
// - `fail`: report an engine error with this message
// - `crash`: panic inside the unit
// - `echo`: return the input as UTF-8 text (default true)
//
// Factory options control startup (an init delay, a forced init failure, a
// cap on how many engines may be created) and a base delay added to every job.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::engine::{EngineFactory, JobEngine};
use crate::envelope::{JobOutput, TaskPayload};

// ============================================================================
// Per-job options
// ============================================================================

/// Per-job behavior, read from [`TaskPayload::options`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimOptions {
    pub delay_ms: u64,
    pub spin_ms: u64,
    pub fail: Option<String>,
    pub crash: bool,
    pub echo: bool,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            delay_ms: 0,
            spin_ms: 0,
            fail: None,
            crash: false,
            echo: true,
        }
    }
}

impl SimOptions {
    pub fn delay(ms: u64) -> Self {
        Self {
            delay_ms: ms,
            ..Default::default()
        }
    }

    pub fn spin(ms: u64) -> Self {
        Self {
            spin_ms: ms,
            ..Default::default()
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            fail: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn crash() -> Self {
        Self {
            crash: true,
            ..Default::default()
        }
    }

    /// Build a payload carrying these options
    pub fn payload(&self, input: impl Into<Vec<u8>>) -> TaskPayload {
        TaskPayload::new(input).with_options(serde_json::to_value(self).unwrap_or_default())
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Simulated engine owned by one unit
#[derive(Debug, Default)]
pub struct SimEngine {
    runs: u64,
    job_delay: Duration,
}

#[async_trait]
impl JobEngine for SimEngine {
    async fn run(&mut self, payload: TaskPayload) -> Result<JobOutput, String> {
        let options: SimOptions = payload
            .options_as()
            .map_err(|e| format!("invalid sim options: {}", e))?;
        self.runs += 1;

        let delay = self.job_delay + Duration::from_millis(options.delay_ms);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if options.spin_ms > 0 {
            let until = Instant::now() + Duration::from_millis(options.spin_ms);
            while Instant::now() < until {
                std::hint::spin_loop();
            }
        }
        if options.crash {
            panic!("simulated crash");
        }
        if let Some(message) = options.fail {
            return Err(message);
        }

        let text = if options.echo {
            String::from_utf8_lossy(&payload.input).into_owned()
        } else {
            String::new()
        };
        Ok(JobOutput::new(text).with_metadata(json!({
            "engine": "sim",
            "runs": self.runs,
        })))
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Creates [`SimEngine`]s and counts how many it has created
///
/// Clones share the counter.
#[derive(Debug, Clone, Default)]
pub struct SimEngineFactory {
    init_delay: Duration,
    init_failure: Option<String>,
    max_inits: Option<usize>,
    job_delay: Duration,
    inits: Arc<AtomicUsize>,
}

impl SimEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every engine load
    pub fn with_init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = delay;
        self
    }

    /// Make every engine load fail
    pub fn with_init_failure(mut self, message: impl Into<String>) -> Self {
        self.init_failure = Some(message.into());
        self
    }

    /// Allow only this many successful loads; later ones fail
    pub fn with_max_inits(mut self, max: usize) -> Self {
        self.max_inits = Some(max);
        self
    }

    /// Add a fixed delay to every job the engines run
    pub fn with_job_delay(mut self, delay: Duration) -> Self {
        self.job_delay = delay;
        self
    }

    /// Number of engine loads attempted so far
    pub fn init_count(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineFactory for SimEngineFactory {
    type Engine = SimEngine;

    async fn init(&self) -> Result<SimEngine, String> {
        let attempt = self.inits.fetch_add(1, Ordering::SeqCst) + 1;

        if !self.init_delay.is_zero() {
            tokio::time::sleep(self.init_delay).await;
        }
        if let Some(message) = &self.init_failure {
            return Err(message.clone());
        }
        if self.max_inits.is_some_and(|max| attempt > max) {
            return Err(format!("engine load {} exceeds limit", attempt));
        }
        Ok(SimEngine {
            runs: 0,
            job_delay: self.job_delay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo() {
        let mut engine = SimEngine::default();
        let output = engine.run(TaskPayload::new("hello")).await.unwrap();
        assert_eq!(output.text, "hello");
        assert_eq!(output.metadata["engine"], "sim");
        assert_eq!(output.metadata["runs"], 1);

        let output = engine.run(TaskPayload::new("again")).await.unwrap();
        assert_eq!(output.metadata["runs"], 2);
    }

    #[tokio::test]
    async fn test_failure() {
        let mut engine = SimEngine::default();
        let result = engine.run(SimOptions::fail("unreadable").payload("x")).await;
        assert_eq!(result, Err("unreadable".to_string()));
    }

    #[tokio::test]
    async fn test_echo_disabled() {
        let mut engine = SimEngine::default();
        let options = SimOptions {
            echo: false,
            ..Default::default()
        };
        let output = engine.run(options.payload("secret")).await.unwrap();
        assert_eq!(output.text, "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_uses_tokio_time() {
        let mut engine = SimEngine::default();
        let start = tokio::time::Instant::now();
        engine.run(SimOptions::delay(250).payload("x")).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_factory_limits() {
        let factory = SimEngineFactory::new().with_max_inits(1);
        assert!(factory.init().await.is_ok());
        assert!(factory.init().await.is_err());
        assert_eq!(factory.clone().init_count(), 2);

        let failing = SimEngineFactory::new().with_init_failure("no model");
        assert_eq!(failing.init().await.err(), Some("no model".to_string()));
    }
}
