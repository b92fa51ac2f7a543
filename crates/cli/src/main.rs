// Scribe CLI
//
// Design Decision: Use clap derive for ergonomic argument parsing.
// Design Decision: Support text/json/yaml output formats for scripting.
// Design Decision: Each worker unit is a scribe-worker process so stuck OCR jobs can be killed.
// Design Decision: Flags override environment configuration, which overrides defaults.

mod commands;
mod output;
mod service;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use scribe_pool::telemetry::{init_telemetry, TelemetryConfig};
use scribe_pool::{Lifecycle, ProcessLauncher, WorkerPool, WorkerPoolConfig};
use tracing::info;

use crate::service::OcrService;

const WORKER_BIN_NAME: &str = "scribe-worker";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Engine {
    /// OCR through the tesseract program
    Tesseract,
    /// Simulation engine (echoes input) for smoke tests
    Sim,
}

impl Engine {
    fn as_arg(self) -> &'static str {
        match self {
            Engine::Tesseract => "tesseract",
            Engine::Sim => "sim",
        }
    }
}

#[derive(Parser)]
#[command(name = "scribe")]
#[command(about = "Scribe CLI - Extract text from images with a pool of OCR workers")]
#[command(version)]
pub struct Cli {
    /// Number of worker units [env: OCR_WORKER_THREADS]
    #[arg(long, short)]
    pub workers: Option<usize>,

    /// Per-image deadline in milliseconds [env: OCR_TIMEOUT_MS]
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Maximum images waiting for a worker [env: OCR_QUEUE_LIMIT]
    #[arg(long)]
    pub queue_limit: Option<usize>,

    /// Job engine loaded by each worker
    #[arg(long, env = "SCRIBE_ENGINE", value_enum, default_value_t = Engine::Tesseract)]
    pub engine: Engine,

    /// Path to the scribe-worker binary (defaults to the one next to this program)
    #[arg(long, env = "SCRIBE_WORKER_BIN")]
    pub worker_bin: Option<PathBuf>,

    /// Default OCR language(s), e.g. "eng" or "eng+deu"
    #[arg(long, env = "OCR_LANGUAGES", default_value = "eng")]
    pub lang: String,

    /// Output format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json", "yaml"])]
    pub output: String,

    /// Suppress non-essential output
    #[arg(long, short)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Extract text from image files (JPEG, PNG or WebP, up to 5MB each)
    Ocr {
        /// Image files to process
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Language override for these files
        #[arg(long)]
        language: Option<String>,
    },

    /// Start the worker pool and report its health
    Check,
}

impl Cli {
    fn pool_config(&self) -> WorkerPoolConfig {
        let mut config = WorkerPoolConfig::from_env();
        if let Some(workers) = self.workers {
            config = config.with_pool_size(workers);
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config = config.with_task_timeout(Duration::from_millis(timeout_ms));
        }
        if let Some(limit) = self.queue_limit {
            config = config.with_max_queue(limit);
        }
        config
    }

    fn launcher(&self) -> Result<ProcessLauncher> {
        let worker_bin = match &self.worker_bin {
            Some(path) => path.clone(),
            None => default_worker_bin()?,
        };
        Ok(ProcessLauncher::new(worker_bin)
            .with_args(["--engine", self.engine.as_arg()])
            .with_args(["--lang", self.lang.as_str()]))
    }
}

/// `scribe-worker` installed alongside this executable
fn default_worker_bin() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Failed to locate the scribe executable")?;
    let dir = exe
        .parent()
        .context("scribe executable has no parent directory")?;
    Ok(dir.join(WORKER_BIN_NAME))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let telemetry = TelemetryConfig::from_env("scribe").with_default_filter("warn");
    init_telemetry(telemetry);

    let output_format = output::OutputFormat::from_str(&cli.output);
    let config = cli.pool_config();
    let launcher = cli.launcher()?;
    info!(
        workers = config.pool_size,
        engine = ?cli.engine,
        worker_bin = %launcher.program().display(),
        "Starting worker pool"
    );

    let Cli {
        lang,
        quiet,
        command,
        ..
    } = cli;
    let pool = WorkerPool::new(config, launcher);
    let lifecycle = Lifecycle::new(pool.clone());

    let work = async {
        lifecycle
            .start()
            .await
            .context("Failed to start worker pool")?;

        match command {
            Commands::Ocr { files, language } => {
                let service = OcrService::new(pool.clone(), lang);
                commands::ocr::run(&service, output_format, quiet, files, language).await
            }
            Commands::Check => commands::check::run(&pool, output_format).await,
        }
    };

    match lifecycle.run_until_signal(work).await {
        Some(result) => result,
        None => anyhow::bail!("Interrupted"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::parse_from([
            "scribe",
            "--workers",
            "3",
            "--timeout-ms",
            "1500",
            "--queue-limit",
            "8",
            "check",
        ]);
        let config = cli.pool_config();
        assert_eq!(config.pool_size, 3);
        assert_eq!(config.task_timeout, Duration::from_millis(1500));
        assert_eq!(config.max_queue, Some(8));
    }

    #[test]
    fn test_launcher_uses_explicit_worker_bin() {
        let cli = Cli::parse_from([
            "scribe",
            "--worker-bin",
            "/opt/scribe/scribe-worker",
            "--engine",
            "sim",
            "ocr",
            "page.png",
        ]);
        let launcher = cli.launcher().unwrap();
        assert_eq!(launcher.program(), &PathBuf::from("/opt/scribe/scribe-worker"));
        assert_eq!(cli.engine, Engine::Sim);
    }

    #[test]
    fn test_ocr_requires_files() {
        assert!(Cli::try_parse_from(["scribe", "ocr"]).is_err());
    }
}
