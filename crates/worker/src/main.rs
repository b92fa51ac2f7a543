// Scribe worker unit
//
// Design Decision: One OS process per unit so the pool can SIGKILL a job stuck in native code.
// Design Decision: stdout carries the line protocol only; all logging goes to stderr.
// Design Decision: Single-threaded runtime; a unit never runs more than one job.

mod tesseract;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use scribe_pool::sim::SimEngineFactory;
use scribe_pool::telemetry::{init_telemetry, TelemetryConfig};
use scribe_pool::unit::UNIT_ID_ENV;
use scribe_pool::worker_main::{run_stdio, ServeExit};

use crate::tesseract::{TesseractFactory, DEFAULT_PSM};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EngineKind {
    /// OCR through the tesseract program
    Tesseract,
    /// Simulation engine for tests and smoke runs
    Sim,
}

#[derive(Parser, Debug)]
#[command(name = "scribe-worker")]
#[command(about = "Scribe worker unit - serves OCR jobs over stdin/stdout")]
#[command(version)]
struct Args {
    /// Job engine to load
    #[arg(long, env = "SCRIBE_ENGINE", value_enum, default_value_t = EngineKind::Tesseract)]
    engine: EngineKind,

    /// Default OCR language(s), e.g. "eng" or "eng+deu"
    #[arg(long, env = "OCR_LANGUAGES", default_value = "eng")]
    lang: String,

    /// Tesseract page segmentation mode
    #[arg(long, default_value_t = DEFAULT_PSM)]
    psm: u8,

    /// Path to the tesseract program
    #[arg(long, env = "TESSERACT_BIN", default_value = "tesseract")]
    tesseract_bin: PathBuf,

    /// Sim engine: delay engine load by this many milliseconds
    #[arg(long, default_value_t = 0)]
    sim_init_delay_ms: u64,

    /// Sim engine: add this many milliseconds to every job
    #[arg(long, default_value_t = 0)]
    sim_job_delay_ms: u64,

    /// Sim engine: fail engine load with this message
    #[arg(long)]
    sim_init_failure: Option<String>,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let telemetry = TelemetryConfig::from_env("scribe-worker");
    init_telemetry(telemetry);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    let exit = runtime.block_on(run(args))?;

    std::process::exit(exit.exit_code());
}

async fn run(args: Args) -> Result<ServeExit> {
    let unit = std::env::var(UNIT_ID_ENV).unwrap_or_else(|_| "standalone".to_string());
    tracing::info!(unit = %unit, engine = ?args.engine, "Worker unit starting");

    let exit = match args.engine {
        EngineKind::Tesseract => {
            let factory = TesseractFactory::new(args.tesseract_bin, args.lang).with_psm(args.psm);
            run_stdio(factory).await
        }
        EngineKind::Sim => {
            let mut factory = SimEngineFactory::new()
                .with_init_delay(Duration::from_millis(args.sim_init_delay_ms))
                .with_job_delay(Duration::from_millis(args.sim_job_delay_ms));
            if let Some(message) = args.sim_init_failure {
                factory = factory.with_init_failure(message);
            }
            run_stdio(factory).await
        }
    }
    .context("Worker protocol failure")?;

    tracing::info!(unit = %unit, exit = ?exit, "Worker unit stopping");
    Ok(exit)
}
