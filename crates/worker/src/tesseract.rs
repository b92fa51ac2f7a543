//! OCR engine backed by the `tesseract` command-line program
//!
//! Each job pipes the image into `tesseract stdin stdout ... tsv` and builds
//! the text, mean word confidence and word list from the TSV rows.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use scribe_pool::{EngineFactory, JobEngine, JobOutput, TaskPayload};

/// Page segmentation: automatic with orientation and script detection
pub const DEFAULT_PSM: u8 = 1;

/// LSTM engine only
const OEM_LSTM_ONLY: &str = "1";

#[derive(Debug, Error)]
pub enum TesseractError {
    #[error("failed to run {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tesseract exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("invalid language code '{0}'")]
    InvalidLanguage(String),

    #[error("language data not installed: {0}")]
    MissingLanguage(String),

    #[error("I/O error talking to tesseract: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-job options carried in the payload
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct OcrJobOptions {
    pub language: Option<String>,
}

/// Loads a [`TesseractEngine`] after checking the binary and language data
#[derive(Debug, Clone)]
pub struct TesseractFactory {
    binary: PathBuf,
    language: String,
    psm: u8,
}

impl TesseractFactory {
    pub fn new(binary: impl Into<PathBuf>, language: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            language: language.into(),
            psm: DEFAULT_PSM,
        }
    }

    pub fn with_psm(mut self, psm: u8) -> Self {
        self.psm = psm;
        self
    }

    async fn run_tool(&self, args: &[&str]) -> Result<String, TesseractError> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| TesseractError::Spawn {
                binary: self.binary.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(TesseractError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        // Older releases print to stderr
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }

    async fn load(&self) -> Result<TesseractEngine, TesseractError> {
        validate_language(&self.language)?;

        let version_output = self.run_tool(&["--version"]).await?;
        let version = version_output
            .lines()
            .next()
            .unwrap_or("tesseract")
            .trim()
            .to_string();

        let installed = self.run_tool(&["--list-langs"]).await?;
        let installed: Vec<&str> = installed
            .lines()
            .skip_while(|line| !line.starts_with("List of available languages"))
            .skip(1)
            .map(str::trim)
            .collect();
        for lang in self.language.split('+') {
            if !installed.contains(&lang) {
                return Err(TesseractError::MissingLanguage(lang.to_string()));
            }
        }

        info!(version = %version, language = %self.language, psm = self.psm, "Tesseract engine loaded");
        Ok(TesseractEngine {
            binary: self.binary.clone(),
            language: self.language.clone(),
            psm: self.psm,
            version,
        })
    }
}

#[async_trait]
impl EngineFactory for TesseractFactory {
    type Engine = TesseractEngine;

    async fn init(&self) -> Result<TesseractEngine, String> {
        self.load().await.map_err(|e| e.to_string())
    }
}

pub struct TesseractEngine {
    binary: PathBuf,
    language: String,
    psm: u8,
    version: String,
}

impl TesseractEngine {
    async fn recognize(&self, image: Vec<u8>, language: &str) -> Result<TsvPage, TesseractError> {
        validate_language(language)?;

        let psm = self.psm.to_string();
        let mut child = Command::new(&self.binary)
            .args(["stdin", "stdout", "-l", language, "--oem", OEM_LSTM_ONLY, "--psm"])
            .arg(&psm)
            .args(["-c", "preserve_interword_spaces=1", "tsv"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TesseractError::Spawn {
                binary: self.binary.display().to_string(),
                source,
            })?;

        // Feed stdin concurrently so a chatty child cannot deadlock us
        let feeder = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                let result = stdin.write_all(&image).await;
                drop(stdin);
                result
            })
        });

        let output = child.wait_with_output().await?;
        if let Some(feeder) = feeder {
            match feeder.await {
                Ok(Err(e)) => warn!(error = %e, "Failed writing image to tesseract"),
                Err(e) => warn!(error = %e, "Image writer task failed"),
                Ok(Ok(())) => {}
            }
        }

        if !output.status.success() {
            return Err(TesseractError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(parse_tsv(&String::from_utf8_lossy(&output.stdout)))
    }
}

#[async_trait]
impl JobEngine for TesseractEngine {
    async fn run(&mut self, payload: TaskPayload) -> Result<JobOutput, String> {
        let options: OcrJobOptions = payload
            .options_as()
            .map_err(|e| format!("invalid OCR options: {}", e))?;
        let language = options.language.unwrap_or_else(|| self.language.clone());

        let page = self
            .recognize(payload.input, &language)
            .await
            .map_err(|e| e.to_string())?;
        debug!(words = page.words.len(), confidence = page.confidence, "Recognized page");

        Ok(JobOutput::new(page.text.clone()).with_metadata(json!({
            "engine": "tesseract",
            "version": self.version,
            "language": language,
            "confidence": page.confidence,
            "words": page.words,
        })))
    }
}

/// Language codes look like `eng` or `eng+deu`
fn validate_language(language: &str) -> Result<(), TesseractError> {
    let valid = !language.is_empty()
        && language.split('+').all(|part| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        });
    if valid {
        Ok(())
    } else {
        Err(TesseractError::InvalidLanguage(language.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Word {
    pub text: String,
    pub confidence: f64,
    pub bbox: BoundingBox,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TsvPage {
    pub text: String,
    /// Mean word confidence, 0-100
    pub confidence: f64,
    pub words: Vec<Word>,
}

const TSV_COLUMNS: usize = 12;
const WORD_LEVEL: &str = "5";

/// Build a page from tesseract TSV output
///
/// Words on the same line are joined with spaces, lines with newlines, and
/// paragraphs are separated by a blank line.
pub fn parse_tsv(tsv: &str) -> TsvPage {
    let mut page = TsvPage::default();
    let mut last_line: Option<(&str, &str, &str, &str)> = None;
    let mut total_confidence = 0.0;

    for row in tsv.lines().skip(1) {
        let fields: Vec<&str> = row.split('\t').collect();
        if fields.len() < TSV_COLUMNS || fields[0] != WORD_LEVEL {
            continue;
        }
        let text = fields[11].trim();
        let confidence: f64 = fields[10].trim().parse().unwrap_or(-1.0);
        if text.is_empty() || confidence < 0.0 {
            continue;
        }

        let key = (fields[1], fields[2], fields[3], fields[4]);
        match last_line {
            Some(prev) if prev == key => page.text.push(' '),
            Some(prev) if (prev.0, prev.1, prev.2) == (key.0, key.1, key.2) => page.text.push('\n'),
            Some(_) => page.text.push_str("\n\n"),
            None => {}
        }
        last_line = Some(key);
        page.text.push_str(text);

        let num = |i: usize| fields[i].trim().parse::<u32>().unwrap_or(0);
        let (left, top, width, height) = (num(6), num(7), num(8), num(9));
        page.words.push(Word {
            text: text.to_string(),
            confidence,
            bbox: BoundingBox {
                x0: left,
                y0: top,
                x1: left.saturating_add(width),
                y1: top.saturating_add(height),
            },
        });
        total_confidence += confidence;
    }

    if !page.words.is_empty() {
        page.confidence = total_confidence / page.words.len() as f64;
    }
    page
}
