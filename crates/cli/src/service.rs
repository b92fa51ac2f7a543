// OCR service
//
// Validates an image, runs it through the worker pool with the configured
// deadline, and shapes the engine output into an OcrResult.

use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use scribe_pool::{TaskError, TaskPayload, WorkerPool};

/// Largest accepted image (5 MiB)
pub const MAX_FILE_SIZE: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
    Webp,
}

impl ImageFormat {
    /// Detect a supported format from magic bytes
    pub fn detect(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(Self::Jpeg)
        } else if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
            Some(Self::Png)
        } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            Some(Self::Webp)
        } else {
            None
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum OcrError {
    #[error("No image data provided")]
    Empty,

    #[error("File size exceeds maximum limit of 5MB")]
    TooLarge(usize),

    #[error("Invalid file type. Only JPEG, PNG, and WebP are allowed")]
    UnsupportedFormat,

    #[error("Language code must be between 2 and 10 characters")]
    InvalidLanguage(String),

    #[error("OCR processing timeout. The image may be too complex or large.")]
    Timeout,

    #[error("OCR processing failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Default)]
pub struct OcrOptions {
    /// Overrides the service default when set
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OcrResult {
    pub text: String,
    pub confidence: f64,
    pub language: String,
    pub processing_time_ms: u64,
    pub word_count: usize,
}

pub struct OcrService {
    pool: WorkerPool,
    default_language: String,
    timeout: Duration,
}

impl OcrService {
    pub fn new(pool: WorkerPool, default_language: impl Into<String>) -> Self {
        let timeout = pool.config().task_timeout;
        Self {
            pool,
            default_language: default_language.into(),
            timeout,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn extract_text(
        &self,
        image: Vec<u8>,
        options: OcrOptions,
    ) -> Result<OcrResult, OcrError> {
        let start = Instant::now();
        let language = options
            .language
            .unwrap_or_else(|| self.default_language.clone());

        if !(2..=10).contains(&language.len()) {
            return Err(OcrError::InvalidLanguage(language));
        }
        if image.is_empty() {
            return Err(OcrError::Empty);
        }
        if image.len() > MAX_FILE_SIZE {
            return Err(OcrError::TooLarge(image.len()));
        }
        let format = ImageFormat::detect(&image).ok_or(OcrError::UnsupportedFormat)?;
        debug!(?format, bytes = image.len(), language = %language, "Starting OCR processing");

        let payload = TaskPayload::new(image).with_options(json!({ "language": language }));
        let output = match self.pool.submit(payload, self.timeout).await {
            Ok(output) => output,
            Err(err) => {
                warn!(error = %err, "OCR processing failed");
                return Err(match err {
                    TaskError::TimedOut(_) => OcrError::Timeout,
                    other => OcrError::Failed(other.to_string()),
                });
            }
        };

        let confidence = output.metadata["confidence"].as_f64().unwrap_or(0.0);
        let word_count = output.metadata["words"]
            .as_array()
            .map(Vec::len)
            .unwrap_or_else(|| output.text.split_whitespace().count());
        let processing_time_ms = start.elapsed().as_millis() as u64;

        info!(
            text_length = output.text.len(),
            confidence,
            processing_time_ms,
            "OCR processing completed"
        );

        Ok(OcrResult {
            text: output.text.trim().to_string(),
            confidence,
            language,
            processing_time_ms,
            word_count,
        })
    }
}
