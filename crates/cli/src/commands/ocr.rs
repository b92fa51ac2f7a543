// OCR command: run one or more image files through the pool

use std::path::PathBuf;

use anyhow::{bail, Result};
use futures::future::join_all;
use serde::Serialize;
use tracing::debug;

use crate::output::{print_field, print_table_header, print_table_row, OutputFormat};
use crate::service::{OcrOptions, OcrResult, OcrService};

/// Result for a single input file
#[derive(Debug, Serialize)]
pub struct FileReport {
    pub file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<OcrResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FileReport {
    fn succeeded(&self) -> bool {
        self.result.is_some()
    }
}

pub async fn run(
    service: &OcrService,
    output: OutputFormat,
    quiet: bool,
    files: Vec<PathBuf>,
    language: Option<String>,
) -> Result<()> {
    let jobs = files.into_iter().map(|path| {
        let options = OcrOptions {
            language: language.clone(),
        };
        async move { process_file(service, path, options).await }
    });
    let reports = join_all(jobs).await;
    let failed = reports.iter().filter(|r| !r.succeeded()).count();

    if output.is_text() {
        print_text(&reports, quiet);
    } else {
        output.print_value(&serde_json::json!({ "data": reports, "total": reports.len() }))?;
    }

    if failed > 0 {
        bail!("{} of {} files failed", failed, reports.len());
    }
    Ok(())
}

async fn process_file(service: &OcrService, path: PathBuf, options: OcrOptions) -> FileReport {
    let file = path.display().to_string();
    let image = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return FileReport {
                file,
                result: None,
                error: Some(format!("failed to read file: {}", e)),
            }
        }
    };
    debug!(file = %file, bytes = image.len(), "Submitting image");

    match service.extract_text(image, options).await {
        Ok(result) => FileReport {
            file,
            result: Some(result),
            error: None,
        },
        Err(e) => FileReport {
            file,
            result: None,
            error: Some(e.to_string()),
        },
    }
}

fn print_text(reports: &[FileReport], quiet: bool) {
    // A single file prints its text directly
    if let [report] = reports {
        match (&report.result, &report.error) {
            (Some(result), _) => {
                if !quiet {
                    print_field("File", &report.file);
                    print_field("Language", &result.language);
                    print_field("Confidence", &format!("{:.1}", result.confidence));
                    print_field("Words", &result.word_count.to_string());
                    print_field("Time", &format!("{}ms", result.processing_time_ms));
                    println!();
                }
                println!("{}", result.text);
            }
            (None, error) => eprintln!("{}: {}", report.file, error.as_deref().unwrap_or("failed")),
        }
        return;
    }

    print_table_header(&[("FILE", 32), ("STATUS", 8), ("CONF", 6), ("WORDS", 6), ("TIME", 8)]);
    for report in reports {
        match &report.result {
            Some(result) => print_table_row(&[
                (&report.file, 32),
                ("ok", 8),
                (&format!("{:.1}", result.confidence), 6),
                (&result.word_count.to_string(), 6),
                (&format!("{}ms", result.processing_time_ms), 8),
            ]),
            None => print_table_row(&[(&report.file, 32), ("failed", 8), ("-", 6), ("-", 6), ("-", 8)]),
        }
    }

    if quiet {
        return;
    }
    for report in reports {
        println!();
        println!("== {} ==", report.file);
        match (&report.result, &report.error) {
            (Some(result), _) => println!("{}", result.text),
            (None, error) => println!("error: {}", error.as_deref().unwrap_or("failed")),
        }
    }
}
