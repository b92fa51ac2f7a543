//! Unit-side serve loop
//!
//! Runs inside a worker process: load the engine once, announce readiness,
//! then answer tasks one at a time until told to exit or the pool closes
//! stdin.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, error, info, warn};

use crate::engine::{EngineFactory, JobEngine};
use crate::envelope::TaskId;
use crate::protocol::{ProtocolError, UnitRequest, UnitResponse, MAX_LINE_LENGTH};

/// Why [`serve`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeExit {
    /// The engine failed to load; `init_error` was sent
    InitFailed,
    /// An `exit` request was received
    Requested,
    /// The pool closed our input
    Eof,
}

impl ServeExit {
    /// Process exit code for this outcome
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InitFailed => 1,
            Self::Requested | Self::Eof => 0,
        }
    }
}

/// Serve the unit protocol over `reader`/`writer`
pub async fn serve<F, R, W>(factory: &F, reader: R, writer: W) -> Result<ServeExit, ProtocolError>
where
    F: EngineFactory,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let mut out = FramedWrite::new(writer, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    let mut engine = match factory.init().await {
        Ok(engine) => engine,
        Err(message) => {
            error!(error = %message, "Job engine failed to load");
            out.send(UnitResponse::InitError { message }.encode()?).await?;
            return Ok(ServeExit::InitFailed);
        }
    };
    out.send(UnitResponse::Ready.encode()?).await?;
    info!("Worker unit ready");

    while let Some(line) = lines.next().await {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let request = match UnitRequest::decode(&line) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "Invalid request");
                let response = UnitResponse::Error {
                    id: TaskId(0),
                    message: format!("invalid request: {}", err),
                };
                out.send(response.encode()?).await?;
                continue;
            }
        };

        match request {
            UnitRequest::Exit => {
                debug!("Exit requested");
                return Ok(ServeExit::Requested);
            }
            UnitRequest::Task { id, payload } => {
                debug!(task = %id, bytes = payload.input.len(), "Running task");
                let outcome = engine.run(payload).await;
                if let Err(message) = &outcome {
                    warn!(task = %id, error = %message, "Task failed");
                }
                out.send(UnitResponse::from_outcome(id, outcome).encode()?)
                    .await?;
            }
        }
    }

    debug!("Input closed");
    Ok(ServeExit::Eof)
}

/// Serve over the process's stdin/stdout
pub async fn run_stdio<F: EngineFactory>(factory: F) -> Result<ServeExit, ProtocolError> {
    serve(&factory, tokio::io::stdin(), tokio::io::stdout()).await
}
