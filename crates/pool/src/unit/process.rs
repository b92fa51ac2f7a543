//! Worker units backed by OS processes

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, info, warn};

use super::signals::classify_exit;
use super::{
    EventSender, LaunchError, TerminationReason, UnitEvent, UnitHandle, UnitId, UnitLauncher,
    UnitMessage,
};
use crate::envelope::TaskEnvelope;
use crate::protocol::{UnitRequest, UnitResponse, MAX_LINE_LENGTH};

/// Environment variable carrying the unit id into the worker process
pub const UNIT_ID_ENV: &str = "SCRIBE_UNIT_ID";

/// How long a unit that closed stdout gets to actually exit
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// Launches each unit as a child process running the worker binary
///
/// stdin/stdout carry the line protocol, stderr is inherited so the
/// worker's logs end up next to the pool's. Each worker leads its own
/// process group; killing a unit kills the whole group, including any
/// engine subprocess the worker started.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

impl UnitLauncher for ProcessLauncher {
    fn launch(&self, id: UnitId, events: EventSender) -> Result<Box<dyn UnitHandle>, LaunchError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .env(UNIT_ID_ENV, id.as_u64().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LaunchError::Other("child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LaunchError::Other("child stdout not captured".into()))?;

        info!(unit = %id, pid = ?child.id(), program = %self.program.display(), "Spawned worker process");

        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let supervisor = tokio::spawn(supervise(
            id, child, stdin, stdout, task_rx, kill_rx, events,
        ));

        Ok(Box::new(ProcessUnit {
            id,
            tasks: task_tx,
            kill: Some(kill_tx),
            supervisor,
        }))
    }
}

struct ProcessUnit {
    id: UnitId,
    tasks: mpsc::UnboundedSender<TaskEnvelope>,
    kill: Option<oneshot::Sender<()>>,
    supervisor: JoinHandle<TerminationReason>,
}

impl UnitHandle for ProcessUnit {
    fn id(&self) -> UnitId {
        self.id
    }

    fn dispatch(&mut self, task: TaskEnvelope) -> Result<(), TaskEnvelope> {
        self.tasks.send(task).map_err(|err| err.0)
    }

    fn terminate(mut self: Box<Self>) -> BoxFuture<'static, TerminationReason> {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        let id = self.id;
        let supervisor = self.supervisor;
        Box::pin(async move {
            supervisor.await.unwrap_or_else(|err| {
                warn!(unit = %id, error = %err, "Worker supervisor task failed");
                TerminationReason::Unknown
            })
        })
    }
}

/// Owns the child process: forwards tasks to stdin, turns stdout lines into
/// unit events, and reaps the process.
///
/// The kill channel fires on an explicit terminate and also when the handle
/// is dropped, so a unit can never outlive its handle.
async fn supervise(
    id: UnitId,
    mut child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    mut tasks: mpsc::UnboundedReceiver<TaskEnvelope>,
    mut kill: oneshot::Receiver<()>,
    events: EventSender,
) -> TerminationReason {
    let mut reader = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let mut writer = FramedWrite::new(stdin, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let mut tasks_open = true;

    let reason = loop {
        tokio::select! {
            _ = &mut kill => {
                return hard_kill(id, &mut child).await;
            }

            line = reader.next() => match line {
                Some(Ok(line)) => match UnitResponse::decode(&line) {
                    Ok(response) => {
                        let event = into_event(response);
                        if events.send(UnitMessage { unit: id, event }).is_err() {
                            return hard_kill(id, &mut child).await;
                        }
                    }
                    Err(err) => {
                        warn!(unit = %id, error = %err, "Worker wrote an unparsable line");
                        hard_kill(id, &mut child).await;
                        break TerminationReason::Protocol(err.to_string());
                    }
                },
                Some(Err(err)) => {
                    warn!(unit = %id, error = %err, "Failed reading from worker");
                    hard_kill(id, &mut child).await;
                    break TerminationReason::Protocol(err.to_string());
                }
                None => break wait_for_exit(id, &mut child).await,
            },

            task = tasks.recv(), if tasks_open => match task {
                Some(task) => {
                    let request = UnitRequest::Task { id: task.id, payload: task.payload };
                    let line = match request.encode() {
                        Ok(line) => line,
                        Err(err) => {
                            let event = UnitEvent::Finished {
                                task: task.id,
                                outcome: Err(format!("failed to encode task: {}", err)),
                            };
                            let _ = events.send(UnitMessage { unit: id, event });
                            continue;
                        }
                    };
                    debug!(unit = %id, task = %task.id, "Writing task to worker");
                    tokio::select! {
                        _ = &mut kill => {
                            return hard_kill(id, &mut child).await;
                        }
                        result = writer.send(line) => {
                            // A dead worker shows up as EOF on stdout
                            if let Err(err) = result {
                                debug!(unit = %id, error = %err, "Failed writing to worker");
                            }
                        }
                    }
                }
                None => tasks_open = false,
            },
        }
    };

    warn!(unit = %id, reason = %reason, "Worker process exited unexpectedly");
    let _ = events.send(UnitMessage {
        unit: id,
        event: UnitEvent::Exited(reason.clone()),
    });
    reason
}

fn into_event(response: UnitResponse) -> UnitEvent {
    match response {
        UnitResponse::Ready => UnitEvent::Ready,
        UnitResponse::InitError { message } => UnitEvent::InitFailed(message),
        UnitResponse::Result { id, output } => UnitEvent::Finished {
            task: id,
            outcome: Ok(output),
        },
        UnitResponse::Error { id, message } => UnitEvent::Finished {
            task: id,
            outcome: Err(message),
        },
    }
}

async fn hard_kill(id: UnitId, child: &mut Child) -> TerminationReason {
    // Group first, while the leader is unreaped and its pgid cannot be reused
    if let Some(pid) = child.id() {
        kill_group(id, pid);
    }
    // Fails only if the child was already reaped
    if let Err(err) = child.start_kill() {
        debug!(unit = %id, error = %err, "Kill on exited worker");
    }
    match child.wait().await {
        Ok(status) => debug!(unit = %id, ?status, "Worker process reaped"),
        Err(err) => warn!(unit = %id, error = %err, "Failed to reap worker process"),
    }
    TerminationReason::Killed
}

async fn wait_for_exit(id: UnitId, child: &mut Child) -> TerminationReason {
    let pid = child.id();
    match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
        Ok(Ok(status)) => {
            // An engine subprocess can outlive a crashed worker
            if let Some(pid) = pid {
                kill_group(id, pid);
            }
            classify_exit(status)
        }
        Ok(Err(err)) => {
            warn!(unit = %id, error = %err, "Failed to wait for worker process");
            TerminationReason::Unknown
        }
        Err(_) => {
            hard_kill(id, child).await;
            TerminationReason::Protocol("closed stdout without exiting".to_string())
        }
    }
}

/// SIGKILL every process in the unit's group
fn kill_group(id: UnitId, pgid: u32) {
    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => debug!(unit = %id, pgid, "Killed worker process group"),
        Err(Errno::ESRCH) => {}
        Err(err) => warn!(unit = %id, pgid, error = %err, "Failed to kill worker process group"),
    }
}
