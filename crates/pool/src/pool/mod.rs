//! Pool coordinator and its public handle

mod coordinator;
mod replacement;
mod snapshot;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, instrument};

use crate::config::WorkerPoolConfig;
use crate::envelope::{JobOutput, TaskPayload};
use crate::error::{InitError, TaskError};
use crate::unit::UnitLauncher;

use coordinator::{Command, Coordinator};

pub use replacement::ReplacementPolicy;
pub use snapshot::PoolSnapshot;

/// Handle to a bounded pool of worker units
///
/// Cheap to clone; every clone talks to the same coordinator. The pool shuts
/// itself down once the last handle is dropped.
///
/// # Example
///
/// ```
/// use scribe_pool::sim::SimEngineFactory;
/// use scribe_pool::{LocalLauncher, TaskPayload, WorkerPool, WorkerPoolConfig};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = WorkerPool::new(
///     WorkerPoolConfig::new(2),
///     LocalLauncher::new(SimEngineFactory::new()),
/// );
/// pool.initialize().await?;
///
/// let output = pool.submit_default(TaskPayload::new("hello")).await?;
/// assert_eq!(output.text, "hello");
///
/// pool.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct WorkerPool {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<PoolSnapshot>,
    config: Arc<WorkerPoolConfig>,
}

impl WorkerPool {
    /// Create a pool and start its coordinator. No units are launched until
    /// [`initialize`](Self::initialize).
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: WorkerPoolConfig, launcher: impl UnitLauncher) -> Self {
        let config = Arc::new(config);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(PoolSnapshot {
            target_units: config.pool_size,
            ..Default::default()
        });

        let coordinator = Coordinator::new(
            Arc::clone(&config),
            Box::new(launcher),
            command_rx,
            snapshot_tx,
        );
        tokio::spawn(coordinator.run());

        Self {
            commands: command_tx,
            snapshot: snapshot_rx,
            config,
        }
    }

    /// Launch every unit and wait until all of them are ready
    ///
    /// Idempotent: once the pool is running further calls return `Ok`
    /// without launching anything, and concurrent calls share one startup.
    /// If any unit fails to start, every unit launched so far is torn down
    /// and the pool can be initialized again.
    #[instrument(skip(self), fields(pool_size = self.config.pool_size))]
    pub async fn initialize(&self) -> Result<(), InitError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Initialize { reply })
            .map_err(|_| InitError::ShutDown)?;
        rx.await.unwrap_or(Err(InitError::ShutDown))
    }

    /// Submit a job with an explicit deadline
    ///
    /// Returns immediately; the job is dispatched to an idle unit or queued.
    /// The returned handle resolves exactly once. A zero deadline is rejected
    /// with [`TaskError::InvalidDeadline`].
    pub fn submit(&self, payload: TaskPayload, deadline: Duration) -> TaskHandle {
        if deadline.is_zero() {
            return TaskHandle::rejected(TaskError::InvalidDeadline);
        }
        let (reply, rx) = oneshot::channel();
        match self.commands.send(Command::Submit {
            payload,
            deadline,
            reply,
        }) {
            Ok(()) => TaskHandle::pending(rx),
            Err(_) => TaskHandle::rejected(TaskError::PoolShuttingDown),
        }
    }

    /// Submit a job with the configured default deadline
    pub fn submit_default(&self, payload: TaskPayload) -> TaskHandle {
        self.submit(payload, self.config.task_timeout)
    }

    /// Stop accepting tasks, fail everything queued or in flight with
    /// [`TaskError::ShutdownAbandoned`], and kill every unit
    ///
    /// Returns once every unit is confirmed dead. Safe to call repeatedly.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).is_err() {
            return;
        }
        let _ = rx.await;
        info!("Worker pool shutdown complete");
    }

    /// Latest published snapshot (never blocks)
    pub fn snapshot(&self) -> PoolSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Snapshot taken by the coordinator after all earlier commands
    pub async fn status(&self) -> PoolSnapshot {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Status { reply }).is_err() {
            return self.snapshot();
        }
        match rx.await {
            Ok(snapshot) => snapshot,
            Err(_) => self.snapshot(),
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("snapshot", &*self.snapshot.borrow())
            .finish()
    }
}

/// Future for one submitted task
#[must_use = "a task handle does nothing unless awaited"]
pub struct TaskHandle {
    state: HandleState,
}

enum HandleState {
    Pending(oneshot::Receiver<Result<JobOutput, TaskError>>),
    Rejected(Option<TaskError>),
}

impl TaskHandle {
    fn pending(rx: oneshot::Receiver<Result<JobOutput, TaskError>>) -> Self {
        Self {
            state: HandleState::Pending(rx),
        }
    }

    fn rejected(err: TaskError) -> Self {
        Self {
            state: HandleState::Rejected(Some(err)),
        }
    }
}

impl Future for TaskHandle {
    type Output = Result<JobOutput, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            HandleState::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|result| result.unwrap_or(Err(TaskError::PoolShuttingDown))),
            HandleState::Rejected(err) => {
                Poll::Ready(Err(err.take().unwrap_or(TaskError::PoolShuttingDown)))
            }
        }
    }
}
