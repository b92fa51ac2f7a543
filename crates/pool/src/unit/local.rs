//! Worker units running as isolated tokio tasks

use std::any::Any;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::{
    EventSender, LaunchError, TerminationReason, UnitEvent, UnitHandle, UnitId, UnitLauncher,
    UnitMessage,
};
use crate::engine::{EngineFactory, JobEngine};
use crate::envelope::TaskEnvelope;

/// Launches each unit as a tokio task owning its own engine
///
/// Suited to engines that await regularly. An engine that blocks without
/// yielding cannot be interrupted; use [`ProcessLauncher`](super::ProcessLauncher)
/// for those.
pub struct LocalLauncher<F> {
    factory: Arc<F>,
}

impl<F: EngineFactory> LocalLauncher<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory: Arc::new(factory),
        }
    }
}

impl<F: EngineFactory> UnitLauncher for LocalLauncher<F> {
    fn launch(&self, id: UnitId, events: EventSender) -> Result<Box<dyn UnitHandle>, LaunchError> {
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let body = tokio::spawn(run_unit(
            id,
            Arc::clone(&self.factory),
            task_rx,
            events.clone(),
        ));
        let abort = body.abort_handle();

        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let reason = match body.await {
                Ok(()) => TerminationReason::Exited(0),
                Err(err) if err.is_cancelled() => TerminationReason::Killed,
                Err(err) => TerminationReason::Panicked(panic_message(err.into_panic())),
            };
            if !reason.is_deliberate() {
                warn!(unit = %id, reason = %reason, "Local worker unit stopped");
                let _ = events.send(UnitMessage {
                    unit: id,
                    event: UnitEvent::Exited(reason.clone()),
                });
            }
            let _ = done_tx.send(reason);
        });

        Ok(Box::new(LocalUnit {
            id,
            tasks: task_tx,
            abort,
            done: Some(done_rx),
        }))
    }
}

async fn run_unit<F: EngineFactory>(
    id: UnitId,
    factory: Arc<F>,
    mut tasks: mpsc::UnboundedReceiver<TaskEnvelope>,
    events: EventSender,
) {
    let mut engine = match factory.init().await {
        Ok(engine) => engine,
        Err(message) => {
            let _ = events.send(UnitMessage {
                unit: id,
                event: UnitEvent::InitFailed(message),
            });
            return;
        }
    };
    if events
        .send(UnitMessage {
            unit: id,
            event: UnitEvent::Ready,
        })
        .is_err()
    {
        return;
    }

    while let Some(task) = tasks.recv().await {
        debug!(unit = %id, task = %task.id, "Running task");
        let outcome = engine.run(task.payload).await;
        let event = UnitEvent::Finished {
            task: task.id,
            outcome,
        };
        if events.send(UnitMessage { unit: id, event }).is_err() {
            break;
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct LocalUnit {
    id: UnitId,
    tasks: mpsc::UnboundedSender<TaskEnvelope>,
    abort: AbortHandle,
    done: Option<oneshot::Receiver<TerminationReason>>,
}

impl UnitHandle for LocalUnit {
    fn id(&self) -> UnitId {
        self.id
    }

    fn dispatch(&mut self, task: TaskEnvelope) -> Result<(), TaskEnvelope> {
        self.tasks.send(task).map_err(|err| err.0)
    }

    fn terminate(mut self: Box<Self>) -> BoxFuture<'static, TerminationReason> {
        self.abort.abort();
        let done = self.done.take();
        Box::pin(async move {
            match done {
                Some(done) => done.await.unwrap_or(TerminationReason::Killed),
                None => TerminationReason::Killed,
            }
        })
    }
}

impl Drop for LocalUnit {
    fn drop(&mut self) {
        self.abort.abort();
    }
}
