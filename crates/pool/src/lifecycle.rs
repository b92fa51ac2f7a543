//! Process-level lifecycle around a [`WorkerPool`]
//!
//! Initialize at startup, shut down on SIGINT/SIGTERM, and never shut down
//! twice no matter how many signals or callers race.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::info;

use crate::error::InitError;
use crate::pool::WorkerPool;

#[derive(Clone, Debug)]
pub struct Lifecycle {
    pool: WorkerPool,
    shutdown: Arc<OnceCell<()>>,
}

impl Lifecycle {
    pub fn new(pool: WorkerPool) -> Self {
        Self {
            pool,
            shutdown: Arc::new(OnceCell::new()),
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Initialize the pool
    pub async fn start(&self) -> Result<(), InitError> {
        self.pool.initialize().await?;
        info!(units = self.pool.config().pool_size, "Worker pool started");
        Ok(())
    }

    /// Shut the pool down exactly once
    ///
    /// Concurrent callers all wait for the same shutdown to finish. Returns
    /// `true` only for the call that actually performed it.
    pub async fn shutdown(&self) -> bool {
        let performed = AtomicBool::new(false);
        self.shutdown
            .get_or_init(|| async {
                performed.store(true, Ordering::SeqCst);
                self.pool.shutdown().await;
            })
            .await;
        performed.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.initialized()
    }

    /// Wait for SIGINT (ctrl-c) or SIGTERM
    pub async fn wait_for_signal() {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "Failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = terminate => info!("Received SIGTERM"),
        }
    }

    /// Run `work` until it finishes or a termination signal arrives, then
    /// shut the pool down
    pub async fn run_until_signal<F, T>(&self, work: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        let result = tokio::select! {
            output = work => Some(output),
            _ = Self::wait_for_signal() => None,
        };
        self.shutdown().await;
        result
    }
}
