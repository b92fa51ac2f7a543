// Health check command: start the pool and report its snapshot

use anyhow::{bail, Result};
use scribe_pool::WorkerPool;

use crate::output::{print_field, OutputFormat};

pub async fn run(pool: &WorkerPool, output: OutputFormat) -> Result<()> {
    let snapshot = pool.status().await;

    if output.is_text() {
        let state = if snapshot.is_healthy() {
            "healthy"
        } else {
            "degraded"
        };
        print_field("Status", state);
        print_field("Initialized", &snapshot.initialized.to_string());
        print_field(
            "Units",
            &format!("{}/{}", snapshot.total_units, snapshot.target_units),
        );
        print_field("Idle", &snapshot.idle_units().to_string());
        print_field("Busy", &snapshot.busy_units.to_string());
        print_field("Queued", &snapshot.queued_tasks.to_string());
        print_field("Degraded slots", &snapshot.degraded.to_string());
    } else {
        output.print_value(&snapshot)?;
    }

    if !snapshot.is_healthy() {
        bail!("worker pool is not healthy");
    }
    Ok(())
}
