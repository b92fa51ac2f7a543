//! Pool tests against real `scribe-worker` processes running the sim engine
//!
//! Run with: cargo test -p scribe-worker --test process_pool_test

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use scribe_pool::sim::SimOptions;
use scribe_pool::{
    InitError, ProcessLauncher, TaskError, TaskPayload, TerminationReason, WorkerPool,
    WorkerPoolConfig,
};

const WORKER_BIN: &str = env!("CARGO_BIN_EXE_scribe-worker");

fn sim_launcher() -> ProcessLauncher {
    ProcessLauncher::new(WORKER_BIN)
        .with_args(["--engine", "sim"])
        .with_env("RUST_LOG", "warn")
}

fn config(size: usize) -> WorkerPoolConfig {
    WorkerPoolConfig::new(size)
        .with_task_timeout(Duration::from_secs(10))
        .with_startup_timeout(Duration::from_secs(30))
}

#[test_log::test(tokio::test)]
async fn test_process_units_run_jobs() {
    let pool = WorkerPool::new(config(2), sim_launcher());
    pool.initialize().await.unwrap();
    assert_eq!(pool.snapshot().total_units, 2);

    let (a, b, c) = tokio::join!(
        pool.submit_default(TaskPayload::new("first page")),
        pool.submit_default(TaskPayload::new("second page")),
        pool.submit_default(SimOptions::fail("unreadable").payload("x")),
    );
    assert_eq!(a.unwrap().text, "first page");
    assert_eq!(b.unwrap().text, "second page");
    assert_eq!(c, Err(TaskError::EngineFailure("unreadable".into())));

    pool.shutdown().await;
    assert_eq!(pool.snapshot().total_units, 0);
}

#[tokio::test]
async fn test_non_yielding_job_is_hard_killed() {
    let pool = WorkerPool::new(config(1), sim_launcher());
    pool.initialize().await.unwrap();

    let start = Instant::now();
    let result = pool
        .submit(SimOptions::spin(60_000).payload("stuck"), Duration::from_millis(200))
        .await;
    assert_eq!(result, Err(TaskError::TimedOut(Duration::from_millis(200))));
    assert!(start.elapsed() < Duration::from_secs(5));

    // The replacement process takes over
    let output = pool.submit_default(TaskPayload::new("after")).await.unwrap();
    assert_eq!(output.text, "after");
    assert_eq!(pool.status().await.units_replaced, 1);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_process_crash_detected() {
    let pool = WorkerPool::new(config(1), sim_launcher());
    pool.initialize().await.unwrap();

    let err = pool
        .submit_default(SimOptions::crash().payload("boom"))
        .await
        .unwrap_err();
    match err {
        TaskError::UnitCrashed { reason, .. } => {
            assert_ne!(reason, TerminationReason::Killed);
            assert!(!reason.is_success());
        }
        other => panic!("unexpected error: {other}"),
    }

    let output = pool.submit_default(TaskPayload::new("recovered")).await.unwrap();
    assert_eq!(output.text, "recovered");

    pool.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_kills_busy_process() {
    let pool = WorkerPool::new(config(1), sim_launcher());
    pool.initialize().await.unwrap();

    let stuck = pool.submit(SimOptions::spin(60_000).payload("stuck"), Duration::from_secs(120));
    let queued = pool.submit_default(TaskPayload::new("queued"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let start = Instant::now();
    pool.shutdown().await;
    assert!(start.elapsed() < Duration::from_secs(5));

    assert_eq!(stuck.await, Err(TaskError::ShutdownAbandoned));
    assert_eq!(queued.await, Err(TaskError::ShutdownAbandoned));
}

#[tokio::test]
async fn test_engine_load_failure_in_process() {
    let launcher = sim_launcher().with_args(["--sim-init-failure", "no traineddata"]);
    let pool = WorkerPool::new(config(2), launcher);

    match pool.initialize().await {
        Err(InitError::Engine { message, .. }) => assert_eq!(message, "no traineddata"),
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(!pool.snapshot().initialized);
}

#[tokio::test]
async fn test_missing_worker_binary() {
    let pool = WorkerPool::new(config(1), ProcessLauncher::new("/nonexistent/scribe-worker"));

    let err = pool.initialize().await.unwrap_err();
    assert!(matches!(err, InitError::Launch { .. }));
}

// ============================================
// Process cleanup
// ============================================

/// Stand-in `tesseract` that answers the load checks, then records its pid
/// and sleeps in place of recognizing anything
const STUCK_TESSERACT: &str = r#"#!/bin/sh
case "$1" in
  --version) echo "tesseract 5.3.0"; exit 0 ;;
  --list-langs) echo "List of available languages in \"/tmp\" (1):"; echo "eng"; exit 0 ;;
esac
echo $$ > "$STUCK_TESSERACT_PID_FILE"
exec sleep 600
"#;

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("scribe-{}-{}", name, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn write_script(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("tesseract");
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Running means present in /proc and not a zombie
#[cfg(target_os = "linux")]
fn is_running(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit_once(')')
            .map(|(_, rest)| !rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_timeout_kills_engine_subprocess() {
    let dir = scratch_dir("stuck-tesseract");
    let script = write_script(&dir, STUCK_TESSERACT);
    let pid_file = dir.join("engine.pid");

    let launcher = ProcessLauncher::new(WORKER_BIN)
        .with_arg("--engine")
        .with_arg("tesseract")
        .with_arg("--tesseract-bin")
        .with_arg(script.as_os_str())
        .with_env("STUCK_TESSERACT_PID_FILE", pid_file.as_os_str())
        .with_env("RUST_LOG", "warn");
    let pool = WorkerPool::new(config(1), launcher);
    pool.initialize().await.unwrap();

    let image = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    let result = pool
        .submit(TaskPayload::new(image), Duration::from_millis(500))
        .await;
    assert_eq!(result, Err(TaskError::TimedOut(Duration::from_millis(500))));

    assert!(wait_until(Duration::from_secs(5), || pid_file.exists()).await);
    let engine_pid: u32 = std::fs::read_to_string(&pid_file)
        .expect("engine subprocess should have started")
        .trim()
        .parse()
        .unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || !is_running(engine_pid)).await,
        "engine subprocess {engine_pid} survived its unit"
    );

    pool.shutdown().await;
    assert!(!is_running(engine_pid));
    std::fs::remove_dir_all(&dir).ok();
}

/// Find the worker process launched for `unit` carrying `marker` in its env
#[cfg(target_os = "linux")]
fn find_unit_pid(unit: u64, marker: &str) -> Option<u32> {
    let unit_var = format!("SCRIBE_UNIT_ID={}", unit);
    let marker_var = format!("SCRIBE_TEST_MARKER={}", marker);
    std::fs::read_dir("/proc")
        .ok()?
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse::<u32>().ok())
        .find(|pid| {
            let Ok(environ) = std::fs::read(format!("/proc/{}/environ", pid)) else {
                return false;
            };
            let vars: Vec<&[u8]> = environ.split(|b| *b == 0).collect();
            vars.contains(&unit_var.as_bytes()) && vars.contains(&marker_var.as_bytes())
        })
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_idle_unit_killed_externally_is_replaced() {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let marker = format!("idle-kill-{}", std::process::id());
    let launcher = sim_launcher().with_env("SCRIBE_TEST_MARKER", marker.as_str());
    let pool = WorkerPool::new(config(2), launcher);
    pool.initialize().await.unwrap();

    let pid = find_unit_pid(1, &marker).expect("unit 1 process");
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = pool.status().await;
        if status.units_replaced == 1 && status.total_units == 2 && status.idle_units() == 2 {
            break;
        }
        assert!(Instant::now() < deadline, "unit was not replaced: {status:?}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let (a, b) = tokio::join!(
        pool.submit_default(TaskPayload::new("x")),
        pool.submit_default(TaskPayload::new("y")),
    );
    assert_eq!(a.unwrap().text, "x");
    assert_eq!(b.unwrap().text, "y");
    assert_eq!(pool.status().await.tasks_failed, 0);

    pool.shutdown().await;
}
