//! Integration tests for the worker pool
//!
//! Units run in-process (`LocalLauncher`) with the simulation engine, and the
//! tokio clock is paused so deadlines and delays are exact.
//!
//! Run with: cargo test -p scribe-pool --test pool_test

use std::time::Duration;

use tokio::time::Instant;

use scribe_pool::sim::{SimEngineFactory, SimOptions};
use scribe_pool::{
    ConfigError, InitError, LocalLauncher, ReplacementPolicy, TaskError, TaskPayload, TerminationReason,
    WorkerPool, WorkerPoolConfig,
};

fn local_pool(config: WorkerPoolConfig, factory: &SimEngineFactory) -> WorkerPool {
    WorkerPool::new(config, LocalLauncher::new(factory.clone()))
}

async fn running_pool(size: usize) -> (WorkerPool, SimEngineFactory) {
    let factory = SimEngineFactory::new();
    let pool = local_pool(WorkerPoolConfig::new(size), &factory);
    pool.initialize().await.expect("pool should initialize");
    (pool, factory)
}

const LONG: Duration = Duration::from_secs(60);

// ============================================
// Initialization
// ============================================

#[test_log::test(tokio::test(start_paused = true))]
async fn test_initialize_starts_every_unit() {
    for size in [1, 2, 5] {
        let (pool, factory) = running_pool(size).await;

        let snapshot = pool.snapshot();
        assert!(snapshot.initialized);
        assert_eq!(snapshot.total_units, size);
        assert_eq!(snapshot.busy_units, 0);
        assert_eq!(snapshot.starting_units, 0);
        assert_eq!(snapshot.idle_units(), size);
        assert!(snapshot.is_healthy());
        assert_eq!(factory.init_count(), size);

        pool.shutdown().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_initialize_is_idempotent() {
    let factory = SimEngineFactory::new().with_init_delay(Duration::from_millis(100));
    let pool = local_pool(WorkerPoolConfig::new(2), &factory);

    let (first, second) = tokio::join!(pool.initialize(), pool.initialize());
    assert!(first.is_ok());
    assert!(second.is_ok());
    pool.initialize().await.unwrap();

    assert_eq!(factory.init_count(), 2);
    assert_eq!(pool.status().await.total_units, 2);
}

#[tokio::test(start_paused = true)]
async fn test_submit_before_initialize() {
    let factory = SimEngineFactory::new();
    let pool = local_pool(WorkerPoolConfig::new(1), &factory);

    let result = pool.submit_default(TaskPayload::new("early")).await;
    assert_eq!(result, Err(TaskError::PoolNotInitialized));
    assert_eq!(factory.init_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_engine_init_failure_fails_whole_pool() {
    let factory = SimEngineFactory::new().with_init_failure("missing traineddata");
    let pool = local_pool(WorkerPoolConfig::new(3), &factory);

    let err = pool.initialize().await.unwrap_err();
    match err {
        InitError::Engine { message, .. } => assert_eq!(message, "missing traineddata"),
        other => panic!("unexpected error: {other}"),
    }

    let status = pool.status().await;
    assert!(!status.initialized);
    assert_eq!(status.total_units, 0);

    // Still uninitialized, so submit is rejected rather than queued
    let result = pool.submit_default(TaskPayload::new("x")).await;
    assert_eq!(result, Err(TaskError::PoolNotInitialized));
}

#[tokio::test(start_paused = true)]
async fn test_startup_timeout() {
    let factory = SimEngineFactory::new().with_init_delay(Duration::from_secs(30));
    let config = WorkerPoolConfig::new(2).with_startup_timeout(Duration::from_secs(1));
    let pool = local_pool(config, &factory);

    let start = Instant::now();
    let err = pool.initialize().await.unwrap_err();
    assert_eq!(err, InitError::StartupTimeout(Duration::from_secs(1)));
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(pool.status().await.total_units, 0);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_config_rejected() {
    let factory = SimEngineFactory::new();
    let pool = local_pool(WorkerPoolConfig::new(0), &factory);

    let err = pool.initialize().await.unwrap_err();
    assert!(matches!(err, InitError::Config(_)));
}

#[tokio::test(start_paused = true)]
async fn test_negative_backoff_rejected_at_initialize() {
    let factory = SimEngineFactory::new();
    let policy = ReplacementPolicy::exponential()
        .with_backoff_coefficient(-2.0)
        .with_jitter(0.0);
    let config = WorkerPoolConfig::new(1).with_replacement(policy);
    let pool = local_pool(config, &factory);

    let err = pool.initialize().await.unwrap_err();
    assert!(matches!(
        err,
        InitError::Config(ConfigError::InvalidReplacement(_))
    ));
    assert_eq!(factory.init_count(), 0);
    assert!(!pool.snapshot().initialized);
}

// ============================================
// Dispatch and queueing
// ============================================

#[tokio::test(start_paused = true)]
async fn test_n_tasks_dispatch_directly_and_one_more_queues() {
    let (pool, _factory) = running_pool(2).await;
    let slow = SimOptions::delay(100);

    let a = pool.submit(slow.payload("a"), LONG);
    let b = pool.submit(slow.payload("b"), LONG);
    let status = pool.status().await;
    assert_eq!(status.busy_units, 2);
    assert_eq!(status.queued_tasks, 0);

    let c = pool.submit(slow.payload("c"), LONG);
    let status = pool.status().await;
    assert_eq!(status.busy_units, 2);
    assert_eq!(status.queued_tasks, 1);

    assert_eq!(a.await.unwrap().text, "a");
    assert_eq!(b.await.unwrap().text, "b");
    assert_eq!(c.await.unwrap().text, "c");

    let status = pool.status().await;
    assert_eq!(status.queued_tasks, 0);
    assert_eq!(status.busy_units, 0);
    assert_eq!(status.tasks_completed, 3);
}

#[tokio::test(start_paused = true)]
async fn test_three_tasks_on_two_units_finish_by_200ms() {
    let (pool, _factory) = running_pool(2).await;
    let job = SimOptions::delay(100);

    let start = Instant::now();
    let (a, b, c) = tokio::join!(
        pool.submit(job.payload("A"), LONG),
        pool.submit(job.payload("B"), LONG),
        pool.submit(job.payload("C"), LONG),
    );
    let elapsed = start.elapsed();

    assert_eq!(a.unwrap().metadata["runs"], 1);
    assert_eq!(b.unwrap().metadata["runs"], 1);
    // C waited for whichever unit freed first
    assert_eq!(c.unwrap().metadata["runs"], 2);
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(250));
}

#[tokio::test(start_paused = true)]
async fn test_queue_is_fifo() {
    let (pool, _factory) = running_pool(1).await;
    let job = SimOptions::delay(10);

    let handles: Vec<_> = (0..5)
        .map(|i| pool.submit(job.payload(format!("q{i}")), LONG))
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let output = handle.await.unwrap();
        assert_eq!(output.text, format!("q{i}"));
        assert_eq!(output.metadata["runs"], i as u64 + 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_queue_limit() {
    let factory = SimEngineFactory::new();
    let pool = local_pool(WorkerPoolConfig::new(1).with_max_queue(1), &factory);
    pool.initialize().await.unwrap();
    let job = SimOptions::delay(100);

    let running = pool.submit(job.payload("running"), LONG);
    let queued = pool.submit(job.payload("queued"), LONG);
    let rejected = pool.submit(job.payload("rejected"), LONG);

    assert_eq!(rejected.await, Err(TaskError::QueueFull(1)));
    assert!(running.await.is_ok());
    assert!(queued.await.is_ok());
}

// ============================================
// Failures
// ============================================

#[tokio::test(start_paused = true)]
async fn test_engine_failure_keeps_unit() {
    let (pool, factory) = running_pool(1).await;

    let result = pool
        .submit_default(SimOptions::fail("unsupported image").payload("x"))
        .await;
    assert_eq!(
        result,
        Err(TaskError::EngineFailure("unsupported image".into()))
    );

    let output = pool.submit_default(TaskPayload::new("next")).await.unwrap();
    assert_eq!(output.text, "next");
    assert_eq!(factory.init_count(), 1);
    assert_eq!(pool.status().await.tasks_failed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_kills_and_replaces_unit() {
    let (pool, factory) = running_pool(1).await;

    let start = Instant::now();
    let result = pool
        .submit(SimOptions::delay(500).payload("slow"), Duration::from_millis(50))
        .await;
    assert_eq!(result, Err(TaskError::TimedOut(Duration::from_millis(50))));
    assert!(start.elapsed() < Duration::from_millis(100));

    tokio::time::sleep_until(start + Duration::from_millis(200)).await;
    let status = pool.status().await;
    assert_eq!(status.total_units, 1);
    assert_eq!(status.units_replaced, 1);

    let output = pool.submit_default(TaskPayload::new("after")).await.unwrap();
    assert_eq!(output.text, "after");
    // Fresh engine in the replacement unit
    assert_eq!(output.metadata["runs"], 1);
    assert_eq!(factory.init_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_zero_deadline_rejected_without_touching_units() {
    let (pool, factory) = running_pool(1).await;

    let result = pool.submit(TaskPayload::new("never"), Duration::ZERO).await;
    assert_eq!(result, Err(TaskError::InvalidDeadline));

    let status = pool.status().await;
    assert_eq!(status.total_units, 1);
    assert_eq!(status.units_replaced, 0);
    assert_eq!(status.tasks_failed, 0);
    assert_eq!(factory.init_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_does_not_affect_other_tasks() {
    let (pool, _factory) = running_pool(2).await;

    let doomed = pool.submit(SimOptions::delay(1_000).payload("doomed"), Duration::from_millis(50));
    let fine = pool.submit(SimOptions::delay(300).payload("fine"), LONG);
    let queued = pool.submit(TaskPayload::new("queued"), LONG);

    assert!(doomed.await.unwrap_err().is_timeout());
    assert_eq!(fine.await.unwrap().text, "fine");
    assert_eq!(queued.await.unwrap().text, "queued");
}

#[tokio::test(start_paused = true)]
async fn test_crash_reported_and_unit_replaced() {
    let (pool, _factory) = running_pool(1).await;

    let err = pool
        .submit_default(SimOptions::crash().payload("boom"))
        .await
        .unwrap_err();
    match err {
        TaskError::UnitCrashed { reason, .. } => {
            assert_eq!(reason, TerminationReason::Panicked("simulated crash".into()));
        }
        other => panic!("unexpected error: {other}"),
    }

    let output = pool.submit_default(TaskPayload::new("still here")).await.unwrap();
    assert_eq!(output.text, "still here");
    assert_eq!(pool.status().await.units_replaced, 1);
}

#[tokio::test(start_paused = true)]
async fn test_replacement_exhaustion_degrades_pool() {
    let factory = SimEngineFactory::new().with_max_inits(1);
    let config = WorkerPoolConfig::new(1)
        .with_replacement(ReplacementPolicy::fixed(Duration::from_millis(10), 3));
    let pool = local_pool(config, &factory);
    pool.initialize().await.unwrap();

    let err = pool
        .submit_default(SimOptions::crash().payload("boom"))
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::UnitCrashed { .. }));

    tokio::time::sleep(Duration::from_secs(1)).await;
    let status = pool.status().await;
    assert_eq!(status.degraded, 1);
    assert_eq!(status.total_units, 0);
    assert!(!status.is_healthy());
    // One initial load plus three replacement attempts
    assert_eq!(factory.init_count(), 4);

    let result = pool.submit_default(TaskPayload::new("nowhere")).await;
    assert_eq!(result, Err(TaskError::NoCapacity));
}

// ============================================
// Shutdown
// ============================================

#[tokio::test(start_paused = true)]
async fn test_shutdown_resolves_in_flight_and_queued() {
    let (pool, _factory) = running_pool(2).await;
    let job = SimOptions::delay(10_000);

    let handles: Vec<_> = (0..5).map(|_| pool.submit(job.payload("x"), LONG)).collect();
    let status = pool.status().await;
    assert_eq!(status.busy_units, 2);
    assert_eq!(status.queued_tasks, 3);

    pool.shutdown().await;

    for handle in handles {
        assert_eq!(handle.await, Err(TaskError::ShutdownAbandoned));
    }

    let result = pool.submit_default(TaskPayload::new("late")).await;
    assert_eq!(result, Err(TaskError::PoolShuttingDown));

    let snapshot = pool.snapshot();
    assert!(!snapshot.initialized);
    assert_eq!(snapshot.total_units, 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_twice() {
    let (pool, _factory) = running_pool(2).await;

    pool.shutdown().await;
    pool.shutdown().await;

    assert_eq!(pool.initialize().await, Err(InitError::ShutDown));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_initialize() {
    let factory = SimEngineFactory::new().with_init_delay(Duration::from_secs(5));
    let pool = local_pool(WorkerPoolConfig::new(2), &factory);

    let init = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.initialize().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    pool.shutdown().await;

    assert_eq!(init.await.unwrap(), Err(InitError::ShutDown));
}

#[tokio::test(start_paused = true)]
async fn test_dropping_last_handle_shuts_down() {
    let (pool, _factory) = running_pool(1).await;

    let pending = pool.submit(SimOptions::delay(10_000).payload("x"), LONG);
    drop(pool);

    assert_eq!(pending.await, Err(TaskError::ShutdownAbandoned));
}
