//! The coordinator actor
//!
//! One tokio task owns every piece of pool state: the unit table, the idle
//! free list, the wait queue and the deadline timers. Callers, units and
//! timers only talk to it through channels, so no state is ever shared.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::snapshot::PoolSnapshot;
use crate::config::WorkerPoolConfig;
use crate::envelope::{JobOutput, TaskEnvelope, TaskId, TaskOutcome, TaskPayload};
use crate::error::{InitError, TaskError};
use crate::unit::{
    TerminationReason, UnitEvent, UnitHandle, UnitId, UnitLauncher, UnitMessage, UnitState,
};

pub(super) type TaskReply = oneshot::Sender<Result<JobOutput, TaskError>>;

/// Requests from [`WorkerPool`](super::WorkerPool) handles
pub(super) enum Command {
    Initialize {
        reply: oneshot::Sender<Result<(), InitError>>,
    },
    Submit {
        payload: TaskPayload,
        deadline: Duration,
        reply: TaskReply,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<PoolSnapshot>,
    },
}

enum Timer {
    Deadline { unit: UnitId, task: TaskId },
    StartupExpired { generation: u64 },
    Replace { attempt: u32 },
    UnitsTerminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Uninitialized,
    Initializing,
    Running,
    ShuttingDown,
    Stopped,
}

struct Unit {
    handle: Box<dyn UnitHandle>,
    state: UnitState,
    running: Option<RunningTask>,
    /// Launch attempt that produced this unit (0 = initial)
    attempt: u32,
}

struct RunningTask {
    id: TaskId,
    reply: TaskReply,
    deadline: Duration,
    timer: AbortHandle,
}

struct PendingTask {
    id: TaskId,
    payload: TaskPayload,
    deadline: Duration,
    reply: TaskReply,
}

#[derive(Default)]
struct Counters {
    tasks_completed: u64,
    tasks_failed: u64,
    units_replaced: u64,
}

pub(super) struct Coordinator {
    config: Arc<WorkerPoolConfig>,
    launcher: Box<dyn UnitLauncher>,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_closed: bool,
    events_tx: mpsc::UnboundedSender<UnitMessage>,
    events_rx: mpsc::UnboundedReceiver<UnitMessage>,
    timers_tx: mpsc::UnboundedSender<Timer>,
    timers_rx: mpsc::UnboundedReceiver<Timer>,
    snapshot: watch::Sender<PoolSnapshot>,

    phase: Phase,
    generation: u64,
    units: HashMap<UnitId, Unit>,
    idle: VecDeque<UnitId>,
    queue: VecDeque<PendingTask>,
    init_waiters: Vec<oneshot::Sender<Result<(), InitError>>>,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
    terminating: JoinSet<()>,
    pending_replacements: usize,
    abandoned_slots: usize,
    next_unit: u64,
    next_task: u64,
    counters: Counters,
}

impl Coordinator {
    pub(super) fn new(
        config: Arc<WorkerPoolConfig>,
        launcher: Box<dyn UnitLauncher>,
        commands: mpsc::UnboundedReceiver<Command>,
        snapshot: watch::Sender<PoolSnapshot>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (timers_tx, timers_rx) = mpsc::unbounded_channel();
        Self {
            config,
            launcher,
            commands,
            commands_closed: false,
            events_tx,
            events_rx,
            timers_tx,
            timers_rx,
            snapshot,
            phase: Phase::Uninitialized,
            generation: 0,
            units: HashMap::new(),
            idle: VecDeque::new(),
            queue: VecDeque::new(),
            init_waiters: Vec::new(),
            shutdown_waiters: Vec::new(),
            terminating: JoinSet::new(),
            pending_replacements: 0,
            abandoned_slots: 0,
            next_unit: 1,
            next_task: 1,
            counters: Counters::default(),
        }
    }

    pub(super) async fn run(mut self) {
        self.publish();
        loop {
            tokio::select! {
                command = self.commands.recv(), if !self.commands_closed => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All pool handles dropped");
                        self.commands_closed = true;
                        self.begin_shutdown();
                    }
                },
                Some(message) = self.events_rx.recv() => self.handle_event(message),
                Some(timer) = self.timers_rx.recv() => self.handle_timer(timer),
            }

            while self.terminating.try_join_next().is_some() {}
            self.publish();

            if self.phase == Phase::Stopped {
                break;
            }
        }
        debug!("Coordinator exited");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Initialize { reply } => self.handle_initialize(reply),
            Command::Submit {
                payload,
                deadline,
                reply,
            } => self.handle_submit(payload, deadline, reply),
            Command::Shutdown { reply } => self.handle_shutdown(reply),
            Command::Status { reply } => {
                let _ = reply.send(self.build_snapshot());
            }
        }
    }

    fn handle_event(&mut self, message: UnitMessage) {
        let UnitMessage { unit, event } = message;
        if !self.units.contains_key(&unit) {
            debug!(unit = %unit, ?event, "Ignoring event from retired unit");
            return;
        }
        match event {
            UnitEvent::Ready => self.on_unit_ready(unit),
            UnitEvent::InitFailed(message) => self.on_unit_init_failed(unit, message),
            UnitEvent::Finished { task, outcome } => self.on_task_finished(unit, task, outcome),
            UnitEvent::Exited(reason) => self.on_unit_exited(unit, reason),
        }
    }

    fn handle_timer(&mut self, timer: Timer) {
        match timer {
            Timer::Deadline { unit, task } => self.on_deadline(unit, task),
            Timer::StartupExpired { generation } => {
                if self.phase == Phase::Initializing && generation == self.generation {
                    self.fail_initialization(InitError::StartupTimeout(
                        self.config.startup_timeout,
                    ));
                }
            }
            Timer::Replace { attempt } => self.replace_unit(attempt),
            Timer::UnitsTerminated => self.finish_shutdown(),
        }
    }

    // Lifecycle

    fn handle_initialize(&mut self, reply: oneshot::Sender<Result<(), InitError>>) {
        match self.phase {
            Phase::Running => {
                let _ = reply.send(Ok(()));
            }
            Phase::Initializing => self.init_waiters.push(reply),
            Phase::ShuttingDown | Phase::Stopped => {
                let _ = reply.send(Err(InitError::ShutDown));
            }
            Phase::Uninitialized => {
                if let Err(err) = self.config.validate() {
                    let _ = reply.send(Err(err.into()));
                    return;
                }

                self.phase = Phase::Initializing;
                self.generation += 1;
                self.init_waiters.push(reply);
                info!(pool_size = self.config.pool_size, "Initializing worker pool");

                for _ in 0..self.config.pool_size {
                    if let Err(err) = self.launch_unit(0) {
                        self.fail_initialization(err);
                        return;
                    }
                }

                let generation = self.generation;
                self.schedule(
                    self.config.startup_timeout,
                    Timer::StartupExpired { generation },
                );
            }
        }
    }

    fn launch_unit(&mut self, attempt: u32) -> Result<UnitId, InitError> {
        let id = UnitId::new(self.next_unit);
        self.next_unit += 1;

        let handle = self
            .launcher
            .launch(id, self.events_tx.clone())
            .map_err(|err| InitError::Launch {
                unit: id,
                message: err.to_string(),
            })?;

        debug!(unit = %id, attempt, "Launched worker unit");
        self.units.insert(
            id,
            Unit {
                handle,
                state: UnitState::Initializing,
                running: None,
                attempt,
            },
        );
        Ok(id)
    }

    fn fail_initialization(&mut self, err: InitError) {
        error!(error = %err, "Worker pool initialization failed");
        self.phase = Phase::Uninitialized;
        self.idle.clear();
        let units: Vec<_> = self.units.drain().map(|(_, unit)| unit).collect();
        for unit in units {
            self.retire(unit.handle);
        }
        self.publish();
        for waiter in self.init_waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    fn handle_shutdown(&mut self, reply: oneshot::Sender<()>) {
        if self.phase == Phase::Stopped {
            let _ = reply.send(());
            return;
        }
        self.shutdown_waiters.push(reply);
        self.begin_shutdown();
    }

    fn begin_shutdown(&mut self) {
        if matches!(self.phase, Phase::ShuttingDown | Phase::Stopped) {
            return;
        }
        info!(
            units = self.units.len(),
            queued = self.queue.len(),
            "Shutting down worker pool"
        );
        self.phase = Phase::ShuttingDown;

        for waiter in self.init_waiters.drain(..) {
            let _ = waiter.send(Err(InitError::ShutDown));
        }

        for task in self.queue.drain(..) {
            let _ = task.reply.send(Err(TaskError::ShutdownAbandoned));
            self.counters.tasks_failed += 1;
        }

        self.idle.clear();
        let units: Vec<_> = self.units.drain().map(|(_, unit)| unit).collect();
        for unit in units {
            if let Some(running) = unit.running {
                running.timer.abort();
                debug!(task = %running.id, "Abandoning in-flight task");
                let _ = running.reply.send(Err(TaskError::ShutdownAbandoned));
                self.counters.tasks_failed += 1;
            }
            self.retire(unit.handle);
        }

        // Wait for every kill, including ones started before shutdown
        let mut terminating = std::mem::replace(&mut self.terminating, JoinSet::new());
        let timers = self.timers_tx.clone();
        tokio::spawn(async move {
            while terminating.join_next().await.is_some() {}
            let _ = timers.send(Timer::UnitsTerminated);
        });
    }

    fn finish_shutdown(&mut self) {
        self.phase = Phase::Stopped;
        info!("Worker pool stopped");
        self.publish();
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    // Tasks

    fn handle_submit(&mut self, payload: TaskPayload, deadline: Duration, reply: TaskReply) {
        let rejection = match self.phase {
            Phase::Uninitialized | Phase::Initializing => Some(TaskError::PoolNotInitialized),
            Phase::ShuttingDown | Phase::Stopped => Some(TaskError::PoolShuttingDown),
            Phase::Running if self.units.is_empty() && self.pending_replacements == 0 => {
                Some(TaskError::NoCapacity)
            }
            Phase::Running => match self.config.max_queue {
                Some(limit) if self.idle.is_empty() && self.queue.len() >= limit => {
                    Some(TaskError::QueueFull(limit))
                }
                _ => None,
            },
        };
        if let Some(err) = rejection {
            debug!(error = %err, "Rejecting task");
            let _ = reply.send(Err(err));
            return;
        }

        let id = TaskId(self.next_task);
        self.next_task += 1;
        self.queue.push_back(PendingTask {
            id,
            payload,
            deadline,
            reply,
        });
        self.dispatch_queued();

        if self.queue.back().is_some_and(|task| task.id == id) {
            debug!(task = %id, queued = self.queue.len(), "All units busy, task queued");
        }
    }

    /// Hand queued tasks to idle units, oldest first
    fn dispatch_queued(&mut self) {
        while !self.queue.is_empty() {
            let Some(unit_id) = self.idle.pop_front() else {
                break;
            };
            let Some(task) = self.queue.pop_front() else {
                break;
            };
            self.start_task(unit_id, task);
        }
    }

    fn start_task(&mut self, unit_id: UnitId, task: PendingTask) {
        let Some(unit) = self.units.get_mut(&unit_id) else {
            self.queue.push_front(task);
            return;
        };

        let PendingTask {
            id,
            payload,
            deadline,
            reply,
        } = task;
        let envelope = TaskEnvelope {
            id,
            payload,
            deadline,
        };

        match unit.handle.dispatch(envelope) {
            Ok(()) => {
                debug!(unit = %unit_id, task = %id, ?deadline, "Dispatched task");
                let timer = self.schedule(
                    deadline,
                    Timer::Deadline {
                        unit: unit_id,
                        task: id,
                    },
                );
                if let Some(unit) = self.units.get_mut(&unit_id) {
                    unit.state = UnitState::Busy;
                    unit.running = Some(RunningTask {
                        id,
                        reply,
                        deadline,
                        timer,
                    });
                }
            }
            Err(envelope) => {
                // The unit is gone; put the task back at the head of the line
                warn!(unit = %unit_id, task = %id, "Worker unit rejected dispatch");
                self.queue.push_front(PendingTask {
                    id: envelope.id,
                    payload: envelope.payload,
                    deadline: envelope.deadline,
                    reply,
                });
                if let Some(unit) = self.units.remove(&unit_id) {
                    self.retire(unit.handle);
                }
                self.schedule_replacement(1);
            }
        }
    }

    fn on_task_finished(&mut self, unit_id: UnitId, task: TaskId, outcome: TaskOutcome) {
        let Some(unit) = self.units.get_mut(&unit_id) else {
            return;
        };
        let running = match unit.running.take() {
            Some(running) if running.id == task => running,
            other => {
                debug!(unit = %unit_id, task = %task, "Ignoring stale task result");
                unit.running = other;
                return;
            }
        };

        running.timer.abort();
        unit.state = UnitState::Ready;

        match outcome {
            Ok(output) => {
                debug!(unit = %unit_id, task = %task, "Task completed");
                self.counters.tasks_completed += 1;
                let _ = running.reply.send(Ok(output));
            }
            Err(message) => {
                debug!(unit = %unit_id, task = %task, error = %message, "Task failed");
                self.counters.tasks_failed += 1;
                let _ = running.reply.send(Err(TaskError::EngineFailure(message)));
            }
        }

        self.idle.push_back(unit_id);
        self.dispatch_queued();
    }

    fn on_deadline(&mut self, unit_id: UnitId, task: TaskId) {
        let matches = self
            .units
            .get(&unit_id)
            .and_then(|unit| unit.running.as_ref())
            .is_some_and(|running| running.id == task);
        if !matches {
            return;
        }
        let Some(unit) = self.units.remove(&unit_id) else {
            return;
        };

        if let Some(running) = unit.running {
            warn!(
                unit = %unit_id,
                task = %task,
                deadline = ?running.deadline,
                "Task exceeded its deadline, killing worker unit"
            );
            self.counters.tasks_failed += 1;
            let _ = running.reply.send(Err(TaskError::TimedOut(running.deadline)));
        }
        self.retire(unit.handle);
        self.schedule_replacement(1);
    }

    // Unit health

    fn on_unit_ready(&mut self, unit_id: UnitId) {
        let Some(unit) = self.units.get_mut(&unit_id) else {
            return;
        };
        if unit.state != UnitState::Initializing {
            return;
        }
        unit.state = UnitState::Ready;
        let replaced = unit.attempt > 0;
        unit.attempt = 0;
        self.idle.push_back(unit_id);

        match self.phase {
            Phase::Initializing => {
                debug!(unit = %unit_id, "Worker unit ready");
                let all_ready = self.units.len() == self.config.pool_size
                    && self
                        .units
                        .values()
                        .all(|unit| unit.state == UnitState::Ready);
                if all_ready {
                    self.phase = Phase::Running;
                    info!(units = self.units.len(), "Worker pool initialized");
                    self.publish();
                    for waiter in self.init_waiters.drain(..) {
                        let _ = waiter.send(Ok(()));
                    }
                }
            }
            Phase::Running => {
                if replaced {
                    self.counters.units_replaced += 1;
                    info!(unit = %unit_id, "Replacement worker unit ready");
                }
                self.dispatch_queued();
            }
            _ => {}
        }
    }

    fn on_unit_init_failed(&mut self, unit_id: UnitId, message: String) {
        match self.phase {
            Phase::Initializing => self.fail_initialization(InitError::Engine {
                unit: unit_id,
                message,
            }),
            Phase::Running => {
                let Some(unit) = self.units.remove(&unit_id) else {
                    return;
                };
                warn!(unit = %unit_id, error = %message, "Replacement unit failed to initialize");
                let attempt = unit.attempt;
                self.retire(unit.handle);
                self.replacement_failed(attempt);
            }
            _ => {}
        }
    }

    fn on_unit_exited(&mut self, unit_id: UnitId, reason: TerminationReason) {
        let Some(unit) = self.units.remove(&unit_id) else {
            return;
        };
        self.idle.retain(|id| *id != unit_id);

        match self.phase {
            Phase::Initializing => {
                self.fail_initialization(InitError::Exited {
                    unit: unit_id,
                    reason,
                });
            }
            Phase::Running => {
                warn!(unit = %unit_id, reason = %reason, "Worker unit died");
                if let Some(running) = unit.running {
                    running.timer.abort();
                    self.counters.tasks_failed += 1;
                    let _ = running.reply.send(Err(TaskError::UnitCrashed {
                        unit: unit_id,
                        reason,
                    }));
                }
                if unit.state == UnitState::Initializing && unit.attempt > 0 {
                    self.replacement_failed(unit.attempt);
                } else {
                    self.schedule_replacement(1);
                }
            }
            _ => {}
        }
    }

    fn schedule_replacement(&mut self, attempt: u32) {
        if self.phase != Phase::Running {
            return;
        }
        self.pending_replacements += 1;
        let delay = self.config.replacement.delay_for_attempt(attempt);
        if delay.is_zero() {
            self.replace_unit(attempt);
        } else {
            debug!(attempt, ?delay, "Scheduling unit replacement");
            self.schedule(delay, Timer::Replace { attempt });
        }
    }

    fn replace_unit(&mut self, attempt: u32) {
        self.pending_replacements = self.pending_replacements.saturating_sub(1);
        if self.phase != Phase::Running {
            return;
        }
        match self.launch_unit(attempt) {
            Ok(id) => info!(unit = %id, attempt, "Launching replacement worker unit"),
            Err(err) => {
                warn!(error = %err, attempt, "Failed to launch replacement unit");
                self.replacement_failed(attempt);
            }
        }
    }

    fn replacement_failed(&mut self, attempt: u32) {
        if self.config.replacement.has_attempts_remaining(attempt) {
            self.schedule_replacement(attempt + 1);
            return;
        }

        self.abandoned_slots += 1;
        error!(
            attempts = attempt,
            degraded = self.abandoned_slots,
            "Giving up on replacing worker unit, pool is degraded"
        );

        if self.units.is_empty() && self.pending_replacements == 0 {
            for task in self.queue.drain(..) {
                let _ = task.reply.send(Err(TaskError::NoCapacity));
                self.counters.tasks_failed += 1;
            }
        }
    }

    // Helpers

    fn retire(&mut self, handle: Box<dyn UnitHandle>) {
        let id = handle.id();
        let termination = handle.terminate();
        self.terminating.spawn(async move {
            let reason = termination.await;
            debug!(unit = %id, reason = %reason, "Worker unit terminated");
        });
    }

    fn schedule(&self, delay: Duration, timer: Timer) -> AbortHandle {
        let timers = self.timers_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timers.send(timer);
        })
        .abort_handle()
    }

    fn build_snapshot(&self) -> PoolSnapshot {
        let count = |state| {
            self.units
                .values()
                .filter(|unit| unit.state == state)
                .count()
        };
        PoolSnapshot {
            initialized: self.phase == Phase::Running,
            total_units: self.units.len(),
            busy_units: count(UnitState::Busy),
            queued_tasks: self.queue.len(),
            target_units: self.config.pool_size,
            starting_units: count(UnitState::Initializing),
            degraded: self.abandoned_slots,
            tasks_completed: self.counters.tasks_completed,
            tasks_failed: self.counters.tasks_failed,
            units_replaced: self.counters.units_replaced,
        }
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.build_snapshot());
    }
}
