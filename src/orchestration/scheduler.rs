//! Run driver for a feature.
//!
//! The `Scheduler` prepares the persisted state, starts the first open
//! level and spawns one loop per worker. Each loop claims through the
//! state store, runs the task on the [`WorkerRuntime`], records the
//! outcome and, once the current level is done, asks the
//! [`LevelCoordinator`] to complete and advance it. Level completion is
//! serialized by an async mutex so exactly one worker merges a level.
//!
//! A task that fails with retries left is rebalanced onto the worker with
//! the most spare capacity. With a [`GovernanceService`] attached, worker
//! loops also run a pulse check at the configured interval and move
//! planned work off stalled workers.
//!
//! The run stops when every level is complete, when a merge conflict
//! halts advancement, or when nothing can make further progress.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{Sleeper, TokioSleeper};
use crate::config::HiveConfig;
use crate::core::{
    LevelStatus, MergeRecord, MergeStatus, Task, TaskGraph, TaskId, TaskStatus, Worker, WorkerId,
    WorkerStatus,
};
use crate::dependency::DependencyChecker;
use crate::error::{Error, Result};
use crate::orchestration::assignment::{Reassignment, WorkerAssignment};
use crate::orchestration::backpressure::BackpressureController;
use crate::orchestration::health::GovernanceService;
use crate::orchestration::heartbeat::{Heartbeat, HeartbeatStore};
use crate::orchestration::level::{Advance, LevelCompletion, LevelCoordinator, MergeEngine};
use crate::orchestration::retry::RetryPolicy;
use crate::orchestration::roles::RoleMatcher;
use crate::orchestration::runtime::{TaskOutcome, WorkerRuntime};
use crate::state::{StateDocument, StateStore, StatusUpdate};
use crate::util::blocking;

/// Longest error text stored on a failed task.
const MAX_ERROR_CHARS: usize = 2000;

/// Events emitted by the scheduler as the run progresses.
///
/// The receiver must keep draining the channel; a full channel stalls
/// the workers that are trying to report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    LevelStarted {
        level: u32,
    },
    TaskStarted {
        task_id: TaskId,
        worker_id: WorkerId,
    },
    TaskCompleted {
        task_id: TaskId,
        worker_id: WorkerId,
    },
    TaskFailed {
        task_id: TaskId,
        worker_id: WorkerId,
        error: String,
        /// A retry has been scheduled.
        will_retry: bool,
    },
    /// A task waiting for retry went back to the pool.
    TaskRequeued {
        task_id: TaskId,
    },
    /// Planned work moved between workers.
    TaskRebalanced {
        task_id: TaskId,
        from: WorkerId,
        to: WorkerId,
    },
    /// A pulse check found the worker stalled.
    WorkerStalled {
        worker_id: WorkerId,
    },
    /// Backpressure stopped new claims for the level.
    LevelPaused {
        level: u32,
    },
    LevelCompleted {
        level: u32,
        outcome: LevelCompletion,
    },
    MergeConflict {
        level: u32,
        conflicting_files: Vec<String>,
    },
    Halted {
        reason: HaltReason,
    },
}

/// Result of one claim attempt. Transient conditions are values, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(Task),
    NoneAvailable,
    LevelPaused(u32),
    Paused,
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum HaltReason {
    /// Every level is complete.
    Complete,
    MergeConflict { level: u32 },
    /// Remaining tasks can never become claimable.
    NoProgress { level: u32 },
    LevelPaused { level: u32 },
    /// Operator pause with nothing in flight.
    Paused,
    Cancelled,
    /// Every worker gave up waiting for work.
    IdleTimeout,
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HaltReason::Complete => write!(f, "all levels complete"),
            HaltReason::MergeConflict { level } => write!(f, "merge conflict in level {}", level),
            HaltReason::NoProgress { level } => write!(f, "no progress possible in level {}", level),
            HaltReason::LevelPaused { level } => write!(f, "level {} paused by backpressure", level),
            HaltReason::Paused => write!(f, "run paused"),
            HaltReason::Cancelled => write!(f, "cancelled"),
            HaltReason::IdleTimeout => write!(f, "workers idle past max wait"),
        }
    }
}

/// Outcome of [`Scheduler::run`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub feature: String,
    pub completed_tasks: Vec<TaskId>,
    pub failed_tasks: Vec<TaskId>,
    pub completed_levels: usize,
    pub merge_records: Vec<MergeRecord>,
    pub halt: HaltReason,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.halt == HaltReason::Complete && self.failed_tasks.is_empty()
    }
}

/// Drives one run. Build it, wrap it in an `Arc` and call [`Scheduler::run`] once.
pub struct Scheduler {
    config: HiveConfig,
    graph: Arc<TaskGraph>,
    store: Arc<StateStore>,
    deps: Arc<DependencyChecker>,
    runtime: Arc<dyn WorkerRuntime>,
    coordinator: Arc<LevelCoordinator>,
    level_gate: tokio::sync::Mutex<()>,
    backpressure: BackpressureController,
    retry: RetryPolicy,
    assignment: Arc<Mutex<WorkerAssignment>>,
    heartbeats: Option<HeartbeatStore>,
    governance: Option<Arc<GovernanceService>>,
    last_pulse: Mutex<Option<DateTime<Utc>>>,
    sleeper: Arc<dyn Sleeper>,
    events: Option<mpsc::Sender<SchedulerEvent>>,
    cancel: CancellationToken,
    stop: CancellationToken,
    halt: Mutex<Option<HaltReason>>,
}

impl Scheduler {
    pub fn new(
        config: HiveConfig,
        graph: Arc<TaskGraph>,
        store: Arc<StateStore>,
        runtime: Arc<dyn WorkerRuntime>,
        merge: Arc<dyn MergeEngine>,
    ) -> Self {
        let deps = Arc::new(DependencyChecker::new(graph.clone(), store.clone()));
        let coordinator = Arc::new(LevelCoordinator::new(
            store.clone(),
            graph.clone(),
            merge,
            config.merge.clone(),
            config.retry.max_retries,
        ));
        let assignment = WorkerAssignment::new(
            config.workers.count,
            config.assignment.clone(),
            RoleMatcher::default(),
        );
        let cancel = CancellationToken::new();
        let stop = cancel.child_token();
        Self {
            backpressure: BackpressureController::new(config.backpressure.clone()),
            retry: RetryPolicy::new(&config.retry),
            config,
            graph,
            store,
            deps,
            runtime,
            coordinator,
            level_gate: tokio::sync::Mutex::new(()),
            assignment: Arc::new(Mutex::new(assignment)),
            heartbeats: None,
            governance: None,
            last_pulse: Mutex::new(None),
            sleeper: Arc::new(TokioSleeper),
            events: None,
            cancel,
            stop,
            halt: Mutex::new(None),
        }
    }

    pub fn with_events(mut self, tx: mpsc::Sender<SchedulerEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_heartbeats(mut self, heartbeats: HeartbeatStore) -> Self {
        self.heartbeats = Some(heartbeats);
        self
    }

    /// Run pulse checks against `governance` while the run is live.
    ///
    /// Worker heartbeats go to the service's heartbeat store unless one
    /// was set with [`Scheduler::with_heartbeats`].
    pub fn with_governance(mut self, governance: Arc<GovernanceService>) -> Self {
        if self.heartbeats.is_none() {
            self.heartbeats = Some(governance.heartbeats().clone());
        }
        self.governance = Some(governance);
        self
    }

    /// Cancelling this token stops every worker after its current task.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn backpressure(&self) -> &BackpressureController {
        &self.backpressure
    }

    pub fn coordinator(&self) -> &LevelCoordinator {
        &self.coordinator
    }

    pub async fn run(self: Arc<Self>) -> Result<RunSummary> {
        let graph = self.graph.clone();
        self.with_store(move |s| s.load_or_initialize(&graph).map(|_| ()))
            .await?;
        self.prepare().await?;

        let count = self.config.workers.count;
        info!(feature = %self.graph.feature(), workers = count, "Run starting");
        let handles: Vec<_> = (0..count)
            .map(|id| tokio::spawn(self.clone().worker_loop(WorkerId(id))))
            .collect();

        let mut first_error = None;
        for joined in join_all(handles).await {
            let result = joined.map_err(|e| Error::TaskJoin(e.to_string())).and_then(|r| r);
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let violations = self.with_store(|s| s.check_ownership_invariant()).await?;
        if !violations.is_empty() {
            return Err(Error::InvariantViolation(violations.join("; ")));
        }

        let halt = self.halt_reason().unwrap_or(if self.cancel.is_cancelled() {
            HaltReason::Cancelled
        } else {
            HaltReason::IdleTimeout
        });
        let doc = self.with_store(|s| s.snapshot()).await?;
        let summary = summarize(&doc, halt);
        info!(
            halt = %halt,
            completed = summary.completed_tasks.len(),
            failed = summary.failed_tasks.len(),
            levels = summary.completed_levels,
            "Run finished"
        );
        self.emit(SchedulerEvent::Halted { reason: halt }).await;
        Ok(summary)
    }

    /// One claim attempt for `worker` against the current level.
    pub async fn claim(&self, worker: WorkerId) -> Result<ClaimOutcome> {
        let (paused, level) = self
            .with_store(|s| Ok((s.is_paused()?, s.get_current_level()?)))
            .await?;
        if paused {
            return Ok(ClaimOutcome::Paused);
        }
        if let Some(level) = level {
            if self.backpressure.is_paused(level) {
                return Ok(ClaimOutcome::LevelPaused(level));
            }
        }
        let deps = self.deps.clone();
        let claimed = self
            .with_store(move |s| s.claim_next_task(worker, level, Some(deps.as_ref())))
            .await?;
        Ok(claimed.map_or(ClaimOutcome::NoneAvailable, ClaimOutcome::Claimed))
    }

    // ========== Setup ==========

    async fn prepare(&self) -> Result<()> {
        let count = self.config.workers.count;
        let prefix = self.config.merge.branch_prefix.clone();
        let feature = self.graph.feature().to_string();
        self.with_store(move |s| {
            for id in (0..count).map(WorkerId) {
                match s.get_worker(id) {
                    Ok(_) => {}
                    Err(Error::WorkerNotFound { .. }) => {
                        let branch = Worker::branch_name(&prefix, &feature, id);
                        s.upsert_worker(Worker::new(id, branch, s.now()))?;
                    }
                    Err(e) => return Err(e),
                }
                s.set_worker_status(id, WorkerStatus::Ready)?;
            }
            Ok(())
        })
        .await?;
        for id in (0..count).map(WorkerId) {
            self.beat(id, None, "ready");
        }

        // Claims left behind by an earlier run can never finish.
        let orphans: Vec<(TaskId, WorkerId)> = self
            .with_store(|s| {
                s.read(|doc| {
                    doc.ordered_tasks()
                        .filter(|t| t.status.is_active())
                        .filter_map(|t| t.worker_id.map(|w| (t.id.clone(), w)))
                        .collect()
                })
            })
            .await?;
        for (task, worker) in orphans {
            warn!(task = %task, worker = %worker, "Releasing orphaned claim");
            self.with_store(move |s| s.release_task(&task, worker)).await?;
        }

        let placements = self.assignment().assign(&self.graph);
        debug!(placements = placements.len(), "Assignment plan built");
        let assignment = self.assignment.clone();
        self.with_store(move |s| lock(&assignment).apply_plan(s))
            .await?;

        for level in self.graph.levels() {
            self.backpressure.register_level(level.number, level.tasks.len());
        }

        let current = self.with_store(|s| s.get_current_level()).await?;
        let start = match current {
            None => self.graph.first_level(),
            Some(level) => {
                let record = self.with_store(move |s| s.get_level(level)).await?;
                (record.status == LevelStatus::Pending).then_some(level)
            }
        };
        if let Some(level) = start {
            let coordinator = self.coordinator.clone();
            blocking(move || coordinator.start_level(level)).await?;
            self.emit(SchedulerEvent::LevelStarted { level }).await;
        }
        Ok(())
    }

    // ========== Worker loop ==========

    async fn worker_loop(self: Arc<Self>, worker: WorkerId) -> Result<()> {
        let result = self.drive(worker).await;
        if let Err(e) = &result {
            error!(worker = %worker, error = %e, "Worker loop failed");
            self.stop.cancel();
        }
        let status = if result.is_ok() {
            WorkerStatus::Stopped
        } else {
            WorkerStatus::Crashed
        };
        if let Err(e) = self.with_store(move |s| s.set_worker_status(worker, status)).await {
            warn!(worker = %worker, error = %e, "Could not record worker stop");
        }
        result
    }

    async fn drive(&self, worker: WorkerId) -> Result<()> {
        let poll = self.config.workers.poll_interval();
        let max_wait = self.config.workers.max_wait();
        let mut idle = Duration::ZERO;

        while !self.stop.is_cancelled() {
            self.requeue_retries().await?;
            self.complete_level_if_done().await?;
            if self.pulse_due() {
                if let Err(e) = self.pulse_check().await {
                    warn!(worker = %worker, error = %e, "Pulse check failed");
                }
            }
            if self.stop.is_cancelled() {
                break;
            }

            match self.claim(worker).await? {
                ClaimOutcome::Claimed(task) => {
                    idle = Duration::ZERO;
                    self.execute(worker, task).await?;
                }
                outcome => {
                    if let Some(reason) = self.stuck(&outcome).await? {
                        self.set_halt(reason);
                        break;
                    }
                    if idle >= max_wait {
                        warn!(worker = %worker, waited = ?idle, "No claimable work, worker exiting");
                        break;
                    }
                    self.beat(worker, None, "waiting for work");
                    self.pause(poll).await;
                    idle += poll;
                }
            }
        }
        debug!(worker = %worker, "Worker loop finished");
        Ok(())
    }

    async fn execute(&self, worker: WorkerId, task: Task) -> Result<()> {
        let id = task.id.clone();
        let level = task.level;
        let task_id = id.clone();
        let task = self
            .with_store(move |s| {
                s.set_task_status(&task_id, TaskStatus::InProgress, StatusUpdate::by(worker))
            })
            .await?;
        self.emit(SchedulerEvent::TaskStarted {
            task_id: id.clone(),
            worker_id: worker,
        })
        .await;
        self.beat(worker, Some(&task), &format!("working on {}", task.title));

        let outcome = match self.runtime.invoke(worker, &task).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(task = %id, worker = %worker, error = %e, "Runtime failed, recording task failure");
                TaskOutcome::failure(e.to_string())
            }
        };
        if let Some(ms) = outcome.verification_ms {
            let task_id = id.clone();
            self.with_store(move |s| s.record_verification(&task_id, ms))
                .await?;
        }

        if outcome.success {
            let task_id = id.clone();
            self.with_store(move |s| {
                s.set_task_status(&task_id, TaskStatus::Complete, StatusUpdate::by(worker))
            })
            .await?;
            self.backpressure.observe(level, true);
            self.emit(SchedulerEvent::TaskCompleted {
                task_id: id.clone(),
                worker_id: worker,
            })
            .await;
        } else {
            self.record_failure(worker, &id, level, &outcome.output).await?;
        }
        self.beat(worker, None, "idle");

        let violations = self.with_store(|s| s.check_ownership_invariant()).await?;
        if !violations.is_empty() {
            return Err(Error::InvariantViolation(violations.join("; ")));
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        worker: WorkerId,
        id: &TaskId,
        level: u32,
        output: &str,
    ) -> Result<()> {
        let error: String = if output.trim().is_empty() {
            "task failed".to_string()
        } else {
            output.chars().take(MAX_ERROR_CHARS).collect()
        };
        let task_id = id.clone();
        let update = StatusUpdate::by(worker).with_error(error.clone());
        let failed = self
            .with_store(move |s| s.set_task_status(&task_id, TaskStatus::Failed, update))
            .await?;

        let will_retry = self.retry.should_retry(failed.retry_count);
        if will_retry {
            let at = self
                .retry
                .next_retry_at(self.store.now(), failed.retry_count + 1);
            let task_id = id.clone();
            self.with_store(move |s| s.increment_task_retry(&task_id, Some(at)))
                .await?;
            self.rebalance_failed(id).await?;
        } else {
            warn!(task = %id, retries = failed.retry_count, "Task failed with no retries left");
        }
        self.emit(SchedulerEvent::TaskFailed {
            task_id: id.clone(),
            worker_id: worker,
            error,
            will_retry,
        })
        .await;

        if self.backpressure.observe(level, false) {
            let rate = self.backpressure.get_failure_rate(level);
            self.with_store(move |s| {
                s.append_event(
                    "level_backpressure_paused",
                    json!({"level": level, "failure_rate": rate}),
                )
            })
            .await?;
            self.emit(SchedulerEvent::LevelPaused { level }).await;
        }
        Ok(())
    }

    /// Move a failed task's planned slot to the worker with most capacity.
    async fn rebalance_failed(&self, id: &TaskId) -> Result<()> {
        let assignment = self.assignment.clone();
        let task_id = id.clone();
        let moves = self
            .with_store(move |s| {
                let doc = s.snapshot()?;
                let mut plan = lock(&assignment);
                let moves = plan.rebalance(&[task_id], |t| {
                    doc.tasks
                        .get(t)
                        .map(|t| t.status == TaskStatus::Complete)
                        .unwrap_or(true)
                });
                plan.apply(s, &moves)?;
                Ok(moves)
            })
            .await?;
        self.emit_moves(moves).await;
        Ok(())
    }

    // ========== Governance ==========

    /// Whether a pulse check should run now. Marks it as started.
    fn pulse_due(&self) -> bool {
        if self.governance.is_none() {
            return false;
        }
        let interval = self.config.governance.pulse_interval();
        let now = self.store.now();
        let mut last = lock(&self.last_pulse);
        let due = match *last {
            None => true,
            Some(at) => (now - at).to_std().map(|e| e >= interval).unwrap_or(false),
        };
        if due {
            *last = Some(now);
        }
        due
    }

    /// Check every worker's pulse and move planned work off stalled ones.
    pub async fn pulse_check(&self) -> Result<Vec<Reassignment>> {
        let Some(governance) = self.governance.clone() else {
            return Ok(Vec::new());
        };
        let workers: Vec<WorkerId> = (0..self.config.workers.count).map(WorkerId).collect();
        let assignment = self.assignment.clone();
        let (stalled, moves) = self
            .with_store(move |s| {
                let stalled = governance.run_pulse_check(&workers)?;
                let moves =
                    governance.perform_peer_reassignment(&stalled, &mut lock(&assignment), s)?;
                Ok((stalled, moves))
            })
            .await?;
        for worker_id in stalled {
            self.emit(SchedulerEvent::WorkerStalled { worker_id }).await;
        }
        self.emit_moves(moves.clone()).await;
        Ok(moves)
    }

    async fn emit_moves(&self, moves: Vec<Reassignment>) {
        for change in moves {
            self.emit(SchedulerEvent::TaskRebalanced {
                task_id: change.task,
                from: change.from,
                to: change.to,
            })
            .await;
        }
    }

    async fn requeue_retries(&self) -> Result<()> {
        let ready = self
            .with_store(|s| s.get_tasks_ready_for_retry(s.now()))
            .await?;
        for task in ready {
            let task_id = task.id.clone();
            match self.with_store(move |s| s.requeue_task(&task_id)).await {
                Ok(_) => {
                    self.emit(SchedulerEvent::TaskRequeued { task_id: task.id })
                        .await
                }
                // Another worker requeued or re-ran it first.
                Err(Error::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn complete_level_if_done(&self) -> Result<()> {
        let Some(level) = self.with_store(|s| s.get_current_level()).await? else {
            return Ok(());
        };
        let coordinator = self.coordinator.clone();
        if !blocking(move || coordinator.is_level_done(level)).await? {
            return Ok(());
        }

        let _gate = self.level_gate.lock().await;
        let doc = self.with_store(|s| s.snapshot()).await?;
        if doc.current_level != Some(level) {
            return Ok(());
        }
        let record = doc.level(level)?;
        if record.merge_status == MergeStatus::Conflict {
            self.set_halt(HaltReason::MergeConflict { level });
            return Ok(());
        }
        if !record.is_complete() {
            match self.coordinator.handle_level_complete(level).await? {
                LevelCompletion::Conflict { conflicting_files } => {
                    self.emit(SchedulerEvent::MergeConflict {
                        level,
                        conflicting_files,
                    })
                    .await;
                    self.set_halt(HaltReason::MergeConflict { level });
                    return Ok(());
                }
                outcome => {
                    self.emit(SchedulerEvent::LevelCompleted { level, outcome })
                        .await
                }
            }
        }

        let coordinator = self.coordinator.clone();
        match blocking(move || coordinator.advance()).await? {
            Advance::Started(next) => self.emit(SchedulerEvent::LevelStarted { level: next }).await,
            Advance::Finished => self.set_halt(HaltReason::Complete),
            Advance::Blocked(_) => {}
        }
        Ok(())
    }

    /// Why nothing more can happen, if that is the case.
    async fn stuck(&self, outcome: &ClaimOutcome) -> Result<Option<HaltReason>> {
        let doc = self.with_store(|s| s.snapshot()).await?;
        Ok(self.stuck_in(&doc, outcome))
    }

    fn stuck_in(&self, doc: &StateDocument, outcome: &ClaimOutcome) -> Option<HaltReason> {
        if doc.levels.values().all(|l| l.is_complete()) {
            return Some(HaltReason::Complete);
        }
        let level = doc.current_level?;
        let record = doc.levels.get(&level)?;
        if record.merge_status == MergeStatus::Conflict {
            return Some(HaltReason::MergeConflict { level });
        }
        if doc.tasks.values().any(|t| t.status.is_active()) {
            return None;
        }

        let max_retries = self.retry.max_retries();
        let tasks = doc.level_tasks(level);
        let done = tasks.iter().all(|t| match t.status {
            TaskStatus::Complete => true,
            TaskStatus::Failed => t.retry_count >= max_retries,
            _ => false,
        });
        if done {
            return None;
        }
        if matches!(outcome, ClaimOutcome::Paused) || doc.paused {
            return Some(HaltReason::Paused);
        }
        if matches!(outcome, ClaimOutcome::LevelPaused(_)) || self.backpressure.is_paused(level) {
            return Some(HaltReason::LevelPaused { level });
        }
        let retry_pending = tasks.iter().any(|t| match t.status {
            TaskStatus::WaitingRetry => true,
            TaskStatus::Failed => t.retry_count < max_retries,
            _ => false,
        });
        if retry_pending {
            return None;
        }
        let claimable = tasks.iter().any(|t| {
            t.can_claim()
                && self
                    .deps
                    .incomplete_in(doc, &t.id)
                    .map(|missing| missing.is_empty())
                    .unwrap_or(false)
        });
        if claimable {
            return None;
        }
        warn!(level, "Remaining tasks are blocked on failed dependencies");
        Some(HaltReason::NoProgress { level })
    }

    // ========== Helpers ==========

    async fn with_store<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&StateStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        blocking(move || f(&store)).await
    }

    fn assignment(&self) -> MutexGuard<'_, WorkerAssignment> {
        lock(&self.assignment)
    }

    fn halt_reason(&self) -> Option<HaltReason> {
        *lock(&self.halt)
    }

    /// First reason wins. Stops every worker loop.
    fn set_halt(&self, reason: HaltReason) {
        let mut halt = lock(&self.halt);
        if halt.is_none() {
            info!(reason = %reason, "Run halting");
            *halt = Some(reason);
        }
        self.stop.cancel();
    }

    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = self.stop.cancelled() => {}
            _ = self.sleeper.sleep(duration) => {}
        }
    }

    async fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }

    fn beat(&self, worker: WorkerId, task: Option<&Task>, narrative: &str) {
        let Some(heartbeats) = &self.heartbeats else {
            return;
        };
        let mut heartbeat = Heartbeat::new(worker, self.store.now(), narrative);
        if let Some(task) = task {
            heartbeat = heartbeat.with_task(task.id.clone());
        }
        if let Err(e) = heartbeats.write(&heartbeat) {
            warn!(worker = %worker, error = %e, "Heartbeat write failed");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn summarize(doc: &StateDocument, halt: HaltReason) -> RunSummary {
    let with_status = |status: TaskStatus| {
        doc.ordered_tasks()
            .filter(|t| t.status == status)
            .map(|t| t.id.clone())
            .collect::<Vec<_>>()
    };
    RunSummary {
        feature: doc.feature.clone(),
        completed_tasks: with_status(TaskStatus::Complete),
        failed_tasks: with_status(TaskStatus::Failed),
        completed_levels: doc.completed_levels(),
        merge_records: doc.merge_history.clone(),
        halt,
    }
}
