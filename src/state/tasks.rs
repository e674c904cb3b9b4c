//! Task operations on the state store, including the claim protocol.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info};

use crate::core::{Task, TaskId, TaskStatus, WorkerId, WorkerStatus};
use crate::dependency::{incomplete_dependencies, DependencyChecker};
use crate::error::{Error, Result};
use crate::state::document::StateDocument;
use crate::state::store::StateStore;

/// Extra fields for [`StateStore::set_task_status`].
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    /// Worker making the change. Must own the task if it is active.
    pub worker: Option<WorkerId>,
    pub error: Option<String>,
}

impl StatusUpdate {
    pub fn by(worker: WorkerId) -> Self {
        Self {
            worker: Some(worker),
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// A task stuck in progress and how long it has been running.
#[derive(Debug, Clone)]
pub struct StaleTask {
    pub task: Task,
    pub elapsed: Duration,
}

impl StateStore {
    /// Claim the first eligible task in graph order for `worker`.
    ///
    /// Candidates must be pending or todo, belong to `current_level` when
    /// one is given, and have every recorded dependency complete. A checker
    /// additionally gates on the graph's dependency lists. Nothing is
    /// claimed while the run is paused. `None` is not an error.
    pub fn claim_next_task(
        &self,
        worker: WorkerId,
        current_level: Option<u32>,
        deps: Option<&DependencyChecker>,
    ) -> Result<Option<Task>> {
        self.transact(|doc, now| {
            if doc.paused {
                return Ok(None);
            }
            let mut chosen = None;
            for task in doc.ordered_tasks() {
                if !task.can_claim() || claim_blocker(doc, task, current_level).is_some() {
                    continue;
                }
                if let Some(checker) = deps {
                    if !checker.incomplete_in(doc, &task.id)?.is_empty() {
                        continue;
                    }
                }
                chosen = Some(task.id.clone());
                break;
            }
            match chosen {
                Some(id) => claim_in(doc, &id, worker, now).map(Some),
                None => {
                    debug!(worker = %worker, level = ?current_level, "No claimable task");
                    Ok(None)
                }
            }
        })
    }

    /// Claim a specific task.
    ///
    /// Re-claiming a task the worker already holds returns it unchanged.
    /// A task held by another worker, not claimable, outside the current
    /// level, or waiting on an incomplete dependency yields `None`.
    pub fn claim_task(&self, id: &TaskId, worker: WorkerId) -> Result<Option<Task>> {
        self.transact(|doc, now| {
            if doc.paused {
                return Ok(None);
            }
            let task = doc.task(id)?;
            if task.status.is_active() {
                return Ok((task.worker_id == Some(worker)).then(|| task.clone()));
            }
            if !task.can_claim() {
                return Ok(None);
            }
            if let Some(reason) = claim_blocker(doc, task, doc.current_level) {
                debug!(task = %id, worker = %worker, %reason, "Task not claimable");
                return Ok(None);
            }
            claim_in(doc, id, worker, now).map(Some)
        })
    }

    /// Return an owned task to the pool. A non-owner release is a no-op.
    pub fn release_task(&self, id: &TaskId, worker: WorkerId) -> Result<bool> {
        self.transact(|doc, now| {
            let task = doc.task_mut(id)?;
            if task.worker_id != Some(worker) || !task.status.is_active() {
                debug!(task = %id, worker = %worker, "Ignoring release from non-owner");
                return Ok(false);
            }
            task.release();
            clear_worker_task(doc, worker, id);
            doc.append_event(
                now,
                "task_released",
                json!({"task_id": id, "worker_id": worker}),
            );
            Ok(true)
        })
    }

    /// Move a task to `status`, enforcing legal transitions and ownership.
    pub fn set_task_status(
        &self,
        id: &TaskId,
        status: TaskStatus,
        update: StatusUpdate,
    ) -> Result<Task> {
        self.transact(|doc, now| set_status_in(doc, id, status, update, now))
    }

    /// Record when a task was claimed.
    pub fn record_task_claimed(&self, id: &TaskId, at: DateTime<Utc>) -> Result<()> {
        self.transact(|doc, _| {
            doc.task_mut(id)?.claimed_at = Some(at);
            Ok(())
        })
    }

    /// Record a task's execution duration explicitly.
    pub fn record_task_duration(&self, id: &TaskId, duration_ms: u64) -> Result<()> {
        self.transact(|doc, _| {
            doc.task_mut(id)?.duration_ms = Some(duration_ms);
            Ok(())
        })
    }

    /// Record how long a task's verification command ran.
    pub fn record_verification(&self, id: &TaskId, verification_ms: u64) -> Result<()> {
        self.transact(|doc, _| {
            doc.task_mut(id)?.verification_ms = Some(verification_ms);
            Ok(())
        })
    }

    /// Bump the retry count and schedule the next attempt.
    ///
    /// A failed task moves to `waiting_retry` and gives up its worker.
    /// Returns the new retry count.
    pub fn increment_task_retry(
        &self,
        id: &TaskId,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<u32> {
        self.transact(|doc, now| {
            let task = doc.task_mut(id)?;
            task.retry_count += 1;
            task.next_retry_at = next_retry_at;
            let count = task.retry_count;
            let released = if task.status == TaskStatus::Failed {
                task.status = TaskStatus::WaitingRetry;
                task.worker_id.take()
            } else {
                None
            };
            if let Some(worker) = released {
                clear_worker_task(doc, worker, id);
            }
            doc.append_event(
                now,
                "task_retry_scheduled",
                json!({"task_id": id, "retry_count": count, "next_retry_at": next_retry_at}),
            );
            Ok(count)
        })
    }

    /// Failed or waiting tasks whose retry time has passed.
    pub fn get_tasks_ready_for_retry(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        self.read(|doc| {
            doc.ordered_tasks()
                .filter(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::WaitingRetry))
                .filter(|t| t.next_retry_at.map(|at| at <= now).unwrap_or(false))
                .cloned()
                .collect()
        })
    }

    /// Put a retry-ready task back into the claimable pool.
    ///
    /// The task must be failed or waiting with a scheduled retry that is
    /// due. A failure with no retry scheduled has exhausted its budget and
    /// stays where it is.
    pub fn requeue_task(&self, id: &TaskId) -> Result<Task> {
        self.transact(|doc, now| {
            let task = doc.task_mut(id)?;
            let due = task.next_retry_at.is_some_and(|at| at <= now);
            if !matches!(task.status, TaskStatus::Failed | TaskStatus::WaitingRetry) || !due {
                return Err(Error::InvalidTransition {
                    task: id.clone(),
                    from: task.status,
                    to: TaskStatus::Pending,
                });
            }
            let previous = task.worker_id.take();
            task.status = TaskStatus::Pending;
            task.next_retry_at = None;
            task.claimed_at = None;
            task.started_at = None;
            task.completed_at = None;
            task.duration_ms = None;
            task.verification_ms = None;
            let task = task.clone();
            if let Some(worker) = previous {
                clear_worker_task(doc, worker, id);
            }
            doc.append_event(
                now,
                "task_requeued",
                json!({"task_id": id, "retry_count": task.retry_count}),
            );
            debug!(task = %id, retry = task.retry_count, "Task requeued");
            Ok(task)
        })
    }

    pub fn get_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        self.read(|doc| doc.tasks_with_status(status).into_iter().cloned().collect())
    }

    pub fn get_task(&self, id: &TaskId) -> Result<Task> {
        self.load()?.task(id).cloned()
    }

    /// Tasks in progress for longer than `timeout`.
    pub fn get_stale_in_progress_tasks(&self, timeout: Duration) -> Result<Vec<StaleTask>> {
        let now = self.now();
        self.read(|doc| {
            doc.tasks_with_status(TaskStatus::InProgress)
                .into_iter()
                .filter_map(|task| {
                    let since = task.started_at.or(task.claimed_at)?;
                    let elapsed = (now - since).to_std().ok()?;
                    (elapsed > timeout).then(|| StaleTask {
                        task: task.clone(),
                        elapsed,
                    })
                })
                .collect()
        })
    }

    /// Apply a planned reassignment. Only tasks not in flight move.
    pub fn reassign_task(&self, id: &TaskId, worker: WorkerId) -> Result<bool> {
        self.transact(|doc, now| {
            let task = doc.task_mut(id)?;
            if task.status.is_active() || task.is_finished() {
                debug!(task = %id, status = %task.status, "Not reassigning task in flight");
                return Ok(false);
            }
            let previous = task.assigned_worker.replace(worker);
            doc.append_event(
                now,
                "task_reassigned",
                json!({"task_id": id, "from": previous, "to": worker}),
            );
            Ok(true)
        })
    }

    /// Describe every ownership inconsistency in the document.
    pub fn check_ownership_invariant(&self) -> Result<Vec<String>> {
        self.read(ownership_violations)
    }
}

/// Ownership problems between tasks and worker records.
pub fn ownership_violations(doc: &StateDocument) -> Vec<String> {
    let mut violations = Vec::new();
    for task in doc.ordered_tasks() {
        if !task.ownership_consistent() {
            violations.push(format!(
                "task {} is {} with worker {:?}",
                task.id, task.status, task.worker_id
            ));
        }
    }
    for worker in doc.workers.values() {
        if let Some(current) = &worker.current_task {
            match doc.tasks.get(current) {
                Some(task) if task.worker_id == Some(worker.worker_id) && task.status.is_active() => {}
                Some(task) => violations.push(format!(
                    "worker {} claims task {} which is {} for worker {:?}",
                    worker.worker_id, current, task.status, task.worker_id
                )),
                None => violations.push(format!(
                    "worker {} claims unknown task {}",
                    worker.worker_id, current
                )),
            }
        }
    }
    violations
}

/// What keeps `task` from being claimed under `level`, if anything.
fn claim_blocker(doc: &StateDocument, task: &Task, level: Option<u32>) -> Option<String> {
    if let Some(level) = level {
        if task.level != level {
            return Some(format!("task is level {}, current level is {}", task.level, level));
        }
    }
    let waiting = incomplete_dependencies(&task.dependencies, |dep| {
        doc.tasks.get(dep).map(|t| t.status)
    });
    if waiting.is_empty() {
        return None;
    }
    let names: Vec<&str> = waiting.iter().map(TaskId::as_str).collect();
    Some(format!("waiting on {}", names.join(", ")))
}

fn claim_in(
    doc: &mut StateDocument,
    id: &TaskId,
    worker: WorkerId,
    now: DateTime<Utc>,
) -> Result<Task> {
    let task = doc.task_mut(id)?;
    if !task.status.can_transition(TaskStatus::Claimed) {
        return Err(Error::InvalidTransition {
            task: id.clone(),
            from: task.status,
            to: TaskStatus::Claimed,
        });
    }
    task.claim(worker, now);
    let claimed = task.clone();
    if let Some(record) = doc.workers.get_mut(&worker) {
        record.current_task = Some(id.clone());
        record.status = WorkerStatus::Running;
    }
    doc.append_event(
        now,
        "task_claimed",
        json!({"task_id": id, "worker_id": worker, "level": claimed.level}),
    );
    info!(task = %id, worker = %worker, level = claimed.level, "Task claimed");
    Ok(claimed)
}

pub(crate) fn set_status_in(
    doc: &mut StateDocument,
    id: &TaskId,
    status: TaskStatus,
    update: StatusUpdate,
    now: DateTime<Utc>,
) -> Result<Task> {
    if status == TaskStatus::Claimed {
        if let Some(reason) = claim_blocker(doc, doc.task(id)?, doc.current_level) {
            return Err(Error::NotClaimable {
                task: id.clone(),
                reason,
            });
        }
    }
    let task = doc.task_mut(id)?;
    let from = task.status;
    if !from.can_transition(status) {
        return Err(Error::InvalidTransition {
            task: id.clone(),
            from,
            to: status,
        });
    }
    if from.is_active() {
        if let Some(worker) = update.worker {
            if task.worker_id != Some(worker) {
                return Err(Error::NotOwner {
                    task: id.clone(),
                    worker,
                });
            }
        }
    }

    let owner = task.worker_id;
    match status {
        TaskStatus::Claimed => {
            let worker = update.worker.ok_or_else(|| {
                Error::Validation(format!("Claiming task {} requires a worker", id))
            })?;
            task.claim(worker, now);
        }
        TaskStatus::InProgress => task.start(now),
        TaskStatus::Complete => task.complete(now),
        TaskStatus::Failed => {
            let error = update.error.as_deref().unwrap_or("task failed");
            task.fail(error, now);
        }
        TaskStatus::Pending
        | TaskStatus::Todo
        | TaskStatus::Blocked
        | TaskStatus::Paused
        | TaskStatus::WaitingRetry => {
            task.status = status;
            task.worker_id = None;
            if let Some(error) = &update.error {
                task.error = Some(error.clone());
            }
        }
    }
    let updated = task.clone();

    if let Some(worker) = owner {
        if let Some(record) = doc.workers.get_mut(&worker) {
            match status {
                TaskStatus::Complete => record.tasks_completed += 1,
                TaskStatus::Failed => record.tasks_failed += 1,
                _ => {}
            }
            if !status.is_active() && record.current_task.as_ref() == Some(id) {
                record.current_task = None;
                record.status = WorkerStatus::Idle;
            }
        }
    }
    if let (TaskStatus::Claimed, Some(worker)) = (status, update.worker) {
        if let Some(record) = doc.workers.get_mut(&worker) {
            record.current_task = Some(id.clone());
            record.status = WorkerStatus::Running;
        }
    }

    doc.append_event(
        now,
        "task_status",
        json!({
            "task_id": id,
            "from": from,
            "to": status,
            "worker_id": updated.worker_id,
            "error": updated.error,
        }),
    );
    debug!(task = %id, from = %from, to = %status, "Task status changed");
    Ok(updated)
}

fn clear_worker_task(doc: &mut StateDocument, worker: WorkerId, id: &TaskId) {
    if let Some(record) = doc.workers.get_mut(&worker) {
        if record.current_task.as_ref() == Some(id) {
            record.current_task = None;
            record.status = WorkerStatus::Idle;
        }
    }
}
