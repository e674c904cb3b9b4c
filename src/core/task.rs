//! Task data model for the level graph.
//!
//! Tasks are the atomic units of work claimed by workers. Each task carries
//! its static definition (files, verification, estimate) alongside the
//! mutable execution record (status, owner, retries, timestamps).

use crate::core::worker::WorkerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::time::Duration;

/// Default estimate for a task that does not declare one.
pub const DEFAULT_ESTIMATE_MINUTES: u32 = 15;

/// Default verification timeout in seconds.
pub const DEFAULT_VERIFICATION_TIMEOUT_SECS: u64 = 300;

/// Identifier of a task, unique within a feature's graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Borrow<str> for TaskId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created at graph load, not yet claimed.
    Pending,
    /// Explicitly queued; claimable like `Pending`.
    Todo,
    /// Owned by a worker that has not started executing.
    Claimed,
    /// Owned by a worker and executing.
    InProgress,
    /// Finished and verified.
    Complete,
    /// Finished unsuccessfully.
    Failed,
    /// Cannot proceed until an external condition clears.
    Blocked,
    /// Suspended by an operator.
    Paused,
    /// Failed with a retry scheduled at `next_retry_at`.
    WaitingRetry,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    /// Statuses a worker may claim from.
    pub fn is_claimable(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Todo)
    }

    /// Statuses that require an owning worker.
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Claimed | TaskStatus::InProgress)
    }

    /// Complete or failed.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Failed)
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step.
    ///
    /// Claiming (`Pending/Todo -> Claimed`) is only legal through the
    /// store's claim protocol, which checks this as well.
    pub fn can_transition(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Todo)
                | (Todo, Pending)
                | (Pending | Todo, Claimed)
                | (Pending | Todo, Blocked)
                | (Pending | Todo, Paused)
                | (Claimed, InProgress)
                | (Claimed, Pending)
                | (Claimed, Failed)
                | (Claimed, Paused)
                | (InProgress, Complete)
                | (InProgress, Failed)
                | (InProgress, Paused)
                | (InProgress, Blocked)
                | (Failed, WaitingRetry)
                | (Failed, Pending)
                | (WaitingRetry, Pending)
                | (WaitingRetry, Failed)
                | (Blocked, Pending)
                | (Blocked, Todo)
                | (Paused, Pending)
                | (Paused, Todo)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Todo => "todo",
            TaskStatus::Claimed => "claimed",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Complete => "complete",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Paused => "paused",
            TaskStatus::WaitingRetry => "waiting_retry",
        };
        write!(f, "{}", s)
    }
}

/// Files a task touches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskFiles {
    #[serde(default)]
    pub create: Vec<String>,
    #[serde(default)]
    pub modify: Vec<String>,
    #[serde(default)]
    pub read: Vec<String>,
}

impl TaskFiles {
    /// Files this task writes (create + modify).
    pub fn owned(&self) -> impl Iterator<Item = &String> {
        self.create.iter().chain(self.modify.iter())
    }
}

/// Command that proves a task is done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Verification {
    pub command: String,
    /// Seconds before the command is killed.
    #[serde(default = "default_verification_timeout")]
    pub timeout: u64,
}

fn default_verification_timeout() -> u64 {
    DEFAULT_VERIFICATION_TIMEOUT_SECS
}

impl Verification {
    pub fn new(command: &str, timeout: u64) -> Self {
        Self {
            command: command.to_string(),
            timeout,
        }
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// Static task definition as it appears in the graph document.
///
/// Unknown fields are rejected so a typo in the graph is a load error
/// instead of a silently ignored setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskSpec {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub level: u32,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub files: TaskFiles,
    pub verification: Verification,
    #[serde(default = "default_estimate")]
    pub estimate_minutes: u32,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_estimate() -> u32 {
    DEFAULT_ESTIMATE_MINUTES
}

/// A task's full execution record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub level: u32,
    pub dependencies: Vec<TaskId>,
    pub files: TaskFiles,
    pub verification: Verification,
    pub estimate_minutes: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    pub status: TaskStatus,
    pub worker_id: Option<WorkerId>,
    /// Planned placement from the assignment layer; advisory only.
    pub assigned_worker: Option<WorkerId>,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
    pub verification_ms: Option<u64>,
}

impl Task {
    /// Create a pending task record from its definition.
    pub fn from_spec(spec: &TaskSpec, now: DateTime<Utc>) -> Self {
        Self {
            id: spec.id.clone(),
            title: spec.title.clone(),
            description: spec.description.clone(),
            level: spec.level,
            dependencies: spec.dependencies.clone(),
            files: spec.files.clone(),
            verification: spec.verification.clone(),
            estimate_minutes: spec.estimate_minutes,
            tags: spec.tags.clone(),
            status: TaskStatus::Pending,
            worker_id: None,
            assigned_worker: None,
            retry_count: 0,
            next_retry_at: None,
            created_at: now,
            claimed_at: None,
            started_at: None,
            completed_at: None,
            error: None,
            duration_ms: None,
            verification_ms: None,
        }
    }

    /// Take ownership for `worker`.
    pub fn claim(&mut self, worker: WorkerId, now: DateTime<Utc>) {
        self.status = TaskStatus::Claimed;
        self.worker_id = Some(worker);
        self.claimed_at = Some(now);
    }

    /// Transition to in-progress and record the start time.
    pub fn start(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::InProgress;
        self.started_at = Some(now);
    }

    /// Mark the task as successfully completed.
    ///
    /// The owning worker is kept on the record for attribution.
    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Complete;
        self.completed_at = Some(now);
        self.error = None;
        self.fill_duration(now);
    }

    /// Mark the task as failed with an error message.
    pub fn fail(&mut self, error: &str, now: DateTime<Utc>) {
        self.status = TaskStatus::Failed;
        self.completed_at = Some(now);
        self.error = Some(error.to_string());
        self.fill_duration(now);
    }

    /// Return to the claimable pool without an owner.
    pub fn release(&mut self) {
        self.status = TaskStatus::Pending;
        self.worker_id = None;
        self.claimed_at = None;
        self.started_at = None;
    }

    fn fill_duration(&mut self, now: DateTime<Utc>) {
        if self.duration_ms.is_none() {
            if let Some(started) = self.started_at {
                let ms = (now - started).num_milliseconds();
                if ms >= 0 {
                    self.duration_ms = Some(ms as u64);
                }
            }
        }
    }

    /// Check if the task is in a terminal state (Complete or Failed).
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Check if the task can be claimed (Pending or Todo).
    pub fn can_claim(&self) -> bool {
        self.status.is_claimable()
    }

    /// Whether the ownership invariant holds for this record.
    pub fn ownership_consistent(&self) -> bool {
        match self.status {
            TaskStatus::Claimed | TaskStatus::InProgress => self.worker_id.is_some(),
            TaskStatus::Complete | TaskStatus::Failed => true,
            _ => self.worker_id.is_none(),
        }
    }
}
