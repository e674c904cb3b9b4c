//! Worker records.

use crate::core::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Worker slot number, 0..N-1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u32);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for WorkerId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse::<u32>().map(WorkerId)
    }
}

/// Lifecycle status of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Initializing,
    Ready,
    Running,
    Idle,
    Checkpointing,
    Stopping,
    Stopped,
    Crashed,
    Blocked,
}

impl Default for WorkerStatus {
    fn default() -> Self {
        Self::Initializing
    }
}

impl WorkerStatus {
    /// Whether the worker can still make progress.
    pub fn is_alive(self) -> bool {
        !matches!(self, WorkerStatus::Stopped | WorkerStatus::Crashed)
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerStatus::Initializing => "initializing",
            WorkerStatus::Ready => "ready",
            WorkerStatus::Running => "running",
            WorkerStatus::Idle => "idle",
            WorkerStatus::Checkpointing => "checkpointing",
            WorkerStatus::Stopping => "stopping",
            WorkerStatus::Stopped => "stopped",
            WorkerStatus::Crashed => "crashed",
            WorkerStatus::Blocked => "blocked",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Worker {
    pub worker_id: WorkerId,
    pub status: WorkerStatus,
    pub current_task: Option<TaskId>,
    pub branch: String,
    pub port: Option<u16>,
    /// Fraction of the agent's context window in use, 0.0..=1.0.
    pub context_usage: f64,
    pub started_at: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,
    pub tasks_completed: u32,
    pub tasks_failed: u32,
}

impl Worker {
    pub fn new(worker_id: WorkerId, branch: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            worker_id,
            status: WorkerStatus::Initializing,
            current_task: None,
            branch: branch.into(),
            port: None,
            context_usage: 0.0,
            started_at: now,
            ready_at: None,
            tasks_completed: 0,
            tasks_failed: 0,
        }
    }

    /// Branch name for worker `id` under `prefix`, e.g. `hive/auth/worker-2`.
    pub fn branch_name(prefix: &str, feature: &str, id: WorkerId) -> String {
        format!("{}/{}/worker-{}", prefix.trim_end_matches('/'), feature, id)
    }

    pub fn set_context_usage(&mut self, usage: f64) {
        self.context_usage = usage.clamp(0.0, 1.0);
    }
}
