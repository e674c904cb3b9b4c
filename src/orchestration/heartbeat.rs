//! Worker heartbeats and escalations.
//!
//! Both live in per-worker JSON files written with temp-then-rename, so
//! workers never contend with each other for a lock.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::core::{TaskId, WorkerId};
use crate::error::{Error, Result};
use crate::util::write_json_atomic;

/// Liveness and progress signal from a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Heartbeat {
    pub worker_id: WorkerId,
    pub timestamp: DateTime<Utc>,
    pub task_id: Option<TaskId>,
    /// Free-text description of what the worker is doing right now.
    pub activity_narrative: String,
    pub persona_name: Option<String>,
    pub current_step: Option<u32>,
    pub total_steps: Option<u32>,
}

impl Heartbeat {
    pub fn new(worker_id: WorkerId, timestamp: DateTime<Utc>, narrative: &str) -> Self {
        Self {
            worker_id,
            timestamp,
            task_id: None,
            activity_narrative: narrative.to_string(),
            persona_name: None,
            current_step: None,
            total_steps: None,
        }
    }

    pub fn with_task(mut self, task: TaskId) -> Self {
        self.task_id = Some(task);
        self
    }

    pub fn with_steps(mut self, current: u32, total: u32) -> Self {
        self.current_step = Some(current);
        self.total_steps = Some(total);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationCategory {
    Stall,
    Failure,
    Blocked,
    Charter,
    MergeConflict,
    Other,
}

impl std::fmt::Display for EscalationCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EscalationCategory::Stall => "stall",
            EscalationCategory::Failure => "failure",
            EscalationCategory::Blocked => "blocked",
            EscalationCategory::Charter => "charter",
            EscalationCategory::MergeConflict => "merge_conflict",
            EscalationCategory::Other => "other",
        };
        write!(f, "{}", s)
    }
}

/// An exception raised by a worker or by governance. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Escalation {
    pub id: Uuid,
    pub worker_id: WorkerId,
    pub task_id: Option<TaskId>,
    pub timestamp: DateTime<Utc>,
    pub category: EscalationCategory,
    pub message: String,
    #[serde(default)]
    pub context: serde_json::Value,
    #[serde(default)]
    pub resolved: bool,
}

impl Escalation {
    pub fn new(
        worker_id: WorkerId,
        category: EscalationCategory,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            worker_id,
            task_id: None,
            timestamp,
            category,
            message: message.into(),
            context: serde_json::Value::Null,
            resolved: false,
        }
    }

    pub fn with_task(mut self, task: Option<TaskId>) -> Self {
        self.task_id = task;
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

/// `heartbeat-<id>.json` per worker.
#[derive(Debug, Clone)]
pub struct HeartbeatStore {
    dir: PathBuf,
}

impl HeartbeatStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, worker: WorkerId) -> PathBuf {
        self.dir.join(format!("heartbeat-{}.json", worker))
    }

    pub fn write(&self, heartbeat: &Heartbeat) -> Result<()> {
        write_json_atomic(&self.path_for(heartbeat.worker_id), heartbeat)?;
        debug!(worker = %heartbeat.worker_id, "Heartbeat written");
        Ok(())
    }

    /// Latest heartbeat for `worker`, `None` if it never wrote one.
    pub fn read(&self, worker: WorkerId) -> Result<Option<Heartbeat>> {
        let path = self.path_for(worker);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn remove(&self, worker: WorkerId) -> Result<()> {
        match fs::remove_file(self.path_for(worker)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// `escalations-<id>.json` per worker, each holding the worker's full list.
#[derive(Debug, Clone)]
pub struct EscalationStore {
    dir: PathBuf,
}

impl EscalationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, worker: WorkerId) -> PathBuf {
        self.dir.join(format!("escalations-{}.json", worker))
    }

    pub fn append(&self, escalation: Escalation) -> Result<()> {
        let worker = escalation.worker_id;
        let mut all = self.list(worker)?;
        debug!(
            worker = %worker,
            category = %escalation.category,
            "Escalation recorded"
        );
        all.push(escalation);
        write_json_atomic(&self.path_for(worker), &all)
    }

    pub fn list(&self, worker: WorkerId) -> Result<Vec<Escalation>> {
        match fs::read_to_string(self.path_for(worker)) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn unresolved(&self, worker: WorkerId) -> Result<Vec<Escalation>> {
        Ok(self
            .list(worker)?
            .into_iter()
            .filter(|e| !e.resolved)
            .collect())
    }

    /// Mark one escalation resolved. The record itself is kept.
    pub fn resolve(&self, worker: WorkerId, id: Uuid) -> Result<()> {
        let mut all = self.list(worker)?;
        let entry = all
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| Error::Validation(format!("No escalation {} for worker {}", id, worker)))?;
        entry.resolved = true;
        write_json_atomic(&self.path_for(worker), &all)
    }
}
