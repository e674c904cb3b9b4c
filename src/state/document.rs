//! The persisted state document for one feature run.

use crate::core::{
    Level, LevelStatus, MergeRecord, Task, TaskGraph, TaskId, TaskStatus, Worker, WorkerId,
};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Format version written into every document.
pub const STATE_VERSION: u32 = 1;

/// Entry in the append-only execution log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionEvent {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Authoritative status of every task, level and worker in a run.
///
/// Only [`StateStore::transact`](super::StateStore::transact) hands out
/// mutable access; everything else works on snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateDocument {
    pub version: u32,
    pub feature: String,
    pub tasks: BTreeMap<TaskId, Task>,
    /// Task ids in graph order; claims walk this list.
    pub task_order: Vec<TaskId>,
    pub levels: BTreeMap<u32, Level>,
    #[serde(default)]
    pub workers: BTreeMap<WorkerId, Worker>,
    #[serde(default)]
    pub execution_log: Vec<ExecutionEvent>,
    #[serde(default)]
    pub merge_history: Vec<MergeRecord>,
    pub current_level: Option<u32>,
    #[serde(default)]
    pub paused: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StateDocument {
    /// Fresh document with every task pending and every level pending.
    pub fn from_graph(graph: &TaskGraph, now: DateTime<Utc>) -> Self {
        let tasks = graph
            .tasks()
            .iter()
            .map(|spec| (spec.id.clone(), Task::from_spec(spec, now)))
            .collect();
        let task_order = graph.tasks().iter().map(|spec| spec.id.clone()).collect();
        let levels = graph
            .levels()
            .map(|info| {
                let mut level = Level::new(info.number, info.name.clone(), info.tasks.clone());
                level.depends_on_levels = info.depends_on_levels.clone();
                (info.number, level)
            })
            .collect();

        Self {
            version: STATE_VERSION,
            feature: graph.feature().to_string(),
            tasks,
            task_order,
            levels,
            workers: BTreeMap::new(),
            execution_log: Vec::new(),
            merge_history: Vec::new(),
            current_level: None,
            paused: false,
            error: None,
            created_at: now,
        }
    }

    pub fn task(&self, id: &TaskId) -> Result<&Task> {
        self.tasks
            .get(id)
            .ok_or_else(|| Error::TaskNotFound { id: id.clone() })
    }

    pub fn task_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound { id: id.clone() })
    }

    pub fn level(&self, number: u32) -> Result<&Level> {
        self.levels
            .get(&number)
            .ok_or(Error::LevelNotFound { level: number })
    }

    pub fn level_mut(&mut self, number: u32) -> Result<&mut Level> {
        self.levels
            .get_mut(&number)
            .ok_or(Error::LevelNotFound { level: number })
    }

    /// Tasks in graph order.
    pub fn ordered_tasks(&self) -> impl Iterator<Item = &Task> {
        self.task_order.iter().filter_map(|id| self.tasks.get(id))
    }

    /// Tasks of one level in graph order.
    pub fn level_tasks(&self, number: u32) -> Vec<&Task> {
        self.ordered_tasks().filter(|t| t.level == number).collect()
    }

    pub fn tasks_with_status(&self, status: TaskStatus) -> Vec<&Task> {
        self.ordered_tasks().filter(|t| t.status == status).collect()
    }

    pub fn append_event(&mut self, now: DateTime<Utc>, event: &str, data: serde_json::Value) {
        self.execution_log.push(ExecutionEvent {
            timestamp: now,
            event: event.to_string(),
            data,
        });
    }

    /// Number of levels already complete.
    pub fn completed_levels(&self) -> usize {
        self.levels
            .values()
            .filter(|l| l.status == LevelStatus::Complete)
            .count()
    }

    /// Structural checks run on every load.
    pub fn check_consistency(&self) -> std::result::Result<(), String> {
        if self.version != STATE_VERSION {
            return Err(format!("unsupported version {}", self.version));
        }
        if self.task_order.len() != self.tasks.len() {
            return Err(format!(
                "task_order lists {} tasks but document holds {}",
                self.task_order.len(),
                self.tasks.len()
            ));
        }
        if let Some(missing) = self.task_order.iter().find(|id| !self.tasks.contains_key(*id)) {
            return Err(format!("task_order names unknown task {}", missing));
        }
        for level in self.levels.values() {
            if let Some(missing) = level.tasks.iter().find(|id| !self.tasks.contains_key(*id)) {
                return Err(format!("level {} names unknown task {}", level.number, missing));
            }
        }
        Ok(())
    }
}
