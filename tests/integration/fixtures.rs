//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Task graphs of known shape
//! - A scripted worker runtime
//! - A merge engine that records every call

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use hive::config::{HiveConfig, RetryConfig, StateConfig, WorkersConfig};
use hive::core::{Task, TaskGraph, TaskId, TaskStatus, WorkerId};
use hive::orchestration::{MergeEngine, MergeResult, TaskOutcome, WorkerRuntime};
use hive::state::{FileBackend, StateStore, StatusUpdate};

// ========== Graphs ==========

/// Two levels of two tasks each:
/// level 1 `model`, `schema`; level 2 `routes` (needs `model`) and
/// `docs` (needs `schema`).
pub fn two_level_graph() -> Arc<TaskGraph> {
    let json = json!({
        "feature": "auth",
        "levels": [
            {"number": 1, "name": "foundation"},
            {"number": 2, "name": "surface"}
        ],
        "tasks": [
            {"id": "model", "title": "User model", "level": 1, "estimate_minutes": 30,
             "files": {"create": ["src/model.rs"]},
             "verification": {"command": "true"}},
            {"id": "schema", "title": "Database schema", "level": 1, "estimate_minutes": 20,
             "files": {"create": ["migrations/001.sql"]},
             "verification": {"command": "true"}},
            {"id": "routes", "title": "Auth routes", "level": 2, "estimate_minutes": 40,
             "dependencies": ["model"],
             "files": {"create": ["src/routes.rs"], "modify": ["src/lib.rs"]},
             "verification": {"command": "true"}},
            {"id": "docs", "title": "API docs", "level": 2, "estimate_minutes": 10,
             "dependencies": ["schema"],
             "files": {"create": ["docs/auth.md"]},
             "verification": {"command": "true"}}
        ]
    });
    Arc::new(TaskGraph::from_json(&json.to_string()).expect("valid graph"))
}

/// One level holding `count` independent tasks `t0..tN`.
pub fn wide_graph(count: usize) -> Arc<TaskGraph> {
    let tasks: Vec<_> = (0..count)
        .map(|i| {
            json!({
                "id": format!("t{}", i),
                "title": format!("Task {}", i),
                "level": 1,
                "verification": {"command": "true"}
            })
        })
        .collect();
    let json = json!({"feature": "wide", "tasks": tasks});
    Arc::new(TaskGraph::from_json(&json.to_string()).expect("valid graph"))
}

pub fn id(s: &str) -> TaskId {
    TaskId::new(s)
}

// ========== Config ==========

/// Fast polling and no retry backoff.
pub fn test_config(workers: u32) -> HiveConfig {
    HiveConfig {
        workers: WorkersConfig {
            count: workers,
            poll_interval_ms: 5,
            max_wait_seconds: 5,
        },
        retry: RetryConfig {
            max_retries: 2,
            base_backoff_seconds: 0,
            max_backoff_seconds: 0,
        },
        ..Default::default()
    }
}

// ========== Stores ==========

pub fn memory_store(graph: &TaskGraph) -> Arc<StateStore> {
    let store = Arc::new(StateStore::in_memory());
    store.initialize(graph).expect("initialize");
    store
}

/// A store over `<dir>/<feature>.json`. Several of these on one directory
/// behave like separate processes sharing the file.
pub fn file_store(dir: &Path, feature: &str) -> StateStore {
    let backend = FileBackend::new(dir, feature, &StateConfig::default()).expect("backend");
    StateStore::new(Arc::new(backend))
}

/// Drive a task through claim, start and completion as `worker`.
pub fn complete(store: &StateStore, task: &str, worker: WorkerId) {
    let task = id(task);
    store
        .claim_task(&task, worker)
        .expect("claim")
        .expect("task claimable");
    store
        .set_task_status(&task, TaskStatus::InProgress, StatusUpdate::by(worker))
        .expect("start");
    store
        .set_task_status(&task, TaskStatus::Complete, StatusUpdate::by(worker))
        .expect("complete");
}

// ========== Runtime ==========

/// Succeeds unless a task has scripted failures left.
#[derive(Default)]
pub struct MockRuntime {
    failures: Mutex<HashMap<TaskId, usize>>,
    delay: Duration,
    invocations: Mutex<Vec<(WorkerId, TaskId)>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, task: &str, times: usize) -> Self {
        self.failures.get_mut().expect("lock").insert(id(task), times);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn invocations(&self) -> Vec<(WorkerId, TaskId)> {
        self.invocations.lock().expect("lock").clone()
    }

    pub fn workers_used(&self) -> HashSet<WorkerId> {
        self.invocations().into_iter().map(|(w, _)| w).collect()
    }
}

#[async_trait]
impl WorkerRuntime for MockRuntime {
    async fn invoke(&self, worker: WorkerId, task: &Task) -> hive::Result<TaskOutcome> {
        self.invocations
            .lock()
            .expect("lock")
            .push((worker, task.id.clone()));
        if self.delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.delay).await;
        }
        let mut failures = self.failures.lock().expect("lock");
        match failures.get_mut(&task.id) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Ok(TaskOutcome::failure("verification exited with code 1"))
            }
            _ => Ok(TaskOutcome::success(format!("{} done", task.id))),
        }
    }
}

// ========== Merge ==========

#[derive(Debug, Clone, PartialEq)]
pub struct MergeCall {
    pub level: u32,
    pub branches: Vec<String>,
    pub target: String,
    pub skip_gates: bool,
}

/// Merges cleanly unless a conflict is queued for the level.
#[derive(Default)]
pub struct MockMergeEngine {
    calls: Mutex<Vec<MergeCall>>,
    conflicts: Mutex<HashMap<u32, Vec<String>>>,
}

impl MockMergeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next merge of `level` conflicts on `files`.
    pub fn conflict_once(&self, level: u32, files: &[&str]) {
        self.conflicts
            .lock()
            .expect("lock")
            .insert(level, files.iter().map(|f| f.to_string()).collect());
    }

    pub fn calls(&self) -> Vec<MergeCall> {
        self.calls.lock().expect("lock").clone()
    }
}

#[async_trait]
impl MergeEngine for MockMergeEngine {
    async fn full_merge_flow(
        &self,
        level: u32,
        branches: &[String],
        target: &str,
        skip_gates: bool,
    ) -> hive::Result<MergeResult> {
        self.calls.lock().expect("lock").push(MergeCall {
            level,
            branches: branches.to_vec(),
            target: target.to_string(),
            skip_gates,
        });
        match self.conflicts.lock().expect("lock").remove(&level) {
            Some(files) => Ok(MergeResult::conflict(files)),
            None => Ok(MergeResult::merged(format!("commit-level-{}", level))),
        }
    }
}
