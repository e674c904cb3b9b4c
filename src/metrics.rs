//! Run metrics computed from the state document.
//!
//! Everything here is read-only: durations come from the timestamps the
//! state store already records. A missing timestamp yields `None`.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::core::{Task, TaskId, TaskStatus, WorkerId};
use crate::error::Result;
use crate::state::{StateDocument, StateStore};
use crate::util::write_json_atomic;

/// Percentile `p` (0–100) of `values` with linear interpolation between
/// closest ranks. An empty slice gives 0.
pub fn calculate_percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        return sorted[lower];
    }
    let weight = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskMetrics {
    pub task_id: TaskId,
    pub level: u32,
    pub worker_id: Option<WorkerId>,
    pub status: TaskStatus,
    pub retry_count: u32,
    /// Created until claimed.
    pub queue_wait_ms: Option<u64>,
    /// Started until completed.
    pub execution_ms: Option<u64>,
    pub verification_ms: Option<u64>,
    /// Created until completed.
    pub total_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LevelMetrics {
    pub level: u32,
    pub name: String,
    pub task_count: usize,
    pub completed: usize,
    pub failed: usize,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub avg_ms: f64,
    /// Level start until level completion.
    pub wall_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerMetrics {
    pub worker_id: WorkerId,
    pub uptime_ms: Option<u64>,
    /// Started until ready.
    pub init_ms: Option<u64>,
    pub tasks_completed: u32,
    pub tasks_failed: u32,
    pub avg_task_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureMetrics {
    pub feature: String,
    pub computed_at: DateTime<Utc>,
    pub total_tasks: usize,
    pub completed: usize,
    pub failed: usize,
    pub levels_completed: usize,
    /// First task start until last task completion.
    pub wall_ms: Option<u64>,
    /// Sum of task execution times.
    pub total_task_ms: u64,
    pub worker_count: usize,
    /// `total_task_ms / (wall_ms × worker_count)`.
    pub parallel_efficiency: Option<f64>,
    pub tasks: Vec<TaskMetrics>,
    pub levels: Vec<LevelMetrics>,
    pub workers: Vec<WorkerMetrics>,
}

fn span_ms(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Option<u64> {
    let ms = (to? - from?).num_milliseconds();
    (ms >= 0).then_some(ms as u64)
}

pub fn task_metrics(task: &Task) -> TaskMetrics {
    TaskMetrics {
        task_id: task.id.clone(),
        level: task.level,
        worker_id: task.worker_id,
        status: task.status,
        retry_count: task.retry_count,
        queue_wait_ms: span_ms(Some(task.created_at), task.claimed_at),
        execution_ms: span_ms(task.started_at, task.completed_at),
        verification_ms: task.verification_ms,
        total_ms: span_ms(Some(task.created_at), task.completed_at),
    }
}

pub fn level_metrics(doc: &StateDocument, level: u32) -> Option<LevelMetrics> {
    let record = doc.levels.get(&level)?;
    let tasks = doc.level_tasks(level);
    let durations: Vec<f64> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Complete)
        .filter_map(|t| span_ms(t.started_at, t.completed_at))
        .map(|ms| ms as f64)
        .collect();
    let avg_ms = if durations.is_empty() {
        0.0
    } else {
        durations.iter().sum::<f64>() / durations.len() as f64
    };
    Some(LevelMetrics {
        level,
        name: record.name.clone(),
        task_count: tasks.len(),
        completed: tasks.iter().filter(|t| t.status == TaskStatus::Complete).count(),
        failed: tasks.iter().filter(|t| t.status == TaskStatus::Failed).count(),
        p50_ms: calculate_percentile(&durations, 50.0),
        p95_ms: calculate_percentile(&durations, 95.0),
        avg_ms,
        wall_ms: span_ms(record.started_at, record.completed_at),
    })
}

pub fn worker_metrics(doc: &StateDocument, now: DateTime<Utc>) -> Vec<WorkerMetrics> {
    doc.workers
        .values()
        .map(|worker| {
            let durations: Vec<u64> = doc
                .ordered_tasks()
                .filter(|t| t.worker_id == Some(worker.worker_id))
                .filter_map(|t| span_ms(t.started_at, t.completed_at))
                .collect();
            let avg_task_ms = (!durations.is_empty())
                .then(|| durations.iter().sum::<u64>() as f64 / durations.len() as f64);
            WorkerMetrics {
                worker_id: worker.worker_id,
                uptime_ms: span_ms(Some(worker.started_at), Some(now)),
                init_ms: span_ms(Some(worker.started_at), worker.ready_at),
                tasks_completed: worker.tasks_completed,
                tasks_failed: worker.tasks_failed,
                avg_task_ms,
            }
        })
        .collect()
}

pub fn feature_metrics(doc: &StateDocument, now: DateTime<Utc>) -> FeatureMetrics {
    let tasks: Vec<TaskMetrics> = doc.ordered_tasks().map(task_metrics).collect();
    let levels: Vec<LevelMetrics> = doc
        .levels
        .keys()
        .filter_map(|level| level_metrics(doc, *level))
        .collect();
    let workers = worker_metrics(doc, now);

    let first_start = doc.ordered_tasks().filter_map(|t| t.started_at).min();
    let last_completion = doc.ordered_tasks().filter_map(|t| t.completed_at).max();
    let wall_ms = span_ms(first_start, last_completion);
    let total_task_ms: u64 = tasks.iter().filter_map(|t| t.execution_ms).sum();
    let worker_count = doc.workers.len();
    let parallel_efficiency = match wall_ms {
        Some(wall) if wall > 0 && worker_count > 0 => {
            Some(total_task_ms as f64 / (wall as f64 * worker_count as f64))
        }
        _ => None,
    };

    FeatureMetrics {
        feature: doc.feature.clone(),
        computed_at: now,
        total_tasks: tasks.len(),
        completed: tasks.iter().filter(|t| t.status == TaskStatus::Complete).count(),
        failed: tasks.iter().filter(|t| t.status == TaskStatus::Failed).count(),
        levels_completed: doc.completed_levels(),
        wall_ms,
        total_task_ms,
        worker_count,
        parallel_efficiency,
        tasks,
        levels,
        workers,
    }
}

/// Reads the store and computes metrics on demand.
pub struct MetricsCollector {
    store: Arc<StateStore>,
}

impl MetricsCollector {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    pub fn collect(&self) -> Result<FeatureMetrics> {
        let doc = self.store.snapshot()?;
        Ok(feature_metrics(&doc, self.store.now()))
    }

    /// Write the rollup as JSON, replacing `path` atomically.
    pub fn export(&self, path: &Path) -> Result<FeatureMetrics> {
        let metrics = self.collect()?;
        write_json_atomic(path, &metrics)?;
        info!(path = %path.display(), tasks = metrics.total_tasks, "Metrics exported");
        Ok(metrics)
    }
}
