//! Level, worker and run-wide operations on the state store.

use serde_json::json;
use tracing::{debug, info, warn};

use crate::core::{Level, LevelStatus, MergeRecord, MergeStatus, Worker, WorkerId, WorkerStatus};
use crate::error::{Error, Result};
use crate::state::store::StateStore;

impl StateStore {
    // ========== Levels ==========

    pub fn get_current_level(&self) -> Result<Option<u32>> {
        self.read(|doc| doc.current_level)
    }

    /// `None` disables level gating.
    pub fn set_current_level(&self, level: Option<u32>) -> Result<()> {
        self.transact(|doc, now| {
            if let Some(number) = level {
                doc.level(number)?;
            }
            let previous = doc.current_level;
            doc.current_level = level;
            doc.append_event(
                now,
                "current_level_changed",
                json!({"from": previous, "to": level}),
            );
            Ok(())
        })
    }

    pub fn get_level(&self, number: u32) -> Result<Level> {
        self.load()?.level(number).cloned()
    }

    pub fn levels(&self) -> Result<Vec<Level>> {
        self.read(|doc| doc.levels.values().cloned().collect())
    }

    /// Set a level's status, stamping start and completion times.
    pub fn set_level_status(&self, number: u32, status: LevelStatus) -> Result<Level> {
        self.transact(|doc, now| {
            let level = doc.level_mut(number)?;
            let from = level.status;
            level.status = status;
            match status {
                LevelStatus::Running if level.started_at.is_none() => {
                    level.started_at = Some(now)
                }
                LevelStatus::Complete => level.completed_at = Some(now),
                _ => {}
            }
            let updated = level.clone();
            doc.append_event(
                now,
                "level_status",
                json!({"level": number, "from": from, "to": status}),
            );
            info!(level = number, from = %from, to = %status, "Level status changed");
            Ok(updated)
        })
    }

    pub fn set_level_merge_status(&self, number: u32, status: MergeStatus) -> Result<Level> {
        self.transact(|doc, now| {
            let level = doc.level_mut(number)?;
            let from = level.merge_status;
            level.merge_status = status;
            let updated = level.clone();
            doc.append_event(
                now,
                "level_merge_status",
                json!({"level": number, "from": from, "to": status}),
            );
            debug!(level = number, from = %from, to = %status, "Merge status changed");
            Ok(updated)
        })
    }

    /// Append a merge attempt to the history and copy its outcome onto the level.
    pub fn record_merge(&self, record: MergeRecord) -> Result<()> {
        self.transact(|doc, now| {
            let level = doc.level_mut(record.level)?;
            if record.success {
                level.merge_commit = record.merge_commit.clone();
                level.conflicting_files.clear();
            } else {
                level.conflicting_files = record.conflicting_files.clone();
            }
            doc.append_event(
                now,
                "merge_recorded",
                json!({
                    "level": record.level,
                    "success": record.success,
                    "merge_commit": record.merge_commit,
                    "at_ship": record.at_ship,
                }),
            );
            doc.merge_history.push(record);
            Ok(())
        })
    }

    pub fn merge_history(&self) -> Result<Vec<MergeRecord>> {
        self.read(|doc| doc.merge_history.clone())
    }

    // ========== Run ==========

    pub fn append_event(&self, event: &str, data: serde_json::Value) -> Result<()> {
        self.transact(|doc, now| {
            doc.append_event(now, event, data);
            Ok(())
        })
    }

    /// Operator pause. Suspends new claims; running tasks continue.
    pub fn set_paused(&self, paused: bool) -> Result<()> {
        self.transact(|doc, now| {
            if doc.paused != paused {
                doc.paused = paused;
                doc.append_event(now, "paused_changed", json!({"paused": paused}));
                info!(paused, "Run pause toggled");
            }
            Ok(())
        })
    }

    pub fn is_paused(&self) -> Result<bool> {
        self.read(|doc| doc.paused)
    }

    pub fn set_error(&self, error: Option<String>) -> Result<()> {
        self.transact(|doc, now| {
            if let Some(message) = &error {
                warn!(error = %message, "Run error recorded");
                doc.append_event(now, "run_error", json!({"error": message}));
            }
            doc.error = error;
            Ok(())
        })
    }

    pub fn get_error(&self) -> Result<Option<String>> {
        self.read(|doc| doc.error.clone())
    }

    // ========== Workers ==========

    pub fn upsert_worker(&self, worker: Worker) -> Result<()> {
        self.transact(|doc, now| {
            let id = worker.worker_id;
            let existed = doc.workers.insert(id, worker).is_some();
            if !existed {
                doc.append_event(now, "worker_added", json!({"worker_id": id}));
            }
            Ok(())
        })
    }

    pub fn set_worker_status(&self, id: WorkerId, status: WorkerStatus) -> Result<Worker> {
        self.transact(|doc, now| {
            let worker = doc
                .workers
                .get_mut(&id)
                .ok_or(Error::WorkerNotFound { id })?;
            let from = worker.status;
            worker.status = status;
            if status == WorkerStatus::Ready && worker.ready_at.is_none() {
                worker.ready_at = Some(now);
            }
            let updated = worker.clone();
            if from != status {
                doc.append_event(
                    now,
                    "worker_status",
                    json!({"worker_id": id, "from": from, "to": status}),
                );
            }
            Ok(updated)
        })
    }

    /// Drop a worker record. A worker still holding a task cannot be removed.
    pub fn remove_worker(&self, id: WorkerId) -> Result<Worker> {
        self.transact(|doc, now| {
            let worker = doc.workers.get(&id).ok_or(Error::WorkerNotFound { id })?;
            if let Some(task) = &worker.current_task {
                return Err(Error::InvariantViolation(format!(
                    "worker {} still holds task {}",
                    id, task
                )));
            }
            let removed = doc.workers.remove(&id).ok_or(Error::WorkerNotFound { id })?;
            doc.append_event(now, "worker_removed", json!({"worker_id": id}));
            Ok(removed)
        })
    }

    pub fn get_worker(&self, id: WorkerId) -> Result<Worker> {
        self.load()?
            .workers
            .get(&id)
            .cloned()
            .ok_or(Error::WorkerNotFound { id })
    }

    pub fn workers(&self) -> Result<Vec<Worker>> {
        self.read(|doc| doc.workers.values().cloned().collect())
    }
}
