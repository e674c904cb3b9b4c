//! Level lifecycle: start, completion, merge and advancement.
//!
//! A level runs until every task is terminal. Completing it either defers
//! the merge to [`LevelCoordinator::ship`] or hands the workers' branches
//! to the [`MergeEngine`]. A conflict leaves the level running and halts
//! forward progress until [`LevelCoordinator::retry_merge`] succeeds.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::MergeConfig;
use crate::core::{Level, LevelStatus, MergeRecord, MergeStatus, TaskGraph, TaskStatus, Worker};
use crate::error::{Error, Result};
use crate::state::{StateDocument, StateStore};

/// Outcome reported by a [`MergeEngine`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeResult {
    pub success: bool,
    pub merge_commit: Option<String>,
    #[serde(default)]
    pub conflicting_files: Vec<String>,
    /// Files the merge touched, when the engine reports them.
    #[serde(default)]
    pub changed_files: Vec<String>,
}

impl MergeResult {
    pub fn merged(commit: impl Into<String>) -> Self {
        Self {
            success: true,
            merge_commit: Some(commit.into()),
            ..Default::default()
        }
    }

    pub fn conflict(files: Vec<String>) -> Self {
        Self {
            success: false,
            conflicting_files: files,
            ..Default::default()
        }
    }
}

/// Outcome reported by [`QualityGates`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub passed: bool,
    #[serde(default)]
    pub failures: Vec<String>,
}

/// Folds a level's worker branches into the target branch.
#[async_trait]
pub trait MergeEngine: Send + Sync {
    async fn full_merge_flow(
        &self,
        level: u32,
        source_branches: &[String],
        target_branch: &str,
        skip_gates: bool,
    ) -> Result<MergeResult>;
}

/// Post-merge checks such as lint, build and test.
#[async_trait]
pub trait QualityGates: Send + Sync {
    async fn run(&self, level: u32, changed_files: &[String]) -> Result<GateResult>;
}

/// Runs quality gates after an inner merge unless told to skip them.
///
/// A gate failure turns a clean merge into a failed one, with the gate
/// messages reported as the conflicting entries.
pub struct GatedMerge<M, G> {
    inner: M,
    gates: G,
}

impl<M, G> GatedMerge<M, G> {
    pub fn new(inner: M, gates: G) -> Self {
        Self { inner, gates }
    }
}

#[async_trait]
impl<M, G> MergeEngine for GatedMerge<M, G>
where
    M: MergeEngine,
    G: QualityGates,
{
    async fn full_merge_flow(
        &self,
        level: u32,
        source_branches: &[String],
        target_branch: &str,
        skip_gates: bool,
    ) -> Result<MergeResult> {
        let merged = self
            .inner
            .full_merge_flow(level, source_branches, target_branch, true)
            .await?;
        if !merged.success || skip_gates {
            return Ok(merged);
        }
        let gates = self.gates.run(level, &merged.changed_files).await?;
        if gates.passed {
            return Ok(merged);
        }
        warn!(level, failures = gates.failures.len(), "Quality gates failed");
        Ok(MergeResult {
            success: false,
            conflicting_files: gates.failures,
            ..merged
        })
    }
}

/// Result of [`LevelCoordinator::handle_level_complete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LevelCompletion {
    Merged { merge_commit: Option<String> },
    /// Marked complete with the merge left for `ship`.
    Deferred,
    Conflict { conflicting_files: Vec<String> },
    AlreadyComplete,
}

impl LevelCompletion {
    pub fn is_complete(&self) -> bool {
        !matches!(self, LevelCompletion::Conflict { .. })
    }
}

/// Result of [`LevelCoordinator::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    Started(u32),
    /// The current level is not complete yet.
    Blocked(u32),
    /// Every level is complete.
    Finished,
}

/// What [`LevelCoordinator::ship`] merged and where it stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShipReport {
    pub merged: Vec<u32>,
    pub conflict: Option<(u32, Vec<String>)>,
}

impl ShipReport {
    pub fn is_clean(&self) -> bool {
        self.conflict.is_none()
    }
}

pub struct LevelCoordinator {
    store: Arc<StateStore>,
    graph: Arc<TaskGraph>,
    merge: Arc<dyn MergeEngine>,
    config: MergeConfig,
    max_retries: u32,
}

impl LevelCoordinator {
    pub fn new(
        store: Arc<StateStore>,
        graph: Arc<TaskGraph>,
        merge: Arc<dyn MergeEngine>,
        config: MergeConfig,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            graph,
            merge,
            config,
            max_retries,
        }
    }

    pub fn start_level(&self, level: u32) -> Result<Level> {
        let started = self.store.set_level_status(level, LevelStatus::Running)?;
        self.store.set_current_level(Some(level))?;
        info!(level, name = %started.name, tasks = started.tasks.len(), "Level started");
        Ok(started)
    }

    /// Every task is complete, or failed with no retries left.
    pub fn is_level_done(&self, level: u32) -> Result<bool> {
        let doc = self.store.snapshot()?;
        doc.level(level)?;
        Ok(open_tasks(&doc, level, self.max_retries) == 0)
    }

    pub async fn handle_level_complete(&self, level: u32) -> Result<LevelCompletion> {
        let doc = self.store.snapshot()?;
        let record = doc.level(level)?;
        let open = open_tasks(&doc, level, self.max_retries);
        if open > 0 {
            return Err(Error::LevelNotReady {
                level,
                reason: format!("{} task(s) still open", open),
            });
        }
        if record.is_complete() {
            return Ok(LevelCompletion::AlreadyComplete);
        }
        if record.merge_status == MergeStatus::Conflict {
            return Ok(LevelCompletion::Conflict {
                conflicting_files: record.conflicting_files.clone(),
            });
        }

        if self.config.defer_merge_to_ship {
            self.store.set_level_status(level, LevelStatus::Complete)?;
            info!(level, "Level complete, merge deferred to ship");
            return Ok(LevelCompletion::Deferred);
        }
        self.merge_level(&doc, level, self.config.gates_at_ship_only, false)
            .await
    }

    /// Make the next level current once the current one is complete.
    pub fn advance(&self) -> Result<Advance> {
        let current = match self.store.get_current_level()? {
            Some(level) => level,
            None => {
                return match self.graph.first_level() {
                    Some(first) => {
                        self.start_level(first)?;
                        Ok(Advance::Started(first))
                    }
                    None => Ok(Advance::Finished),
                }
            }
        };
        if !self.store.get_level(current)?.is_complete() {
            return Ok(Advance::Blocked(current));
        }
        match self.graph.next_level(current) {
            Some(next) => {
                self.start_level(next)?;
                Ok(Advance::Started(next))
            }
            None => {
                info!(level = current, "Final level complete");
                Ok(Advance::Finished)
            }
        }
    }

    /// Merge a level again after its conflict was resolved by hand.
    pub async fn retry_merge(&self, level: u32) -> Result<LevelCompletion> {
        let doc = self.store.snapshot()?;
        let record = doc.level(level)?;
        if record.merge_status == MergeStatus::Complete {
            return Ok(LevelCompletion::AlreadyComplete);
        }
        if record.merge_status != MergeStatus::Conflict {
            return Err(Error::LevelNotReady {
                level,
                reason: format!("merge status is {}, not conflict", record.merge_status),
            });
        }
        info!(level, "Retrying merge");
        self.merge_level(&doc, level, self.config.gates_at_ship_only, false)
            .await
    }

    /// Merge every complete level whose merge is still pending, in order,
    /// with gates enabled. Stops at the first conflict.
    pub async fn ship(&self) -> Result<ShipReport> {
        let doc = self.store.snapshot()?;
        let mut report = ShipReport::default();
        for level in doc.levels.values() {
            if !level.is_complete() || level.merge_status == MergeStatus::Complete {
                continue;
            }
            match self.merge_level(&doc, level.number, false, true).await? {
                LevelCompletion::Conflict { conflicting_files } => {
                    report.conflict = Some((level.number, conflicting_files));
                    break;
                }
                _ => report.merged.push(level.number),
            }
        }
        info!(
            merged = report.merged.len(),
            clean = report.is_clean(),
            "Ship finished"
        );
        Ok(report)
    }

    async fn merge_level(
        &self,
        doc: &StateDocument,
        level: u32,
        skip_gates: bool,
        at_ship: bool,
    ) -> Result<LevelCompletion> {
        let branches = self.source_branches(doc, level);
        let target = self.config.target_branch.clone();
        let previous = self.store.get_level(level)?.merge_status;
        self.store.set_level_merge_status(level, MergeStatus::Merging)?;
        debug!(level, branches = branches.len(), skip_gates, "Invoking merge");

        let result = match self
            .merge
            .full_merge_flow(level, &branches, &target, skip_gates)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                warn!(level, error = %e, "Merge engine failed");
                self.store.set_level_merge_status(level, previous)?;
                return Err(e);
            }
        };

        let (created_files, modified_files) = level_files(doc, level);
        self.store.record_merge(MergeRecord {
            level,
            success: result.success,
            skip_gates,
            source_branches: branches,
            target_branch: target,
            merge_commit: result.merge_commit.clone(),
            created_files,
            modified_files,
            conflicting_files: result.conflicting_files.clone(),
            at_ship,
            timestamp: self.store.now(),
        })?;

        if !result.success {
            self.store.set_level_merge_status(level, MergeStatus::Conflict)?;
            self.store.set_error(Some(format!(
                "Level {} merge conflict: {}",
                level,
                result.conflicting_files.join(", ")
            )))?;
            warn!(
                level,
                files = ?result.conflicting_files,
                "Merge conflict, halting level advancement"
            );
            return Ok(LevelCompletion::Conflict {
                conflicting_files: result.conflicting_files,
            });
        }

        self.store.set_level_merge_status(level, MergeStatus::Complete)?;
        if !doc.level(level)?.is_complete() {
            self.store.set_level_status(level, LevelStatus::Complete)?;
        }
        if doc.error.is_some() {
            self.store.set_error(None)?;
        }
        self.store.append_event(
            "level_merged",
            json!({"level": level, "merge_commit": result.merge_commit, "at_ship": at_ship}),
        )?;
        info!(level, commit = ?result.merge_commit, "Level merged");
        Ok(LevelCompletion::Merged {
            merge_commit: result.merge_commit,
        })
    }

    /// Branches of the workers that completed tasks in `level`, by worker id.
    fn source_branches(&self, doc: &StateDocument, level: u32) -> Vec<String> {
        let workers: BTreeSet<_> = doc
            .level_tasks(level)
            .into_iter()
            .filter(|t| t.status == TaskStatus::Complete)
            .filter_map(|t| t.worker_id)
            .collect();
        workers
            .into_iter()
            .map(|id| match doc.workers.get(&id) {
                Some(worker) if !worker.branch.is_empty() => worker.branch.clone(),
                _ => Worker::branch_name(&self.config.branch_prefix, &doc.feature, id),
            })
            .collect()
    }
}

/// Tasks of `level` that are neither complete nor failed for good.
fn open_tasks(doc: &StateDocument, level: u32, max_retries: u32) -> usize {
    doc.level_tasks(level)
        .into_iter()
        .filter(|t| match t.status {
            TaskStatus::Complete => false,
            TaskStatus::Failed => t.retry_count < max_retries,
            _ => true,
        })
        .count()
}

/// Created and modified files of the level's completed tasks, in task order.
fn level_files(doc: &StateDocument, level: u32) -> (Vec<String>, Vec<String>) {
    let mut created = Vec::new();
    let mut modified = Vec::new();
    for task in doc.level_tasks(level) {
        if task.status == TaskStatus::Complete {
            created.extend(task.files.create.iter().cloned());
            modified.extend(task.files.modify.iter().cloned());
        }
    }
    (created, modified)
}
