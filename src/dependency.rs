//! Dependency gating.
//!
//! A task may start only when every declared dependency is `complete`.
//! Dependency lists come from the static graph; statuses come from the
//! state store and are read fresh on every call.

use std::sync::Arc;

use crate::core::{TaskGraph, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::state::{StateDocument, StateStore};

/// Dependencies of `deps` whose status is anything other than complete.
///
/// Dependencies with no known status count as incomplete.
pub fn incomplete_dependencies<F>(deps: &[TaskId], status_of: F) -> Vec<TaskId>
where
    F: Fn(&TaskId) -> Option<TaskStatus>,
{
    deps.iter()
        .filter(|dep| status_of(dep) != Some(TaskStatus::Complete))
        .cloned()
        .collect()
}

#[derive(Clone)]
pub struct DependencyChecker {
    graph: Arc<TaskGraph>,
    store: Arc<StateStore>,
}

impl DependencyChecker {
    pub fn new(graph: Arc<TaskGraph>, store: Arc<StateStore>) -> Self {
        Self { graph, store }
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn are_dependencies_complete(&self, task: &TaskId) -> Result<bool> {
        Ok(self.get_incomplete_dependencies(task)?.is_empty())
    }

    pub fn get_incomplete_dependencies(&self, task: &TaskId) -> Result<Vec<TaskId>> {
        let doc = self.store.snapshot()?;
        self.incomplete_in(&doc, task)
    }

    /// Evaluate against a document the caller already holds.
    ///
    /// Used inside a state transaction, where re-entering the store would
    /// deadlock.
    pub fn incomplete_in(&self, doc: &StateDocument, task: &TaskId) -> Result<Vec<TaskId>> {
        if !self.graph.contains_task(task) {
            return Err(Error::TaskNotFound { id: task.clone() });
        }
        Ok(incomplete_dependencies(
            self.graph.dependencies(task),
            |dep| doc.tasks.get(dep).map(|t| t.status),
        ))
    }
}

impl std::fmt::Debug for DependencyChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyChecker")
            .field("graph", &self.graph)
            .finish()
    }
}
