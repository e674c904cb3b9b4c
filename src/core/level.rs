//! Level records.
//!
//! A level groups tasks that may run in parallel. Levels execute in
//! ascending order and each one ends with a merge of its worker branches.

use crate::core::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Execution status of a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelStatus {
    Pending,
    Running,
    Complete,
}

impl Default for LevelStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for LevelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LevelStatus::Pending => "pending",
            LevelStatus::Running => "running",
            LevelStatus::Complete => "complete",
        };
        write!(f, "{}", s)
    }
}

/// Merge status of a level, orthogonal to [`LevelStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Pending,
    Merging,
    Rebasing,
    Validating,
    Complete,
    Conflict,
}

impl Default for MergeStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl MergeStatus {
    /// A merge is underway.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            MergeStatus::Merging | MergeStatus::Rebasing | MergeStatus::Validating
        )
    }
}

impl std::fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MergeStatus::Pending => "pending",
            MergeStatus::Merging => "merging",
            MergeStatus::Rebasing => "rebasing",
            MergeStatus::Validating => "validating",
            MergeStatus::Complete => "complete",
            MergeStatus::Conflict => "conflict",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Level {
    pub number: u32,
    pub name: String,
    /// Member tasks in graph order. Fixed at graph load.
    pub tasks: Vec<TaskId>,
    pub depends_on_levels: Vec<u32>,
    pub status: LevelStatus,
    pub merge_status: MergeStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub merge_commit: Option<String>,
    #[serde(default)]
    pub conflicting_files: Vec<String>,
}

impl Level {
    pub fn new(number: u32, name: impl Into<String>, tasks: Vec<TaskId>) -> Self {
        Self {
            number,
            name: name.into(),
            tasks,
            depends_on_levels: Vec::new(),
            status: LevelStatus::Pending,
            merge_status: MergeStatus::Pending,
            started_at: None,
            completed_at: None,
            merge_commit: None,
            conflicting_files: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == LevelStatus::Complete
    }
}

/// One attempt to merge a level's worker branches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeRecord {
    pub level: u32,
    pub success: bool,
    pub skip_gates: bool,
    pub source_branches: Vec<String>,
    pub target_branch: String,
    pub merge_commit: Option<String>,
    /// Files created by the level's tasks, in task order.
    pub created_files: Vec<String>,
    /// Files modified by the level's tasks, in task order.
    pub modified_files: Vec<String>,
    #[serde(default)]
    pub conflicting_files: Vec<String>,
    /// Merge performed by `ship` rather than at level completion.
    #[serde(default)]
    pub at_ship: bool,
    pub timestamp: DateTime<Utc>,
}
