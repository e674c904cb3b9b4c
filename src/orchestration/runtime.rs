//! The seam between the scheduler and whatever executes a task.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::{Task, WorkerId};
use crate::error::Result;
use crate::orchestration::verify::VerificationRunner;

/// What a worker reports after running a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub success: bool,
    pub output: String,
    /// Verification time, when the runtime ran the task's verification.
    #[serde(default)]
    pub verification_ms: Option<u64>,
}

impl TaskOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            verification_ms: None,
        }
    }

    pub fn failure(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            verification_ms: None,
        }
    }
}

/// Executes tasks on behalf of a worker.
///
/// An `Err` means the runtime itself broke; a task that ran and failed is
/// an `Ok` outcome with `success == false`.
#[async_trait]
pub trait WorkerRuntime: Send + Sync {
    async fn invoke(&self, worker: WorkerId, task: &Task) -> Result<TaskOutcome>;
}

/// Runs each task's verification command in a per-worker directory.
///
/// Useful when the work itself happens elsewhere and only the check
/// needs to run here.
#[derive(Debug, Clone)]
pub struct VerificationRuntime {
    root: PathBuf,
    runner: VerificationRunner,
}

impl VerificationRuntime {
    /// Worker `N` runs in `root/worker-N` when that directory exists,
    /// otherwise in `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            runner: VerificationRunner,
        }
    }

    fn workdir(&self, worker: WorkerId) -> PathBuf {
        let dir = self.root.join(format!("worker-{}", worker));
        if dir.is_dir() {
            dir
        } else {
            self.root.clone()
        }
    }
}

#[async_trait]
impl WorkerRuntime for VerificationRuntime {
    async fn invoke(&self, worker: WorkerId, task: &Task) -> Result<TaskOutcome> {
        let outcome = self
            .runner
            .run(&task.verification, &self.workdir(worker))
            .await?;
        let output = match outcome.failure_reason() {
            Some(reason) if outcome.output.is_empty() => reason,
            Some(reason) => format!("{}\n{}", reason, outcome.output),
            None => outcome.output.clone(),
        };
        Ok(TaskOutcome {
            success: outcome.passed,
            output,
            verification_ms: Some(outcome.duration_ms()),
        })
    }
}
