use std::path::PathBuf;

use thiserror::Error;

use crate::core::{TaskId, TaskStatus, WorkerId};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("State document at {path} is corrupted: {reason}")]
    StateCorrupted { path: PathBuf, reason: String },

    #[error("State document at {path} has not been initialized")]
    StateNotInitialized { path: PathBuf },

    #[error("Task not found: {id}")]
    TaskNotFound { id: TaskId },

    #[error("Level not found: {level}")]
    LevelNotFound { level: u32 },

    #[error("Worker not found: {id}")]
    WorkerNotFound { id: WorkerId },

    #[error("Invalid transition for task {task} from {from} to {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Worker {worker} does not own task {task}")]
    NotOwner { task: TaskId, worker: WorkerId },

    #[error("Task {task} cannot be claimed: {reason}")]
    NotClaimable { task: TaskId, reason: String },

    #[error("Level {level} cannot start: {reason}")]
    LevelNotReady { level: u32, reason: String },

    #[error("Timed out acquiring state lock {path}")]
    LockTimeout { path: PathBuf },

    #[error("State lock poisoned")]
    LockPoisoned,

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Charter error: {0}")]
    Charter(String),

    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;
