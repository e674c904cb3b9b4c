//! Core domain models for hive orchestration.
//!
//! Tasks, levels and workers, plus the validated task graph they are
//! created from.

pub mod graph;
pub mod level;
pub mod task;
pub mod worker;

pub use graph::{GraphDocument, LevelInfo, LevelSpec, TaskGraph};
pub use level::{Level, LevelStatus, MergeRecord, MergeStatus};
pub use task::{Task, TaskFiles, TaskId, TaskSpec, TaskStatus, Verification};
pub use worker::{Worker, WorkerId, WorkerStatus};
