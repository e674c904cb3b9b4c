//! Orchestration layer for hive.
//!
//! The scheduler drives workers through the levels of a task graph:
//! claiming, executing and verifying tasks, retrying failures, and merging
//! each finished level before the next one starts. Governance watches
//! worker heartbeats for stalls and escalates them.

mod assignment;
mod backpressure;
mod charter;
mod health;
mod heartbeat;
mod level;
mod retry;
mod roles;
mod runtime;
mod scheduler;
mod verify;

pub use assignment::{Placement, Reassignment, WorkerAssignment};
pub use backpressure::{BackpressureController, LevelBackpressure};
pub use charter::CharterEnforcer;
pub use health::{
    DigitInsensitiveComparator, ExactComparator, GovernanceService, NarrativeComparator,
    StallReason, WorkerPulse,
};
pub use heartbeat::{Escalation, EscalationCategory, EscalationStore, Heartbeat, HeartbeatStore};
pub use level::{
    Advance, GateResult, GatedMerge, LevelCompletion, LevelCoordinator, MergeEngine, MergeResult,
    QualityGates, ShipReport,
};
pub use retry::RetryPolicy;
pub use roles::{extract_keywords, task_keywords, Role, RoleMatcher, Theme};
pub use runtime::{TaskOutcome, VerificationRuntime, WorkerRuntime};
pub use scheduler::{ClaimOutcome, HaltReason, RunSummary, Scheduler, SchedulerEvent};
pub use verify::{VerificationOutcome, VerificationRunner};
