//! Worker governance.
//!
//! The `GovernanceService` reads heartbeats and decides which workers are
//! stalled. A worker is stalled when:
//! - it never wrote a heartbeat,
//! - its last heartbeat is older than the stale timeout, or
//! - its activity narrative has not changed for longer than
//!   `stall_multiplier × stale_timeout`, even while heartbeats stay fresh.
//!
//! Governance only detects and escalates. Moving work off a stalled worker
//! is the assignment layer's job; [`GovernanceService::perform_peer_reassignment`]
//! hands the stalled ids over.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::GovernanceConfig;
use crate::core::{TaskId, WorkerId};
use crate::error::Result;
use crate::orchestration::assignment::{Reassignment, WorkerAssignment};
use crate::orchestration::charter::CharterEnforcer;
use crate::orchestration::heartbeat::{
    Escalation, EscalationCategory, EscalationStore, Heartbeat, HeartbeatStore,
};
use crate::state::StateStore;

/// Decides whether two narratives describe the same activity.
pub trait NarrativeComparator: Send + Sync {
    fn same(&self, previous: &str, current: &str) -> bool;
}

/// Byte-for-byte equality.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactComparator;

impl NarrativeComparator for ExactComparator {
    fn same(&self, previous: &str, current: &str) -> bool {
        previous == current
    }
}

/// Ignores digits and whitespace runs, so "step 3 of 9" equals "step 4 of 9".
#[derive(Debug, Clone, Copy, Default)]
pub struct DigitInsensitiveComparator;

impl DigitInsensitiveComparator {
    fn normalize(text: &str) -> String {
        text.chars()
            .filter(|c| !c.is_ascii_digit())
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl NarrativeComparator for DigitInsensitiveComparator {
    fn same(&self, previous: &str, current: &str) -> bool {
        Self::normalize(previous) == Self::normalize(current)
    }
}

/// Why a worker was judged stalled.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StallReason {
    MissingHeartbeat,
    /// The heartbeat file exists but cannot be parsed.
    UnreadableHeartbeat { error: String },
    StaleHeartbeat { age_secs: u64 },
    CognitiveStall { unchanged_secs: u64 },
}

impl std::fmt::Display for StallReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StallReason::MissingHeartbeat => write!(f, "no heartbeat"),
            StallReason::UnreadableHeartbeat { error } => {
                write!(f, "unreadable heartbeat: {}", error)
            }
            StallReason::StaleHeartbeat { age_secs } => {
                write!(f, "heartbeat is {}s old", age_secs)
            }
            StallReason::CognitiveStall { unchanged_secs } => {
                write!(f, "narrative unchanged for {}s", unchanged_secs)
            }
        }
    }
}

/// One worker's line in a pulse report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerPulse {
    pub worker: WorkerId,
    pub task: Option<TaskId>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub narrative: Option<String>,
    pub stall: Option<StallReason>,
}

impl WorkerPulse {
    pub fn is_stalled(&self) -> bool {
        self.stall.is_some()
    }
}

/// First time the current narrative was seen.
#[derive(Debug, Clone)]
struct NarrativeTrack {
    narrative: String,
    since: DateTime<Utc>,
}

pub struct GovernanceService {
    heartbeats: HeartbeatStore,
    escalations: EscalationStore,
    config: GovernanceConfig,
    clock: Arc<dyn Clock>,
    comparator: Box<dyn NarrativeComparator>,
    charter: Option<CharterEnforcer>,
    tracks: Mutex<HashMap<WorkerId, NarrativeTrack>>,
    stalled: Mutex<HashSet<WorkerId>>,
}

impl GovernanceService {
    pub fn new(
        heartbeats: HeartbeatStore,
        escalations: EscalationStore,
        config: GovernanceConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let comparator: Box<dyn NarrativeComparator> = if config.digit_insensitive_narrative {
            Box::new(DigitInsensitiveComparator)
        } else {
            Box::new(ExactComparator)
        };
        Self {
            heartbeats,
            escalations,
            config,
            clock,
            comparator,
            charter: None,
            tracks: Mutex::new(HashMap::new()),
            stalled: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_comparator(mut self, comparator: Box<dyn NarrativeComparator>) -> Self {
        self.comparator = comparator;
        self
    }

    pub fn with_charter(mut self, charter: CharterEnforcer) -> Self {
        self.charter = Some(charter);
        self
    }

    /// Load the charter named in the config, if any.
    pub fn load_charter(self) -> Result<Self> {
        match self.config.charter_path.clone() {
            Some(path) => {
                let charter = CharterEnforcer::load(&path)?;
                Ok(self.with_charter(charter))
            }
            None => Ok(self),
        }
    }

    pub fn heartbeats(&self) -> &HeartbeatStore {
        &self.heartbeats
    }

    pub fn escalations(&self) -> &EscalationStore {
        &self.escalations
    }

    fn tracks(&self) -> MutexGuard<'_, HashMap<WorkerId, NarrativeTrack>> {
        self.tracks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stalled_set(&self) -> MutexGuard<'_, HashSet<WorkerId>> {
        self.stalled.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a heartbeat and return it as written.
    pub fn beat(&self, heartbeat: Heartbeat) -> Result<Heartbeat> {
        self.heartbeats.write(&heartbeat)?;
        Ok(heartbeat)
    }

    /// Judge one worker against its latest heartbeat.
    pub fn assess(&self, worker: WorkerId) -> WorkerPulse {
        let heartbeat = match self.heartbeats.read(worker) {
            Ok(Some(heartbeat)) => heartbeat,
            Ok(None) => return pulse(worker, None, Some(StallReason::MissingHeartbeat)),
            Err(e) => {
                warn!(worker = %worker, error = %e, "Heartbeat unreadable");
                return pulse(
                    worker,
                    None,
                    Some(StallReason::UnreadableHeartbeat {
                        error: e.to_string(),
                    }),
                );
            }
        };

        let age = elapsed(heartbeat.timestamp, self.clock.now());
        if age > self.config.stale_timeout() {
            let reason = StallReason::StaleHeartbeat {
                age_secs: age.as_secs(),
            };
            return pulse(worker, Some(&heartbeat), Some(reason));
        }

        let unchanged = self.observe_narrative(&heartbeat);
        let reason = (unchanged > self.config.narrative_stall_after()).then(|| {
            StallReason::CognitiveStall {
                unchanged_secs: unchanged.as_secs(),
            }
        });
        pulse(worker, Some(&heartbeat), reason)
    }

    /// How long the narrative has stayed the same, by heartbeat timestamps.
    fn observe_narrative(&self, heartbeat: &Heartbeat) -> Duration {
        let mut tracks = self.tracks();
        match tracks.get(&heartbeat.worker_id) {
            Some(track)
                if self
                    .comparator
                    .same(&track.narrative, &heartbeat.activity_narrative) =>
            {
                elapsed(track.since, heartbeat.timestamp)
            }
            _ => {
                tracks.insert(
                    heartbeat.worker_id,
                    NarrativeTrack {
                        narrative: heartbeat.activity_narrative.clone(),
                        since: heartbeat.timestamp,
                    },
                );
                Duration::ZERO
            }
        }
    }

    pub fn pulse_report(&self, workers: &[WorkerId]) -> Vec<WorkerPulse> {
        workers.iter().map(|w| self.assess(*w)).collect()
    }

    /// Stalled workers among `workers`. Each newly stalled worker gets a
    /// `stall` escalation; a worker that recovers may be escalated again
    /// if it stalls later.
    pub fn run_pulse_check(&self, workers: &[WorkerId]) -> Result<Vec<WorkerId>> {
        let report = self.pulse_report(workers);
        let mut stalled = Vec::new();
        for entry in report {
            let Some(reason) = &entry.stall else {
                self.stalled_set().remove(&entry.worker);
                continue;
            };
            stalled.push(entry.worker);
            let newly = self.stalled_set().insert(entry.worker);
            if newly {
                warn!(worker = %entry.worker, reason = %reason, "Worker stalled");
                self.escalations.append(
                    Escalation::new(
                        entry.worker,
                        EscalationCategory::Stall,
                        format!("Worker {} stalled: {}", entry.worker, reason),
                        self.clock.now(),
                    )
                    .with_task(entry.task.clone())
                    .with_context(json!({ "reason": reason })),
                )?;
            }
        }
        if !stalled.is_empty() {
            info!(count = stalled.len(), "Pulse check found stalled workers");
        }
        Ok(stalled)
    }

    /// Move planned work off `stalled` workers and record the moves.
    pub fn perform_peer_reassignment(
        &self,
        stalled: &[WorkerId],
        assignment: &mut WorkerAssignment,
        store: &StateStore,
    ) -> Result<Vec<Reassignment>> {
        if stalled.is_empty() {
            return Ok(Vec::new());
        }
        let doc = store.snapshot()?;
        let changes = assignment.reassign_from_workers(stalled, |task| {
            doc.tasks
                .get(task)
                .map(|t| t.status.is_terminal())
                .unwrap_or(true)
        });
        let applied = assignment.apply(store, &changes)?;
        info!(
            stalled = stalled.len(),
            moved = changes.len(),
            applied,
            "Peer reassignment"
        );
        Ok(changes)
    }

    /// Audit a completion summary against the charter. Violations are
    /// escalated; without a charter every summary complies.
    pub fn audit_completion(
        &self,
        worker: WorkerId,
        task: &TaskId,
        summary: &str,
    ) -> Result<(bool, String)> {
        let Some(charter) = &self.charter else {
            return Ok((true, "No charter loaded".to_string()));
        };
        let (compliant, reason) = charter.audit_completion(summary);
        if !compliant {
            warn!(worker = %worker, task = %task, reason = %reason, "Charter violation");
            self.escalations.append(
                Escalation::new(
                    worker,
                    EscalationCategory::Charter,
                    reason.clone(),
                    self.clock.now(),
                )
                .with_task(Some(task.clone())),
            )?;
        }
        Ok((compliant, reason))
    }
}

fn pulse(worker: WorkerId, heartbeat: Option<&Heartbeat>, stall: Option<StallReason>) -> WorkerPulse {
    WorkerPulse {
        worker,
        task: heartbeat.and_then(|h| h.task_id.clone()),
        last_heartbeat: heartbeat.map(|h| h.timestamp),
        narrative: heartbeat.map(|h| h.activity_narrative.clone()),
        stall,
    }
}

fn elapsed(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or(Duration::ZERO)
}
