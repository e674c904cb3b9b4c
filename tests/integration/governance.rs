//! Governance integration tests.
//!
//! Heartbeats written by the scheduler are read back by the governance
//! service; stalled workers are escalated and their planned work moves to
//! healthy peers.

use std::sync::Arc;
use std::time::Duration;

use hive::clock::{Clock, ManualClock, SystemClock};
use hive::config::{AssignmentConfig, GovernanceConfig};
use hive::core::WorkerId;
use hive::orchestration::{
    EscalationCategory, EscalationStore, GovernanceService, Heartbeat, HeartbeatStore,
    RoleMatcher, Scheduler, StallReason, WorkerAssignment,
};

use crate::fixtures::{
    id, memory_store, test_config, two_level_graph, MockMergeEngine, MockRuntime,
};

fn governance(dir: &std::path::Path, config: GovernanceConfig, clock: Arc<dyn Clock>) -> GovernanceService {
    GovernanceService::new(
        HeartbeatStore::new(dir.join("heartbeats")),
        EscalationStore::new(dir.join("escalations")),
        config,
        clock,
    )
}

/// Test: Scheduler heartbeats are visible to governance
/// Given a run with heartbeats enabled
/// When the run completes
/// Then every worker has a fresh heartbeat and nobody is stalled
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_run_heartbeats_keep_workers_healthy() {
    let dir = tempfile::tempdir().unwrap();
    let graph = two_level_graph();
    let store = memory_store(&graph);
    let scheduler = Scheduler::new(
        test_config(3),
        graph,
        store,
        Arc::new(MockRuntime::new()),
        MockMergeEngine::new(),
    )
    .with_heartbeats(HeartbeatStore::new(dir.path().join("heartbeats")));
    let summary = Arc::new(scheduler).run().await.unwrap();
    assert!(summary.is_success());

    let service = governance(dir.path(), GovernanceConfig::default(), Arc::new(SystemClock));
    let workers: Vec<_> = (0..3).map(WorkerId).collect();
    for pulse in service.pulse_report(&workers) {
        assert!(pulse.last_heartbeat.is_some(), "worker {} never beat", pulse.worker);
        assert!(!pulse.is_stalled(), "worker {} stalled: {:?}", pulse.worker, pulse.stall);
    }
    assert!(service.run_pulse_check(&workers).unwrap().is_empty());
}

/// Test: Stale worker escalation and peer reassignment
/// Given worker 0 stops beating while worker 1 keeps going
/// When the pulse check runs
/// Then worker 0 is escalated once and its planned tasks move to worker 1
#[test]
fn test_stalled_worker_work_moves_to_peer() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::default();
    let service = governance(dir.path(), GovernanceConfig::default(), Arc::new(clock.clone()));
    let workers = [WorkerId(0), WorkerId(1)];

    service
        .beat(Heartbeat::new(WorkerId(0), clock.now(), "Editing model").with_task(id("model")))
        .unwrap();
    clock.advance(Duration::from_secs(200));
    service
        .beat(Heartbeat::new(WorkerId(1), clock.now(), "Writing schema"))
        .unwrap();

    let stalled = service.run_pulse_check(&workers).unwrap();
    assert_eq!(stalled, vec![WorkerId(0)]);
    assert!(matches!(
        service.assess(WorkerId(0)).stall,
        Some(StallReason::StaleHeartbeat { age_secs: 200 })
    ));

    // Still stalled, but not escalated twice.
    service.run_pulse_check(&workers).unwrap();
    let escalations = service.escalations().list(WorkerId(0)).unwrap();
    assert_eq!(escalations.len(), 1);
    assert_eq!(escalations[0].category, EscalationCategory::Stall);
    assert_eq!(escalations[0].task_id, Some(id("model")));

    let graph = two_level_graph();
    let store = memory_store(&graph);
    let mut assignment = WorkerAssignment::new(
        2,
        AssignmentConfig {
            capacity_minutes: 120,
            ..Default::default()
        },
        RoleMatcher::default(),
    );
    assignment.assign(&graph);
    assignment.apply_plan(&store).unwrap();
    assert_eq!(assignment.worker_for(&id("model")), Some(WorkerId(0)));

    let moves = service
        .perform_peer_reassignment(&stalled, &mut assignment, &store)
        .unwrap();
    assert!(!moves.is_empty());
    assert!(moves.iter().all(|m| m.from == WorkerId(0) && m.to == WorkerId(1)));
    assert!(assignment.tasks_for(WorkerId(0)).is_empty());
    assert_eq!(
        store.get_task(&id("model")).unwrap().assigned_worker,
        Some(WorkerId(1))
    );

    // Recovery clears the stall.
    service
        .beat(Heartbeat::new(WorkerId(0), clock.now(), "Back online"))
        .unwrap();
    assert!(service.run_pulse_check(&workers).unwrap().is_empty());
    let unresolved = service.escalations().unresolved(WorkerId(0)).unwrap();
    service
        .escalations()
        .resolve(WorkerId(0), unresolved[0].id)
        .unwrap();
    assert!(service.escalations().unresolved(WorkerId(0)).unwrap().is_empty());
}

/// Test: Cognitive stall
/// Given a worker whose heartbeats are fresh but whose narrative never changes
/// When the narrative has been unchanged longer than the stall window
/// Then the worker is reported stalled
#[test]
fn test_unchanged_narrative_is_a_stall() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::default();
    let config = GovernanceConfig {
        stale_timeout_seconds: 60,
        stall_multiplier: 2.0,
        digit_insensitive_narrative: true,
        ..Default::default()
    };
    let service = governance(dir.path(), config, Arc::new(clock.clone()));

    for step in 1..=5 {
        service
            .beat(
                Heartbeat::new(WorkerId(2), clock.now(), &format!("Running tests, step {} of 9", step))
                    .with_steps(step, 9),
            )
            .unwrap();
        let pulse = service.assess(WorkerId(2));
        if step < 5 {
            assert!(!pulse.is_stalled(), "stalled early at step {}", step);
        } else {
            assert!(matches!(
                pulse.stall,
                Some(StallReason::CognitiveStall { unchanged_secs: 160 })
            ));
        }
        clock.advance(Duration::from_secs(40));
    }
}

/// Test: Charter audit escalates violations
#[test]
fn test_charter_audit_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let charter = dir.path().join("charter.md");
    std::fs::write(
        &charter,
        "# Charter\n\n## Core Principles\n\n- Every change ships with tests\n- Public APIs need documentation\n",
    )
    .unwrap();
    let config = GovernanceConfig {
        charter_path: Some(charter),
        ..Default::default()
    };
    let service = governance(dir.path(), config, Arc::new(SystemClock))
        .load_charter()
        .unwrap();

    let (ok, reason) = service
        .audit_completion(WorkerId(0), &id("routes"), "Added routes with tests and doc comments")
        .unwrap();
    assert!(ok, "{}", reason);

    let (ok, reason) = service
        .audit_completion(WorkerId(0), &id("routes"), "Added routes")
        .unwrap();
    assert!(!ok);
    assert!(reason.contains("tests"));
    let escalations = service.escalations().list(WorkerId(0)).unwrap();
    assert_eq!(escalations.len(), 1);
    assert_eq!(escalations[0].category, EscalationCategory::Charter);
}
