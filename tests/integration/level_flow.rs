//! Level completion and merge policy integration tests.

use std::sync::Arc;

use async_trait::async_trait;

use hive::config::{AssignmentConfig, MergeConfig};
use hive::core::{LevelStatus, MergeStatus, TaskStatus, WorkerId};
use hive::orchestration::{
    Advance, GateResult, GatedMerge, LevelCompletion, LevelCoordinator, MergeEngine,
    QualityGates, RoleMatcher, WorkerAssignment,
};
use hive::state::{StateStore, StatusUpdate};
use hive::Error;

use crate::fixtures::{complete, id, memory_store, two_level_graph, MockMergeEngine};

fn coordinator(config: MergeConfig) -> (Arc<StateStore>, Arc<MockMergeEngine>, LevelCoordinator) {
    let graph = two_level_graph();
    let store = memory_store(&graph);
    let merge = MockMergeEngine::new();
    let coordinator = LevelCoordinator::new(store.clone(), graph, merge.clone(), config, 2);
    (store, merge, coordinator)
}

fn finish_level_one(store: &StateStore) {
    complete(store, "model", WorkerId(0));
    complete(store, "schema", WorkerId(1));
}

/// Test: Immediate merge
/// Given merges are not deferred
/// When level 1 finishes
/// Then the engine merges it with gates and the record lists its files
#[tokio::test]
async fn test_level_merges_when_complete() {
    let (store, merge, coordinator) = coordinator(MergeConfig::default());
    assert_eq!(coordinator.advance().unwrap(), Advance::Started(1));
    finish_level_one(&store);

    assert!(coordinator.is_level_done(1).unwrap());
    let outcome = coordinator.handle_level_complete(1).await.unwrap();
    assert_eq!(
        outcome,
        LevelCompletion::Merged {
            merge_commit: Some("commit-level-1".into())
        }
    );

    let calls = merge.calls();
    assert_eq!(calls.len(), 1);
    assert!(!calls[0].skip_gates);
    assert_eq!(calls[0].target, "main");
    assert_eq!(
        calls[0].branches,
        vec!["hive/auth/worker-0".to_string(), "hive/auth/worker-1".to_string()]
    );

    let level = store.get_level(1).unwrap();
    assert_eq!(level.status, LevelStatus::Complete);
    assert_eq!(level.merge_status, MergeStatus::Complete);

    let history = store.merge_history().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(
        history[0].created_files,
        vec!["src/model.rs".to_string(), "migrations/001.sql".to_string()]
    );
    assert!(!history[0].at_ship);

    assert_eq!(coordinator.advance().unwrap(), Advance::Started(2));
    assert_eq!(store.get_current_level().unwrap(), Some(2));
}

/// Test: Gates deferred to ship
/// Given gates run only at ship
/// When a level merges during the run
/// Then the engine is told to skip gates
#[tokio::test]
async fn test_gates_skipped_until_ship() {
    let (store, merge, coordinator) = coordinator(MergeConfig {
        gates_at_ship_only: true,
        ..Default::default()
    });
    coordinator.advance().unwrap();
    finish_level_one(&store);

    coordinator.handle_level_complete(1).await.unwrap();
    assert!(merge.calls()[0].skip_gates);
    assert!(store.merge_history().unwrap()[0].skip_gates);
}

/// Test: Deferred merge and ship
/// Given merges are deferred to ship
/// When both levels finish
/// Then nothing merges until ship, which merges both in order with gates
#[tokio::test]
async fn test_deferred_merges_happen_at_ship() {
    let (store, merge, coordinator) = coordinator(MergeConfig {
        defer_merge_to_ship: true,
        ..Default::default()
    });
    coordinator.advance().unwrap();
    finish_level_one(&store);

    assert_eq!(
        coordinator.handle_level_complete(1).await.unwrap(),
        LevelCompletion::Deferred
    );
    let level = store.get_level(1).unwrap();
    assert_eq!(level.status, LevelStatus::Complete);
    assert_eq!(level.merge_status, MergeStatus::Pending);
    assert!(merge.calls().is_empty());

    assert_eq!(coordinator.advance().unwrap(), Advance::Started(2));
    complete(&store, "routes", WorkerId(2));
    complete(&store, "docs", WorkerId(0));
    coordinator.handle_level_complete(2).await.unwrap();
    assert_eq!(coordinator.advance().unwrap(), Advance::Finished);

    let report = coordinator.ship().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.merged, vec![1, 2]);
    let calls = merge.calls();
    assert_eq!(calls.iter().map(|c| c.level).collect::<Vec<_>>(), vec![1, 2]);
    assert!(calls.iter().all(|c| !c.skip_gates));
    assert!(store.merge_history().unwrap().iter().all(|r| r.at_ship));

    // Nothing left to ship.
    assert!(coordinator.ship().await.unwrap().merged.is_empty());
}

/// Test: Conflict then manual retry
/// Given the first merge of level 1 conflicts
/// When the level completes
/// Then advancement stops and the run error names the files,
/// and retry_merge clears it once the conflict is resolved
#[tokio::test]
async fn test_conflict_blocks_advance_until_retry() {
    let (store, merge, coordinator) = coordinator(MergeConfig::default());
    merge.conflict_once(1, &["src/lib.rs"]);
    coordinator.advance().unwrap();
    finish_level_one(&store);

    let outcome = coordinator.handle_level_complete(1).await.unwrap();
    assert_eq!(
        outcome,
        LevelCompletion::Conflict {
            conflicting_files: vec!["src/lib.rs".into()]
        }
    );
    assert_eq!(store.get_level(1).unwrap().merge_status, MergeStatus::Conflict);
    assert!(store.get_error().unwrap().unwrap().contains("src/lib.rs"));
    assert_eq!(coordinator.advance().unwrap(), Advance::Blocked(1));

    // Completing again does not re-invoke the engine.
    assert!(!coordinator.handle_level_complete(1).await.unwrap().is_complete());
    assert_eq!(merge.calls().len(), 1);

    let retried = coordinator.retry_merge(1).await.unwrap();
    assert!(retried.is_complete());
    assert_eq!(store.get_error().unwrap(), None);
    assert_eq!(coordinator.advance().unwrap(), Advance::Started(2));
    assert_eq!(store.merge_history().unwrap().len(), 2);
}

/// Test: Premature completion
/// Given a level with an unfinished task
/// When completion is requested
/// Then it fails with LevelNotReady
#[tokio::test]
async fn test_level_not_ready_while_tasks_open() {
    let (store, merge, coordinator) = coordinator(MergeConfig::default());
    coordinator.advance().unwrap();
    complete(&store, "model", WorkerId(0));

    assert!(!coordinator.is_level_done(1).unwrap());
    let err = coordinator.handle_level_complete(1).await.unwrap_err();
    assert!(matches!(err, Error::LevelNotReady { level: 1, .. }));
    assert!(merge.calls().is_empty());
}

/// Test: Exhausted failures close a level
/// Given a task failed with no retries left
/// When the rest of the level completes
/// Then the level is done and merges without it
#[tokio::test]
async fn test_exhausted_failure_counts_as_done() {
    let (store, _merge, coordinator) = coordinator(MergeConfig::default());
    coordinator.advance().unwrap();
    complete(&store, "model", WorkerId(0));

    let schema = id("schema");
    for attempt in 0..3 {
        store.claim_task(&schema, WorkerId(1)).unwrap().unwrap();
        store
            .set_task_status(&schema, TaskStatus::InProgress, StatusUpdate::by(WorkerId(1)))
            .unwrap();
        store
            .set_task_status(
                &schema,
                TaskStatus::Failed,
                StatusUpdate::by(WorkerId(1)).with_error("tests failed"),
            )
            .unwrap();
        if attempt < 2 {
            assert!(!coordinator.is_level_done(1).unwrap());
            store.increment_task_retry(&schema, Some(store.now())).unwrap();
            store.requeue_task(&schema).unwrap();
        }
    }
    assert_eq!(store.get_task(&schema).unwrap().retry_count, 2);
    assert!(coordinator.is_level_done(1).unwrap());

    coordinator.handle_level_complete(1).await.unwrap();
    let record = &store.merge_history().unwrap()[0];
    assert_eq!(record.created_files, vec!["src/model.rs".to_string()]);
    assert_eq!(record.source_branches, vec!["hive/auth/worker-0".to_string()]);
}

struct FailingGates;

#[async_trait]
impl QualityGates for FailingGates {
    async fn run(&self, _level: u32, _changed: &[String]) -> hive::Result<GateResult> {
        Ok(GateResult {
            passed: false,
            failures: vec!["lint: unused import".into()],
        })
    }
}

/// Test: Gate failures surface as conflicts
#[tokio::test]
async fn test_gated_merge_reports_gate_failures() {
    let gated = GatedMerge::new(MockMergeEngine::default(), FailingGates);
    let branches = vec!["hive/auth/worker-0".to_string()];

    let result = gated.full_merge_flow(1, &branches, "main", false).await.unwrap();
    assert!(!result.success);
    assert_eq!(result.conflicting_files, vec!["lint: unused import".to_string()]);

    let skipped = gated.full_merge_flow(1, &branches, "main", true).await.unwrap();
    assert!(skipped.success);
}

/// Test: Rebalancing failed work
/// Given a plan across three workers
/// When a planned task fails on its worker
/// Then it moves to the worker with the most spare capacity
#[test]
fn test_rebalance_moves_failed_task() {
    let graph = two_level_graph();
    let store = memory_store(&graph);
    let mut assignment = WorkerAssignment::new(
        3,
        AssignmentConfig {
            capacity_minutes: 60,
            ..Default::default()
        },
        RoleMatcher::default(),
    );
    let placements = assignment.assign(&graph);
    assert_eq!(placements.len(), 4);
    assignment.apply_plan(&store).unwrap();

    let routes = id("routes");
    let before = assignment.worker_for(&routes).unwrap();
    assert_eq!(store.get_task(&routes).unwrap().assigned_worker, Some(before));

    let moves = assignment.rebalance(&[routes.clone()], |_| false);
    assert_eq!(moves.len(), 1);
    assert_eq!(moves[0].from, before);
    assert_ne!(moves[0].to, before);
    assignment.apply(&store, &moves).unwrap();
    assert_eq!(
        store.get_task(&routes).unwrap().assigned_worker,
        Some(moves[0].to)
    );
}
