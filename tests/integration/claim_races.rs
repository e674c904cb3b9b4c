//! Claim protocol integration tests.
//!
//! Many workers race for the same work; each task must end up with
//! exactly one owner, and claims must respect level and dependency gates.

use std::sync::{Arc, Barrier};
use std::thread;

use hive::core::{TaskStatus, WorkerId};
use hive::dependency::DependencyChecker;
use hive::state::{StateStore, StatusUpdate};
use hive::Error;

use crate::fixtures::{complete, file_store, id, memory_store, two_level_graph, wide_graph};

/// Race `workers` threads for one `claim_next_task` each against `store`.
fn race(store: Arc<StateStore>, workers: u32, level: Option<u32>) -> Vec<(WorkerId, String)> {
    let barrier = Arc::new(Barrier::new(workers as usize));
    let handles: Vec<_> = (0..workers)
        .map(|w| {
            let store = store.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                store
                    .claim_next_task(WorkerId(w), level, None)
                    .unwrap()
                    .map(|t| (WorkerId(w), t.id.to_string()))
            })
        })
        .collect();
    handles
        .into_iter()
        .filter_map(|h| h.join().unwrap())
        .collect()
}

/// Test: One task, many claimants
/// Given a single pending task
/// When eight workers claim at once
/// Then exactly one of them owns it
#[test]
fn test_single_task_claimed_exactly_once() {
    let store = memory_store(&wide_graph(1));
    let winners = race(store.clone(), 8, Some(1));

    assert_eq!(winners.len(), 1, "winners: {:?}", winners);
    let task = store.get_task(&id("t0")).unwrap();
    assert_eq!(task.status, TaskStatus::Claimed);
    assert_eq!(task.worker_id, Some(winners[0].0));
}

/// Test: Every task gets one owner
/// Given five tasks and eight workers
/// When all workers claim at once
/// Then five distinct tasks are claimed by five distinct workers
#[test]
fn test_concurrent_claims_never_share_a_task() {
    let store = memory_store(&wide_graph(5));
    let winners = race(store.clone(), 8, Some(1));

    assert_eq!(winners.len(), 5);
    let mut tasks: Vec<_> = winners.iter().map(|(_, t)| t.clone()).collect();
    tasks.sort();
    tasks.dedup();
    assert_eq!(tasks.len(), 5);
    assert!(store.check_ownership_invariant().unwrap().is_empty());
}

/// Test: Claims through separate file handles
/// Given one state file opened by several independent stores
/// When each claims from its own thread
/// Then the file lock still gives the task to exactly one worker
#[test]
fn test_file_backed_claim_is_exclusive() {
    let dir = tempfile::tempdir().unwrap();
    let graph = wide_graph(1);
    file_store(dir.path(), "wide").initialize(&graph).unwrap();

    let barrier = Arc::new(Barrier::new(6));
    let handles: Vec<_> = (0..6)
        .map(|w| {
            let path = dir.path().to_path_buf();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let store = file_store(&path, "wide");
                barrier.wait();
                store.claim_next_task(WorkerId(w), Some(1), None).unwrap()
            })
        })
        .collect();
    let claimed: Vec<_> = handles
        .into_iter()
        .filter_map(|h| h.join().unwrap())
        .collect();

    assert_eq!(claimed.len(), 1);
    let reloaded = file_store(dir.path(), "wide");
    let task = reloaded.get_task(&id("t0")).unwrap();
    assert_eq!(task.worker_id, claimed[0].worker_id);
    assert!(!dir.path().join("wide.json.lock").exists());
}

/// Test: Level gating
/// Given a two-level graph
/// When workers claim with level 1 current
/// Then no level 2 task is handed out
#[test]
fn test_claims_stay_within_current_level() {
    let store = memory_store(&two_level_graph());

    let first = store.claim_next_task(WorkerId(0), Some(1), None).unwrap().unwrap();
    let second = store.claim_next_task(WorkerId(1), Some(1), None).unwrap().unwrap();
    let third = store.claim_next_task(WorkerId(2), Some(1), None).unwrap();

    assert_eq!(first.id, id("model"));
    assert_eq!(second.id, id("schema"));
    assert!(third.is_none());
}

/// Test: Dependency gating
/// Given no level restriction
/// When a dependent's prerequisite is incomplete
/// Then the dependent is skipped until the prerequisite completes
#[test]
fn test_dependencies_gate_claims() {
    let graph = two_level_graph();
    let store = memory_store(&graph);
    let deps = DependencyChecker::new(graph.clone(), store.clone());

    complete(&store, "model", WorkerId(0));
    assert!(deps.are_dependencies_complete(&id("routes")).unwrap());
    assert_eq!(
        deps.get_incomplete_dependencies(&id("docs")).unwrap(),
        vec![id("schema")]
    );

    let claimed = store
        .claim_next_task(WorkerId(1), None, Some(&deps))
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, id("schema"));
    let claimed = store
        .claim_next_task(WorkerId(2), None, Some(&deps))
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, id("routes"));
    assert!(store
        .claim_next_task(WorkerId(3), None, Some(&deps))
        .unwrap()
        .is_none());
}

/// Test: Ownership is enforced
/// Given a task claimed by worker 0
/// When worker 1 tries to complete or release it
/// Then completion fails with NotOwner and release is ignored
#[test]
fn test_non_owner_cannot_touch_claimed_task() {
    let store = memory_store(&wide_graph(1));
    store.claim_task(&id("t0"), WorkerId(0)).unwrap().unwrap();

    let err = store
        .set_task_status(&id("t0"), TaskStatus::InProgress, StatusUpdate::by(WorkerId(1)))
        .unwrap_err();
    assert!(matches!(err, Error::NotOwner { .. }));
    assert!(!store.release_task(&id("t0"), WorkerId(1)).unwrap());
    assert!(store.claim_task(&id("t0"), WorkerId(1)).unwrap().is_none());

    assert!(store.release_task(&id("t0"), WorkerId(0)).unwrap());
    let task = store.claim_task(&id("t0"), WorkerId(1)).unwrap().unwrap();
    assert_eq!(task.worker_id, Some(WorkerId(1)));
}

/// Test: Paused runs hand out nothing
#[test]
fn test_paused_run_blocks_claims() {
    let store = memory_store(&wide_graph(2));
    store.set_paused(true).unwrap();
    assert!(store.claim_next_task(WorkerId(0), Some(1), None).unwrap().is_none());
    assert!(store.claim_task(&id("t1"), WorkerId(0)).unwrap().is_none());

    store.set_paused(false).unwrap();
    assert!(store.claim_next_task(WorkerId(0), Some(1), None).unwrap().is_some());
}

/// Test: Claiming by id honors the same gates
/// Given routes depends on model and lives in level 2
/// When a worker claims routes directly
/// Then it is refused while model is pending or level 1 is current, and
///      a direct status write to Claimed is rejected the same way
#[test]
fn test_claim_by_id_respects_gates() {
    let store = memory_store(&two_level_graph());
    let routes = id("routes");

    assert!(store.claim_task(&routes, WorkerId(0)).unwrap().is_none());
    let err = store
        .set_task_status(&routes, TaskStatus::Claimed, StatusUpdate::by(WorkerId(0)))
        .unwrap_err();
    assert!(matches!(err, Error::NotClaimable { .. }));

    store.set_current_level(Some(1)).unwrap();
    complete(&store, "model", WorkerId(1));
    assert!(store.claim_task(&routes, WorkerId(0)).unwrap().is_none());
    assert_eq!(store.get_task(&routes).unwrap().status, TaskStatus::Pending);

    store.set_current_level(Some(2)).unwrap();
    let task = store.claim_task(&routes, WorkerId(0)).unwrap().unwrap();
    assert_eq!(task.worker_id, Some(WorkerId(0)));
}
