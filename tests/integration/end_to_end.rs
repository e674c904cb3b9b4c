//! Full scheduler runs.
//!
//! Each test builds a scheduler over a mock runtime and merge engine and
//! checks the persisted state after the run halts.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;

use hive::core::{LevelStatus, MergeStatus, TaskStatus, WorkerId, WorkerStatus};
use hive::metrics::MetricsCollector;
use hive::orchestration::{HaltReason, Scheduler, SchedulerEvent, VerificationRuntime};
use hive::state::StateStore;

use crate::fixtures::{
    file_store, id, memory_store, test_config, two_level_graph, wide_graph, MockMergeEngine,
    MockRuntime,
};

fn drain(rx: &mut mpsc::Receiver<SchedulerEvent>) -> Vec<SchedulerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Test: Full two-level run
/// Given five workers and a two-level graph of four tasks
/// When the scheduler runs to completion
/// Then every task completes, both levels merge in order,
/// and each merge record lists exactly that level's created files
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_five_workers_complete_two_levels() {
    let graph = two_level_graph();
    let store = memory_store(&graph);
    let runtime = Arc::new(MockRuntime::new());
    let merge = MockMergeEngine::new();
    let (tx, mut rx) = mpsc::channel(1024);

    let scheduler = Scheduler::new(
        test_config(5),
        graph,
        store.clone(),
        runtime.clone(),
        merge.clone(),
    )
    .with_events(tx);
    let summary = Arc::new(scheduler).run().await.unwrap();

    assert_eq!(summary.halt, HaltReason::Complete);
    assert!(summary.is_success());
    assert_eq!(summary.completed_tasks.len(), 4);
    assert_eq!(summary.completed_levels, 2);
    assert_eq!(runtime.invocations().len(), 4);

    let levels: Vec<u32> = merge.calls().iter().map(|c| c.level).collect();
    assert_eq!(levels, vec![1, 2]);
    let records = &summary.merge_records;
    assert_eq!(records.len(), 2);
    let created = |i: usize| records[i].created_files.iter().cloned().collect::<BTreeSet<_>>();
    assert_eq!(
        created(0),
        BTreeSet::from(["src/model.rs", "migrations/001.sql"].map(String::from))
    );
    assert_eq!(
        created(1),
        BTreeSet::from(["src/routes.rs", "docs/auth.md"].map(String::from))
    );
    assert_eq!(records[1].modified_files, vec!["src/lib.rs".to_string()]);
    assert!(records.iter().all(|r| r.success && r.target_branch == "main"));

    for level in store.levels().unwrap() {
        assert_eq!(level.status, LevelStatus::Complete);
        assert_eq!(level.merge_status, MergeStatus::Complete);
    }
    for worker in store.workers().unwrap() {
        assert_eq!(worker.status, WorkerStatus::Stopped);
        assert!(worker.current_task.is_none());
    }
    assert!(store.check_ownership_invariant().unwrap().is_empty());

    // No level 2 work starts before level 1 has merged.
    let events = drain(&mut rx);
    let merged_1 = events
        .iter()
        .position(|e| matches!(e, SchedulerEvent::LevelCompleted { level: 1, .. }))
        .unwrap();
    assert!(events.contains(&SchedulerEvent::LevelStarted { level: 2 }));
    let first_level_2_task = events
        .iter()
        .position(|e| {
            matches!(e, SchedulerEvent::TaskStarted { task_id, .. }
                if *task_id == id("routes") || *task_id == id("docs"))
        })
        .unwrap();
    assert!(merged_1 < first_level_2_task);
}

/// Test: Retry through a full run
/// Given a task that fails its first attempt
/// When the scheduler runs
/// Then the failure is retried and the run still succeeds
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_task_retries_to_success() {
    let graph = two_level_graph();
    let store = memory_store(&graph);
    let runtime = Arc::new(MockRuntime::new().failing("routes", 1));
    let (tx, mut rx) = mpsc::channel(1024);

    let scheduler = Scheduler::new(
        test_config(2),
        graph,
        store.clone(),
        runtime.clone(),
        MockMergeEngine::new(),
    )
    .with_events(tx);
    let summary = Arc::new(scheduler).run().await.unwrap();

    assert!(summary.is_success());
    assert_eq!(runtime.invocations().len(), 5);
    let routes = store.get_task(&id("routes")).unwrap();
    assert_eq!(routes.status, TaskStatus::Complete);
    assert_eq!(routes.retry_count, 1);
    assert!(routes.error.is_none());

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        SchedulerEvent::TaskFailed { task_id, will_retry: true, .. } if *task_id == id("routes")
    )));
    assert!(events
        .iter()
        .any(|e| matches!(e, SchedulerEvent::TaskRequeued { task_id } if *task_id == id("routes"))));
}

/// Test: File-backed run with resume
/// Given a state file left with an orphaned claim
/// When a scheduler runs over it, and later runs again
/// Then the orphan is released, the run completes, and the second run
/// finds nothing to do
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_file_backed_run_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let graph = two_level_graph();
    let seed = file_store(dir.path(), "auth");
    seed.initialize(&graph).unwrap();
    seed.claim_task(&id("model"), WorkerId(1)).unwrap().unwrap();

    let store = Arc::new(file_store(dir.path(), "auth"));
    let runtime = Arc::new(MockRuntime::new());
    let scheduler = Scheduler::new(
        test_config(3),
        graph.clone(),
        store.clone(),
        runtime.clone(),
        MockMergeEngine::new(),
    );
    let summary = Arc::new(scheduler).run().await.unwrap();
    assert!(summary.is_success());
    assert_eq!(runtime.invocations().len(), 4);

    let reopened = file_store(dir.path(), "auth");
    let doc = reopened.load().unwrap();
    assert_eq!(doc.completed_levels(), 2);
    assert!(doc.execution_log.iter().any(|e| e.event == "task_released"));

    let again = Arc::new(MockRuntime::new());
    let scheduler = Scheduler::new(
        test_config(3),
        graph,
        Arc::new(reopened),
        again.clone(),
        MockMergeEngine::new(),
    );
    let summary = Arc::new(scheduler).run().await.unwrap();
    assert_eq!(summary.halt, HaltReason::Complete);
    assert!(again.invocations().is_empty());
}

/// Test: Metrics after a run
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_metrics_export_after_run() {
    let graph = wide_graph(6);
    let store = memory_store(&graph);
    let scheduler = Scheduler::new(
        test_config(3),
        graph,
        store.clone(),
        Arc::new(MockRuntime::new().with_delay(std::time::Duration::from_millis(20))),
        MockMergeEngine::new(),
    );
    assert!(Arc::new(scheduler).run().await.unwrap().is_success());

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wide-metrics.json");
    let metrics = MetricsCollector::new(store).export(&path).unwrap();

    assert_eq!(metrics.completed, 6);
    assert_eq!(metrics.worker_count, 3);
    assert!(metrics.tasks.iter().all(|t| t.execution_ms.is_some()));
    assert!(metrics.levels[0].p95_ms >= metrics.levels[0].p50_ms);
    assert!(metrics.parallel_efficiency.unwrap() > 0.0);
    assert!(path.exists());
}

/// Test: Real verification commands
/// Given a runtime that only runs each task's verification command
/// When the scheduler runs
/// Then verification time is recorded on every task
#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_verification_runtime_run() {
    let workdir = tempfile::tempdir().unwrap();
    let graph = wide_graph(3);
    let store = Arc::new(StateStore::in_memory());
    let scheduler = Scheduler::new(
        test_config(2),
        graph,
        store.clone(),
        Arc::new(VerificationRuntime::new(workdir.path())),
        MockMergeEngine::new(),
    );
    let summary = Arc::new(scheduler).run().await.unwrap();

    assert!(summary.is_success());
    for task in ["t0", "t1", "t2"] {
        assert!(store.get_task(&id(task)).unwrap().verification_ms.is_some());
    }
}
