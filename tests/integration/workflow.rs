//! Complete workflow integration tests.
//!
//! Tests that verify dependency ordering, failure propagation and the
//! records a run leaves in storage.

use std::sync::Arc;
use std::time::Duration;

use tideflow::testing::{ExecutionLog, TestHarness, TestTask};
use tideflow::{
    BashOperator, Dag, DagError, DagRecord, FnOperator, InMemoryStorage, RunId, State, Storage,
    TaskError, TaskId, run_dag,
};
use tokio_util::sync::CancellationToken;

use crate::common::{diamond, failing, ok};

#[tokio::test]
async fn test_failed_branch_marks_descendants_upstream_failed() {
    let harness = TestHarness::new();

    let summary = harness.run(diamond(true)).await;

    assert_eq!(summary.state_of("a"), Some(State::Success));
    assert_eq!(summary.state_of("b"), Some(State::Success));
    assert_eq!(summary.state_of("c"), Some(State::Failed));
    assert_eq!(summary.state_of("d"), Some(State::UpstreamFailed));
    assert_eq!(summary.state, State::Failed);
    assert_eq!(summary.accounted(), 4);
}

#[tokio::test]
async fn test_single_task_succeeds() {
    let mut dag = Dag::new("single");
    ok(&mut dag, "only");

    let summary = TestHarness::new().run(dag).await;

    assert_eq!(summary.state_of("only"), Some(State::Success));
    assert_eq!(summary.state, State::Success);
    assert!(summary.errors.is_empty());
}

#[tokio::test]
async fn test_cascade_is_transitive_and_counted_once() {
    // root fails; x -> y -> z hang off it, and z also depends on a sibling
    let mut dag = Dag::new("cascade");
    let root = failing(&mut dag, "root");
    let sibling = ok(&mut dag, "sibling");
    let x = ok(&mut dag, "x");
    let y = ok(&mut dag, "y");
    let z = ok(&mut dag, "z");
    dag.set_downstream(&root, &x).unwrap();
    dag.set_downstream(&x, &y).unwrap();
    dag.set_downstream(&y, &z).unwrap();
    dag.set_downstream(&root, &y).unwrap();
    dag.set_downstream(&sibling, &z).unwrap();

    let summary = TestHarness::new().run(dag).await;

    assert_eq!(summary.failed, vec![TaskId::new("root")]);
    assert_eq!(
        summary.upstream_failed,
        vec![TaskId::new("x"), TaskId::new("y"), TaskId::new("z")]
    );
    assert_eq!(summary.success, vec![TaskId::new("sibling")]);
    assert_eq!(summary.accounted(), 5);
}

#[tokio::test]
async fn test_downstream_starts_after_upstream_finishes() {
    let log = ExecutionLog::new();
    let mut dag = Dag::new("ordered");
    let first = dag
        .add_task(
            TestTask::new("first")
                .sleep(Duration::from_millis(30))
                .log(&log)
                .build(),
        )
        .unwrap();
    let second = dag
        .add_task(TestTask::new("second").log(&log).build())
        .unwrap();
    let third = dag
        .add_task(TestTask::new("third").log(&log).build())
        .unwrap();
    dag.set_downstream(&first, &second).unwrap();
    dag.set_downstream(&second, &third).unwrap();

    let summary = TestHarness::new().run(dag).await;

    assert!(summary.is_success());
    let end_first = log.position("first:end").unwrap();
    let start_second = log.position("second:start").unwrap();
    let end_second = log.position("second:end").unwrap();
    let start_third = log.position("third:start").unwrap();
    assert!(end_first < start_second);
    assert!(end_second < start_third);
}

#[tokio::test]
async fn test_roots_run_despite_failed_sibling() {
    let mut dag = Dag::new("roots");
    failing(&mut dag, "broken");
    ok(&mut dag, "fine_1");
    ok(&mut dag, "fine_2");

    let summary = TestHarness::new().run(dag).await;

    assert_eq!(summary.state_of("fine_1"), Some(State::Success));
    assert_eq!(summary.state_of("fine_2"), Some(State::Success));
    assert_eq!(summary.state, State::Failed);
}

#[tokio::test]
async fn test_panicking_task_fails_without_aborting_run() {
    let mut dag = Dag::new("panics");
    let boom = dag
        .add_task(TestTask::new("boom").panicking().build())
        .unwrap();
    let after = ok(&mut dag, "after");
    ok(&mut dag, "independent");
    dag.set_downstream(&boom, &after).unwrap();

    let summary = TestHarness::new().run(dag).await;

    assert_eq!(summary.state_of("boom"), Some(State::Failed));
    assert_eq!(summary.state_of("after"), Some(State::UpstreamFailed));
    assert_eq!(summary.state_of("independent"), Some(State::Success));
}

#[tokio::test]
async fn test_run_records_are_persisted() {
    let storage = Arc::new(InMemoryStorage::new());
    let run_id = RunId::new();

    let summary = run_dag(
        storage.clone(),
        Arc::new(diamond(true)),
        run_id.clone(),
        4,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(summary.state, State::Failed);
    let run = storage.get_dag_run(&run_id).await.unwrap();
    assert_eq!(run.state, State::Failed);
    assert!(run.end_date.is_some());

    let failed = storage
        .get_task_instance(&run_id, &TaskId::new("c"))
        .await
        .unwrap();
    assert_eq!(failed.state, State::Failed);
    assert_eq!(failed.try_number, 1);
    assert!(failed.error.as_deref().is_some_and(|e| e.contains("c failed")));

    let skipped = storage
        .get_task_instance(&run_id, &TaskId::new("d"))
        .await
        .unwrap();
    assert_eq!(skipped.state, State::UpstreamFailed);
    assert!(skipped.start_date.is_none());

    let instances = storage.list_task_instances(&run_id).await.unwrap();
    assert_eq!(instances.len(), 4);
}

#[tokio::test]
async fn test_mixed_operators_run_together() {
    let mut dag = Dag::new("mixed");
    let echo = dag
        .add_task(BashOperator::new("echo", "echo hello world"))
        .unwrap();
    let closure = dag
        .add_task(FnOperator::new("closure", || async { Ok(()) }))
        .unwrap();
    let missing = dag
        .add_task(BashOperator::new("missing", "ls /definitely/not/a/path"))
        .unwrap();
    let never = dag
        .add_task(FnOperator::new("never", || async {
            Err(TaskError::ExecutionFailed("should not run".into()))
        }))
        .unwrap();
    dag.set_downstream(&echo, &closure).unwrap();
    dag.set_downstream(&missing, &never).unwrap();

    let storage = Arc::new(InMemoryStorage::new());
    let run_id = RunId::new();
    let summary = run_dag(
        storage.clone(),
        Arc::new(dag),
        run_id.clone(),
        4,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(summary.state_of("echo"), Some(State::Success));
    assert_eq!(summary.state_of("closure"), Some(State::Success));
    assert_eq!(summary.state_of("missing"), Some(State::Failed));
    assert_eq!(summary.state_of("never"), Some(State::UpstreamFailed));

    let echo = storage
        .get_task_instance(&run_id, &TaskId::new("echo"))
        .await
        .unwrap();
    assert_eq!(echo.operator, "bash");
}

#[tokio::test]
async fn test_duplicate_task_leaves_dag_unchanged() {
    let mut dag = Dag::new("dupes");
    ok(&mut dag, "a");
    ok(&mut dag, "b");
    let before = dag.task_ids();

    let result = dag.add_task(TestTask::new("a").build());

    assert!(matches!(result, Err(DagError::DuplicateTask(id)) if id == "a"));
    assert_eq!(dag.len(), 2);
    assert_eq!(dag.task_ids(), before);
}

#[tokio::test]
async fn test_cyclic_dag_is_rejected_before_running() {
    let mut dag = Dag::new("cycle");
    let a = ok(&mut dag, "a");
    let b = ok(&mut dag, "b");
    dag.set_downstream(&a, &b).unwrap();
    dag.set_downstream(&b, &a).unwrap();
    let storage = Arc::new(InMemoryStorage::new());
    storage
        .get_or_create_dag(DagRecord::from_dag(&dag))
        .await
        .unwrap();

    let result = run_dag(
        storage.clone(),
        Arc::new(dag),
        RunId::new(),
        2,
        CancellationToken::new(),
    )
    .await;

    assert!(result.is_err());
    let runs = storage.list_dag_runs(&"cycle".into()).await.unwrap();
    assert!(runs.is_empty());
}
