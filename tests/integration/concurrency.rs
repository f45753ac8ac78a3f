//! Concurrency limit integration tests.
//!
//! Tests that verify the per-run worker bound and the global limit on
//! simultaneously executing DAG runs.

use std::sync::Arc;
use std::time::Duration;

use tideflow::testing::{ConcurrencyProbe, ExecutionLog, TestHarness, TestTask, wait_for_run_state};
use tideflow::{Dag, DagRunner, InMemoryStorage, Settings, State, Storage};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn independent_tasks(id: &str, count: usize, probe: &ConcurrencyProbe) -> Dag {
    let mut dag = Dag::new(id);
    for i in 0..count {
        dag.add_task(
            TestTask::new(format!("task_{i}"))
                .sleep(Duration::from_millis(50))
                .probe(probe)
                .build(),
        )
        .unwrap();
    }
    dag
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallelism_bounds_running_tasks() {
    let probe = ConcurrencyProbe::new();
    let dag = independent_tasks("five_roots", 5, &probe);

    let summary = TestHarness::new().with_parallelism(2).run(dag).await;

    assert!(summary.is_success());
    assert_eq!(summary.success.len(), 5);
    assert_eq!(probe.total(), 5);
    assert!(probe.max() <= 2, "max concurrent tasks was {}", probe.max());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_independent_tasks_overlap_up_to_limit() {
    let probe = ConcurrencyProbe::new();
    let dag = independent_tasks("wide", 12, &probe);

    let summary = TestHarness::new().with_parallelism(4).run(dag).await;

    assert!(summary.is_success());
    assert!(probe.max() <= 4, "max concurrent tasks was {}", probe.max());
    assert!(probe.max() >= 2, "tasks never overlapped");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dag_concurrency_caps_parallelism() {
    let probe = ConcurrencyProbe::new();
    let dag = independent_tasks("serial", 4, &probe).with_concurrency(1);

    let summary = TestHarness::new().with_parallelism(8).run(dag).await;

    assert!(summary.is_success());
    assert_eq!(probe.max(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_second_run_waits_for_admission() {
    let storage = Arc::new(InMemoryStorage::new());
    let settings = Settings::default().with_dag_concurrency(1);
    let (errors_tx, _errors_rx) = mpsc::unbounded_channel();
    let (runner, handle) = DagRunner::new(storage.clone(), &settings, errors_tx).unwrap();
    let cancel = CancellationToken::new();
    let runner_task = tokio::spawn(runner.run(cancel.clone()));

    let log = ExecutionLog::new();
    let mut run_ids = Vec::new();
    for name in ["first", "second"] {
        let mut dag = Dag::new(name);
        dag.add_task(
            TestTask::new(name)
                .sleep(Duration::from_millis(100))
                .log(&log)
                .build(),
        )
        .unwrap();
        run_ids.push(handle.submit(Arc::new(dag)).await.unwrap());
    }

    for run_id in &run_ids {
        wait_for_run_state(
            storage.as_ref(),
            run_id,
            State::Success,
            Duration::from_secs(5),
        )
        .await;
    }
    cancel.cancel();
    runner_task.await.unwrap();

    assert_eq!(
        log.entries(),
        vec!["first:start", "first:end", "second:start", "second:end"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_runs_of_same_dag_do_not_share_state() {
    let storage = Arc::new(InMemoryStorage::new());
    let settings = Settings::default().with_dag_concurrency(2);
    let (errors_tx, _errors_rx) = mpsc::unbounded_channel();
    let (runner, handle) = DagRunner::new(storage.clone(), &settings, errors_tx).unwrap();
    let cancel = CancellationToken::new();
    let runner_task = tokio::spawn(runner.run(cancel.clone()));

    let probe = ConcurrencyProbe::new();
    let dag = Arc::new(independent_tasks("shared", 3, &probe));
    let first = handle.submit(dag.clone()).await.unwrap();
    let second = handle.submit(dag).await.unwrap();

    for run_id in [&first, &second] {
        wait_for_run_state(
            storage.as_ref(),
            run_id,
            State::Success,
            Duration::from_secs(5),
        )
        .await;
        let instances = storage.list_task_instances(run_id).await.unwrap();
        assert_eq!(instances.len(), 3);
        assert!(instances.iter().all(|i| i.state == State::Success));
    }
    cancel.cancel();
    runner_task.await.unwrap();

    assert_eq!(probe.total(), 6);
}
