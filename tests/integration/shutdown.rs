//! Graceful shutdown integration tests.
//!
//! Tests that verify the scheduler waits for running DAG runs before
//! exiting, gives up after the shutdown timeout, and that cancelled runs
//! end as failures.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tideflow::testing::{TestTask, wait_for_run_state};
use tideflow::{
    Dag, InMemoryStorage, RunError, RunId, Scheduler, SchedulerState, Settings, State, Storage,
    TaskId, TaskRunner,
};
use tokio_util::sync::CancellationToken;

fn slow_dag(id: &str, duration: Duration) -> (Dag, Arc<TestTask>) {
    let task = TestTask::new("slow_task").sleep(duration).build();
    let mut dag = Dag::new(id);
    dag.add_task(task.clone()).unwrap();
    (dag, task)
}

#[tokio::test]
async fn test_graceful_shutdown_waits_for_runs() {
    let storage = Arc::new(InMemoryStorage::new());
    let (dag, task) = slow_dag("slow_dag", Duration::from_millis(300));
    let mut scheduler = Scheduler::with_storage(storage.clone(), Settings::default()).unwrap();
    scheduler.add_dag(dag).await.unwrap();
    let (handle, scheduler_task) = scheduler.start();

    let run_id = handle.trigger("slow_dag").await.unwrap();
    wait_for_run_state(
        storage.as_ref(),
        &run_id,
        State::Running,
        Duration::from_secs(5),
    )
    .await;

    let shutdown_start = Instant::now();
    handle.shutdown().await.unwrap();
    let shutdown_duration = shutdown_start.elapsed();
    scheduler_task.await.unwrap().unwrap();

    assert_eq!(task.runs(), 1);
    assert!(
        shutdown_duration >= Duration::from_millis(100),
        "shutdown returned before the run finished: {:?}",
        shutdown_duration
    );
    let run = wait_for_run_state(
        storage.as_ref(),
        &run_id,
        State::Success,
        Duration::from_millis(100),
    )
    .await;
    assert!(run.end_date.is_some());
    assert_eq!(handle.state().await, SchedulerState::Stopped);
    assert!(!handle.is_running().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_timeout_exceeded() {
    let storage = Arc::new(InMemoryStorage::new());
    let (dag, _task) = slow_dag("very_slow_dag", Duration::from_secs(10));
    let settings = Settings::default().with_shutdown_timeout_secs(1);
    let mut scheduler = Scheduler::with_storage(storage.clone(), settings).unwrap();
    scheduler.add_dag(dag).await.unwrap();
    let (handle, scheduler_task) = scheduler.start();

    let run_id = handle.trigger("very_slow_dag").await.unwrap();
    wait_for_run_state(
        storage.as_ref(),
        &run_id,
        State::Running,
        Duration::from_secs(5),
    )
    .await;

    let shutdown_start = Instant::now();
    handle.shutdown().await.unwrap();
    scheduler_task.await.unwrap().unwrap();

    assert!(
        shutdown_start.elapsed() < Duration::from_secs(5),
        "shutdown should give up on the run after the timeout"
    );
    assert_eq!(handle.state().await, SchedulerState::Stopped);
}

#[tokio::test]
async fn test_shutdown_with_no_runs_is_immediate() {
    let storage = Arc::new(InMemoryStorage::new());
    let scheduler = Scheduler::with_storage(storage, Settings::default()).unwrap();
    let (handle, scheduler_task) = scheduler.start();
    assert!(handle.is_running().await);

    let shutdown_start = Instant::now();
    handle.shutdown().await.unwrap();
    scheduler_task.await.unwrap().unwrap();

    assert!(shutdown_start.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_cancelled_run_ends_failed() {
    let mut dag = Dag::new("cancelled");
    let first = dag
        .add_task(
            TestTask::new("first")
                .sleep(Duration::from_millis(200))
                .build(),
        )
        .unwrap();
    let second = TestTask::new("second").build();
    let second_ref = dag.add_task(second.clone()).unwrap();
    dag.set_downstream(&first, &second_ref).unwrap();

    let storage = Arc::new(InMemoryStorage::new());
    let runner = TaskRunner::new(Arc::new(dag), storage.clone(), 2).unwrap();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let run_id = RunId::new();
    let summary = runner.run(run_id.clone(), cancel).await;

    assert!(summary.cancelled);
    assert_eq!(summary.state, State::Failed);
    assert_ne!(summary.state_of("second"), Some(State::Success));
    assert_eq!(second.runs(), 0);
    assert!(
        summary
            .errors
            .iter()
            .any(|e| matches!(e, RunError::Cancelled(_)))
    );

    // the in-flight task's record is closed rather than left running
    let first = storage
        .get_task_instance(&run_id, &TaskId::new("first"))
        .await
        .unwrap();
    assert_eq!(first.state, State::Failed);
    assert_eq!(first.error.as_deref(), Some("run cancelled"));
}
