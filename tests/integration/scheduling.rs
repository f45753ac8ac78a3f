//! Scheduler integration tests.
//!
//! Tests that verify cron-driven firing, manual triggers and pausing.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tideflow::testing::{TestTask, wait_for_run_state};
use tideflow::{
    Dag, DagId, InMemoryStorage, Schedule, Scheduler, SchedulerError, SchedulerState, Settings,
    State, Storage,
};

use crate::common::{ok, wait_for_any_run};

fn every_second(id: &str) -> Dag {
    let mut dag = Dag::new(id).with_schedule(Schedule::new("* * * * * *").unwrap());
    ok(&mut dag, "tick");
    dag
}

fn scheduler(storage: &Arc<InMemoryStorage>) -> Scheduler<InMemoryStorage> {
    Scheduler::with_storage(storage.clone(), Settings::default())
        .unwrap()
        .with_heartbeat(Duration::from_millis(50))
        .unwrap()
}

#[test]
fn test_next_run_is_start_of_following_minute() {
    let schedule = Schedule::new("* * * * *").unwrap();
    let t = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 30).unwrap();

    assert_eq!(
        schedule.next_after(t).unwrap(),
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 1, 0).unwrap()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_heartbeat_triggers_due_dag() {
    let storage = Arc::new(InMemoryStorage::new());
    let mut scheduler = scheduler(&storage);
    scheduler.add_dag(every_second("cron")).await.unwrap();
    let (handle, task) = scheduler.start();

    let id = DagId::new("cron");
    let run = wait_for_any_run(storage.as_ref(), &id, State::Success, Duration::from_secs(5)).await;

    handle.shutdown().await.unwrap();
    task.await.unwrap().unwrap();

    let instances = storage.list_task_instances(&run.id).await.unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].state, State::Success);
    assert!(
        storage
            .get_dag(&id)
            .await
            .unwrap()
            .last_scheduler_run
            .is_some()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scheduled_dag_fires_repeatedly() {
    let storage = Arc::new(InMemoryStorage::new());
    let mut scheduler = scheduler(&storage);
    scheduler.add_dag(every_second("repeat")).await.unwrap();
    let (handle, task) = scheduler.start();

    let id = DagId::new("repeat");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(6);
    loop {
        let finished = storage
            .list_dag_runs(&id)
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.state == State::Success)
            .count();
        if finished >= 2 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "DAG fired fewer than twice");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    handle.shutdown().await.unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_manual_trigger_bypasses_schedule() {
    let storage = Arc::new(InMemoryStorage::new());
    let mut scheduler = scheduler(&storage);
    let mut dag = Dag::new("manual");
    dag.add_task(TestTask::new("only").build()).unwrap();
    scheduler.add_dag(dag).await.unwrap();
    let (handle, task) = scheduler.start();

    let run_id = handle.trigger("manual").await.unwrap();
    let run = wait_for_run_state(
        storage.as_ref(),
        &run_id,
        State::Success,
        Duration::from_secs(5),
    )
    .await;

    handle.shutdown().await.unwrap();
    task.await.unwrap().unwrap();
    assert_eq!(run.dag_id, DagId::new("manual"));
    // no schedule, so the heartbeat never fired it
    assert!(
        storage
            .get_dag(&DagId::new("manual"))
            .await
            .unwrap()
            .last_scheduler_run
            .is_none()
    );
}

#[tokio::test]
async fn test_paused_dag_is_not_fired() {
    let storage = Arc::new(InMemoryStorage::new());
    let mut scheduler = scheduler(&storage);
    scheduler.add_dag(every_second("paused")).await.unwrap();
    let id = DagId::new("paused");
    storage.set_dag_paused(&id, true).await.unwrap();
    let (handle, task) = scheduler.start();
    handle.pause("paused").await.unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(storage.list_dag_runs(&id).await.unwrap().is_empty());

    // manual triggers still work while paused
    let run_id = handle.trigger("paused").await.unwrap();
    wait_for_run_state(
        storage.as_ref(),
        &run_id,
        State::Success,
        Duration::from_secs(5),
    )
    .await;

    handle.unpause("paused").await.unwrap();
    assert!(!storage.get_dag(&id).await.unwrap().is_paused);

    handle.shutdown().await.unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_closed_window_never_fires() {
    let storage = Arc::new(InMemoryStorage::new());
    let mut scheduler = scheduler(&storage);
    let dag = every_second("expired").with_end_date(Utc::now() - chrono::Duration::days(1));
    scheduler.add_dag(dag).await.unwrap();
    let (handle, task) = scheduler.start();

    tokio::time::sleep(Duration::from_millis(1200)).await;

    handle.shutdown().await.unwrap();
    task.await.unwrap().unwrap();
    let runs = storage.list_dag_runs(&DagId::new("expired")).await.unwrap();
    assert!(runs.is_empty());
}

#[tokio::test]
async fn test_duplicate_and_cyclic_dags_are_rejected() {
    let storage = Arc::new(InMemoryStorage::new());
    let mut scheduler = scheduler(&storage);
    scheduler.add_dag(every_second("twice")).await.unwrap();

    assert!(matches!(
        scheduler.add_dag(every_second("twice")).await,
        Err(SchedulerError::DuplicateDag(_))
    ));

    let mut cyclic = Dag::new("cyclic");
    let a = ok(&mut cyclic, "a");
    let b = ok(&mut cyclic, "b");
    cyclic.set_downstream(&a, &b).unwrap();
    cyclic.set_downstream(&b, &a).unwrap();
    assert!(matches!(
        scheduler.add_dag(cyclic).await,
        Err(SchedulerError::Dag(_))
    ));
    assert!(scheduler.get_dag(&DagId::new("cyclic")).is_none());

    let (handle, task) = scheduler.start();
    assert_eq!(handle.state().await, SchedulerState::Running);
    handle.shutdown().await.unwrap();
    task.await.unwrap().unwrap();
}
