//! Common test utilities shared across integration tests.

#![allow(dead_code)]

use std::time::Duration;

use tideflow::testing::TestTask;
use tideflow::{Dag, DagId, DagRunRecord, State, Storage, TaskRef};

/// Add a task that succeeds immediately.
pub fn ok(dag: &mut Dag, id: &str) -> TaskRef {
    dag.add_task(TestTask::new(id).build()).unwrap()
}

/// Add a task that fails with a fixed message.
pub fn failing(dag: &mut Dag, id: &str) -> TaskRef {
    dag.add_task(TestTask::new(id).failing(format!("{id} failed")).build())
        .unwrap()
}

/// The diamond-with-tail DAG: A feeds B and C, C feeds D.
pub fn diamond(fail_c: bool) -> Dag {
    let mut dag = Dag::new("diamond");
    let a = ok(&mut dag, "a");
    let b = ok(&mut dag, "b");
    let c = if fail_c {
        failing(&mut dag, "c")
    } else {
        ok(&mut dag, "c")
    };
    let d = ok(&mut dag, "d");
    dag.set_downstream(&a, &b).unwrap();
    dag.set_downstream(&a, &c).unwrap();
    dag.set_downstream(&c, &d).unwrap();
    dag
}

/// Poll storage until some run of `dag_id` reaches `expected`.
///
/// # Panics
///
/// Panics if no run reaches the state within `timeout`.
pub async fn wait_for_any_run<S: Storage + ?Sized>(
    storage: &S,
    dag_id: &DagId,
    expected: State,
    timeout: Duration,
) -> DagRunRecord {
    let start = tokio::time::Instant::now();
    loop {
        let runs = storage.list_dag_runs(dag_id).await.unwrap();
        if let Some(run) = runs.into_iter().find(|r| r.state == expected) {
            return run;
        }
        if start.elapsed() > timeout {
            panic!("Timeout waiting for a run of {dag_id} to reach {expected}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
