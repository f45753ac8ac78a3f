//! Benchmarks for DAG operations.
//!
//! Measures the overhead of:
//! - DAG construction and validation
//! - Full runs of no-op tasks through the evaluator and worker pool

use std::sync::Arc;

use async_trait::async_trait;
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use tideflow::{Dag, InMemoryStorage, RunId, Task, TaskError, TaskRunner};
use tokio_util::sync::CancellationToken;

/// A minimal no-op task for benchmarking DAG operations.
struct NoOpTask {
    id: String,
}

impl NoOpTask {
    fn create(id: String) -> Arc<dyn Task> {
        Arc::new(Self { id })
    }
}

#[async_trait]
impl Task for NoOpTask {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self) -> Result<(), TaskError> {
        Ok(())
    }
}

/// Build a linear DAG: task_0 -> task_1 -> ... -> task_n
fn build_linear_dag(size: usize) -> Dag {
    let mut dag = Dag::new("linear");
    let mut prev = dag.add_task(NoOpTask::create("task_0".into())).unwrap();
    for i in 1..size {
        let next = dag.add_task(NoOpTask::create(format!("task_{i}"))).unwrap();
        dag.set_downstream(&prev, &next).unwrap();
        prev = next;
    }
    dag
}

/// Build a wide DAG: root -> [leaf_0, leaf_1, ...]
fn build_wide_dag(size: usize) -> Dag {
    let mut dag = Dag::new("wide");
    let root = dag.add_task(NoOpTask::create("root".into())).unwrap();
    for i in 0..size {
        let leaf = dag.add_task(NoOpTask::create(format!("leaf_{i}"))).unwrap();
        dag.set_downstream(&root, &leaf).unwrap();
    }
    dag
}

fn bench_dag_validation(c: &mut Criterion) {
    let mut group = c.benchmark_group("dag_validation");

    for size in [10, 100, 500].iter() {
        group.bench_with_input(BenchmarkId::new("linear_build", size), size, |b, &size| {
            b.iter(|| build_linear_dag(size));
        });

        let linear = build_linear_dag(*size);
        group.bench_with_input(BenchmarkId::new("linear", size), &linear, |b, dag| {
            b.iter(|| dag.validate().unwrap());
        });

        let wide = build_wide_dag(*size);
        group.bench_with_input(BenchmarkId::new("wide", size), &wide, |b, dag| {
            b.iter(|| dag.validate().unwrap());
        });
    }

    group.finish();
}

fn bench_dag_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("dag_run");
    let rt = tokio::runtime::Runtime::new().unwrap();
    let storage = Arc::new(InMemoryStorage::new());

    for size in [10, 100].iter() {
        let linear = TaskRunner::new(Arc::new(build_linear_dag(*size)), storage.clone(), 8).unwrap();
        group.bench_with_input(BenchmarkId::new("linear", size), &linear, |b, runner| {
            b.to_async(&rt)
                .iter(|| runner.run(RunId::new(), CancellationToken::new()));
        });

        let wide = TaskRunner::new(Arc::new(build_wide_dag(*size)), storage.clone(), 8).unwrap();
        group.bench_with_input(BenchmarkId::new("wide", size), &wide, |b, runner| {
            b.to_async(&rt)
                .iter(|| runner.run(RunId::new(), CancellationToken::new()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_dag_validation, bench_dag_run);

criterion_main!(benches);
