//! Cron scheduling of DAG runs.
//!
//! [`Scheduler`] fires registered DAGs when their schedule comes due and
//! accepts manual triggers and pause requests through a [`SchedulerHandle`].

mod engine;
mod handle;
mod heartbeat;
mod types;

pub use engine::Scheduler;
pub use handle::SchedulerHandle;
pub use types::{SchedulerError, SchedulerState};
