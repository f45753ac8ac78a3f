//! Core domain types: identifiers, task lifecycle, DAGs and schedules.

pub mod dag;
pub mod schedule;
pub mod state;
pub mod task;
pub mod types;
