//! Lifecycle state shared by task instances and DAG runs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a task within one run, also used as the aggregate state of a run.
///
/// A task starts `Pending`, becomes `Queued` once every upstream task has
/// succeeded, `Running` while a worker executes it, and ends in exactly one of
/// the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum State {
    #[default]
    Pending,
    Queued,
    Running,
    Success,
    Failed,
    /// Never executed because a transitive upstream task failed.
    UpstreamFailed,
}

impl State {
    /// Terminal states are never left once entered.
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Success | State::Failed | State::UpstreamFailed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            State::Pending => "pending",
            State::Queued => "queued",
            State::Running => "running",
            State::Success => "success",
            State::Failed => "failed",
            State::UpstreamFailed => "upstream-failed",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
