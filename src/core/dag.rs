//! Directed Acyclic Graph (DAG) of tasks.
//!
//! A [`Dag`] owns its tasks in an arena keyed by [`TaskId`]; edges are stored
//! as id lists on each [`TaskNode`] in both directions. Tasks enter a DAG
//! either through [`Dag::add_task`], which hands back a [`TaskRef`], or by
//! being named as an unowned side of an edge, in which case the DAG adopts
//! them. A `TaskRef` minted by one DAG cannot be wired into another.
//!
//! ```
//! use std::sync::Arc;
//! use tideflow::{Dag, FnOperator, Task};
//!
//! let mut dag = Dag::new("etl");
//! let extract = dag.add_task(FnOperator::new("extract", || async { Ok(()) })).unwrap();
//! let load: Arc<dyn Task> = FnOperator::new("load", || async { Ok(()) });
//!
//! // `load` is adopted by the DAG because it was not added yet.
//! dag.set_downstream(&extract, load).unwrap();
//!
//! assert_eq!(dag.len(), 2);
//! assert_eq!(dag.roots().len(), 1);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::{self, Write as _};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use thiserror::Error;

use super::schedule::{Schedule, ScheduleError};
use super::task::Task;
use super::types::{DagId, TaskId};

/// Errors that can occur when building or querying DAGs.
#[derive(Debug, Error)]
pub enum DagError {
    /// A task with the same id is already part of the DAG.
    #[error("duplicate task: {0}")]
    DuplicateTask(TaskId),

    /// A task handle belonging to another DAG was used in this one.
    #[error("task '{task}' belongs to DAG[{owner}], not DAG[{dag}]")]
    CrossDag {
        task: TaskId,
        owner: DagId,
        dag: DagId,
    },

    /// Task not found in the DAG.
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// A cycle was detected in the graph.
    #[error("cycle detected involving task: {0}")]
    CycleDetected(TaskId),

    /// The schedule could not produce a fire time.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(#[from] ScheduleError),

    /// The DAG has no schedule, it can only be triggered manually.
    #[error("DAG[{0}] has no schedule")]
    Unscheduled(DagId),

    /// The next fire time falls after the DAG's end date.
    #[error("DAG[{0}] has no fire time before its end date")]
    WindowClosed(DagId),
}

/// Handle to a task that has been added to a specific DAG.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskRef {
    dag: DagId,
    task: TaskId,
}

impl TaskRef {
    pub fn id(&self) -> &TaskId {
        &self.task
    }

    pub fn dag_id(&self) -> &DagId {
        &self.dag
    }
}

/// One side of an edge passed to [`Dag::set_upstream`] / [`Dag::set_downstream`].
pub enum Relative {
    /// A task already added to some DAG.
    Owned(TaskRef),
    /// A task not yet owned by any DAG, adopted on first use.
    Unowned(Arc<dyn Task>),
}

impl From<TaskRef> for Relative {
    fn from(task: TaskRef) -> Self {
        Relative::Owned(task)
    }
}

impl From<&TaskRef> for Relative {
    fn from(task: &TaskRef) -> Self {
        Relative::Owned(task.clone())
    }
}

impl From<Arc<dyn Task>> for Relative {
    fn from(task: Arc<dyn Task>) -> Self {
        Relative::Unowned(task)
    }
}

/// A node in the DAG representing a task and its edges.
#[derive(Clone)]
pub struct TaskNode {
    pub id: TaskId,
    pub task: Arc<dyn Task>,
    upstream: Vec<TaskId>,
    downstream: Vec<TaskId>,
}

impl TaskNode {
    fn new(task: Arc<dyn Task>) -> Self {
        Self {
            id: TaskId::new(task.id()),
            task,
            upstream: Vec::new(),
            downstream: Vec::new(),
        }
    }

    /// Tasks that must succeed before this one may run.
    pub fn upstream(&self) -> &[TaskId] {
        &self.upstream
    }

    /// Tasks that depend on this one.
    pub fn downstream(&self) -> &[TaskId] {
        &self.downstream
    }

    pub fn is_root(&self) -> bool {
        self.upstream.is_empty()
    }
}

impl fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNode")
            .field("id", &self.id)
            .field("upstream", &self.upstream)
            .field("downstream", &self.downstream)
            .finish()
    }
}

/// A Directed Acyclic Graph of tasks plus its scheduling metadata.
#[derive(Clone)]
pub struct Dag {
    id: DagId,
    description: String,
    schedule: Option<Schedule>,
    concurrency: Option<usize>,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
    nodes: HashMap<TaskId, TaskNode>,
    /// Insertion order, keeps roots and tree views deterministic.
    order: Vec<TaskId>,
}

impl Dag {
    /// Create an empty, unscheduled DAG.
    pub fn new(id: impl Into<DagId>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            schedule: None,
            concurrency: None,
            start_date: None,
            end_date: None,
            nodes: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    /// Cap the number of tasks of one run executing at once.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Scheduled fires never happen before `start`.
    pub fn with_start_date(mut self, start: DateTime<Utc>) -> Self {
        self.start_date = Some(start);
        self
    }

    /// Scheduled fires never happen after `end`.
    pub fn with_end_date(mut self, end: DateTime<Utc>) -> Self {
        self.end_date = Some(end);
        self
    }

    pub fn id(&self) -> &DagId {
        &self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn schedule(&self) -> Option<&Schedule> {
        self.schedule.as_ref()
    }

    /// Evaluate the schedule in `timezone` if it does not name its own.
    pub fn set_default_timezone(&mut self, timezone: Tz) {
        if let Some(schedule) = &mut self.schedule {
            schedule.set_default_timezone(timezone);
        }
    }

    pub fn concurrency(&self) -> Option<usize> {
        self.concurrency
    }

    pub fn start_date(&self) -> Option<DateTime<Utc>> {
        self.start_date
    }

    pub fn end_date(&self) -> Option<DateTime<Utc>> {
        self.end_date
    }

    /// `DAG[<id>]`, the label used in logs and errors.
    pub fn formatted_id(&self) -> String {
        format!("DAG[{}]", self.id)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Add a task to the DAG.
    ///
    /// Fails without modifying the graph if a task with the same id exists.
    pub fn add_task(&mut self, task: Arc<dyn Task>) -> Result<TaskRef, DagError> {
        let id = TaskId::new(task.id());
        if self.nodes.contains_key(&id) {
            return Err(DagError::DuplicateTask(id));
        }
        Ok(self.insert(task))
    }

    /// Declare that `task` depends on `upstream`.
    pub fn set_upstream(
        &mut self,
        task: impl Into<Relative>,
        upstream: impl Into<Relative>,
    ) -> Result<(TaskRef, TaskRef), DagError> {
        let (upstream, task) = self.link(upstream.into(), task.into())?;
        Ok((task, upstream))
    }

    /// Declare that `downstream` depends on `task`.
    pub fn set_downstream(
        &mut self,
        task: impl Into<Relative>,
        downstream: impl Into<Relative>,
    ) -> Result<(TaskRef, TaskRef), DagError> {
        self.link(task.into(), downstream.into())
    }

    /// Add the edge `from -> to`, adopting unowned tasks.
    ///
    /// Every check runs before anything is inserted so a failed call leaves
    /// the graph untouched.
    fn link(&mut self, from: Relative, to: Relative) -> Result<(TaskRef, TaskRef), DagError> {
        let from_id = self.check_relative(&from)?;
        let to_id = self.check_relative(&to)?;
        if from_id == to_id {
            if matches!((&from, &to), (Relative::Unowned(_), Relative::Unowned(_))) {
                return Err(DagError::DuplicateTask(from_id));
            }
            return Err(DagError::CycleDetected(from_id));
        }

        let from = self.adopt(from);
        let to = self.adopt(to);

        if let Some(node) = self.nodes.get_mut(&from.task) {
            if !node.downstream.contains(&to.task) {
                node.downstream.push(to.task.clone());
            }
        }
        if let Some(node) = self.nodes.get_mut(&to.task) {
            if !node.upstream.contains(&from.task) {
                node.upstream.push(from.task.clone());
            }
        }
        Ok((from, to))
    }

    fn check_relative(&self, relative: &Relative) -> Result<TaskId, DagError> {
        match relative {
            Relative::Owned(task) => {
                if task.dag != self.id {
                    return Err(DagError::CrossDag {
                        task: task.task.clone(),
                        owner: task.dag.clone(),
                        dag: self.id.clone(),
                    });
                }
                if !self.nodes.contains_key(&task.task) {
                    return Err(DagError::TaskNotFound(task.task.clone()));
                }
                Ok(task.task.clone())
            }
            Relative::Unowned(task) => {
                let id = TaskId::new(task.id());
                if self.nodes.contains_key(&id) {
                    return Err(DagError::DuplicateTask(id));
                }
                Ok(id)
            }
        }
    }

    fn adopt(&mut self, relative: Relative) -> TaskRef {
        match relative {
            Relative::Owned(task) => task,
            Relative::Unowned(task) => self.insert(task),
        }
    }

    fn insert(&mut self, task: Arc<dyn Task>) -> TaskRef {
        let node = TaskNode::new(task);
        let id = node.id.clone();
        self.order.push(id.clone());
        self.nodes.insert(id.clone(), node);
        TaskRef {
            dag: self.id.clone(),
            task: id,
        }
    }

    /// Handle for a task already in this DAG.
    pub fn task_ref(&self, id: impl Into<TaskId>) -> Result<TaskRef, DagError> {
        let id = id.into();
        if !self.nodes.contains_key(&id) {
            return Err(DagError::TaskNotFound(id));
        }
        Ok(TaskRef {
            dag: self.id.clone(),
            task: id,
        })
    }

    pub fn get_task(&self, id: &TaskId) -> Result<&TaskNode, DagError> {
        self.nodes
            .get(id)
            .ok_or_else(|| DagError::TaskNotFound(id.clone()))
    }

    pub fn upstream(&self, id: &TaskId) -> Result<&[TaskId], DagError> {
        self.get_task(id).map(TaskNode::upstream)
    }

    pub fn downstream(&self, id: &TaskId) -> Result<&[TaskId], DagError> {
        self.get_task(id).map(TaskNode::downstream)
    }

    /// Tasks in insertion order.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskNode> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.order.clone()
    }

    /// Tasks without upstream dependencies, in insertion order.
    pub fn roots(&self) -> Vec<&TaskNode> {
        self.tasks().filter(|node| node.is_root()).collect()
    }

    /// Return task ids in a valid execution order.
    ///
    /// Fails with [`DagError::CycleDetected`] if the graph has a cycle.
    pub fn topological_sort(&self) -> Result<Vec<TaskId>, DagError> {
        // Kahn's algorithm over the stored upstream counts
        let mut in_degree: HashMap<&TaskId, usize> = self
            .nodes
            .values()
            .map(|node| (&node.id, node.upstream.len()))
            .collect();

        let mut queue: VecDeque<&TaskId> = self
            .order
            .iter()
            .filter(|id| in_degree.get(id).copied() == Some(0))
            .collect();

        let mut sorted = Vec::with_capacity(self.nodes.len());
        while let Some(id) = queue.pop_front() {
            sorted.push(id.clone());
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            for next in &node.downstream {
                if let Some(degree) = in_degree.get_mut(next) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(next);
                    }
                }
            }
        }

        if sorted.len() != self.nodes.len() {
            let stuck = self
                .order
                .iter()
                .find(|id| in_degree.get(id).is_some_and(|d| *d > 0))
                .cloned()
                .unwrap_or_else(|| self.id.as_str().into());
            return Err(DagError::CycleDetected(stuck));
        }

        Ok(sorted)
    }

    /// Validate the graph structure.
    pub fn validate(&self) -> Result<(), DagError> {
        self.topological_sort().map(|_| ())
    }

    /// Next scheduled fire strictly after the current instant.
    pub fn next_run(&self) -> Result<DateTime<Utc>, DagError> {
        self.next_run_after(Utc::now())
    }

    /// Next scheduled fire strictly after `after`, clamped to the DAG's window.
    pub fn next_run_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, DagError> {
        let schedule = self
            .schedule
            .as_ref()
            .ok_or_else(|| DagError::Unscheduled(self.id.clone()))?;

        let base = match self.start_date {
            Some(start) if start > after => start,
            _ => after,
        };
        let next = schedule.next_after(base)?;

        match self.end_date {
            Some(end) if next > end => Err(DagError::WindowClosed(self.id.clone())),
            _ => Ok(next),
        }
    }

    /// Whether `at` falls within the DAG's start/end window.
    pub fn is_within_window(&self, at: DateTime<Utc>) -> bool {
        self.start_date.is_none_or(|start| at >= start) && self.end_date.is_none_or(|end| at <= end)
    }

    /// Render the graph depth-first from each root, one tab per level.
    ///
    /// A task reachable along several paths is printed once per path.
    pub fn tree_view(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", self.formatted_id());
        for root in self.roots() {
            let mut path = HashSet::new();
            self.write_subtree(&mut out, &root.id, 1, &mut path);
        }
        out
    }

    fn write_subtree<'a>(
        &'a self,
        out: &mut String,
        id: &'a TaskId,
        depth: usize,
        path: &mut HashSet<&'a TaskId>,
    ) {
        let Some(node) = self.nodes.get(id) else {
            return;
        };
        // guard against cycles in unvalidated graphs
        if !path.insert(id) {
            return;
        }
        let _ = writeln!(out, "{}{}", "\t".repeat(depth), node.task.formatted_id());
        for child in &node.downstream {
            self.write_subtree(out, child, depth + 1, path);
        }
        path.remove(id);
    }
}

impl fmt::Debug for Dag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dag")
            .field("id", &self.id)
            .field("schedule", &self.schedule)
            .field("concurrency", &self.concurrency)
            .field("tasks", &self.order)
            .finish()
    }
}
