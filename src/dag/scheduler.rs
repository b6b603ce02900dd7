//! Ready-set computation.
//!
//! A task is ready when it is a leaf, not started, not optional, and every
//! one of its expanded dependencies counts as completed.

use crate::dag::builder::TaskGraph;
use crate::dag::validate::check_dependencies;
use crate::errors::{EngineError, EngineResult};
use crate::task::{Task, TaskStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Which statuses satisfy a dependency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyMode {
    /// Only `completed` satisfies a dependency
    #[default]
    Strict,
    /// `pending_review`, `under_review` and `final_review` also satisfy it
    Legacy,
}

impl DependencyMode {
    /// Whether a task in `status` satisfies its dependents.
    pub fn satisfies(&self, status: TaskStatus) -> bool {
        match self {
            Self::Strict => status == TaskStatus::Completed,
            Self::Legacy => status == TaskStatus::Completed || status.is_in_review(),
        }
    }
}

impl fmt::Display for DependencyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Strict => write!(f, "strict"),
            Self::Legacy => write!(f, "legacy"),
        }
    }
}

impl FromStr for DependencyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "legacy" => Ok(Self::Legacy),
            _ => Err(format!(
                "Invalid dependency mode '{}'. Valid options: strict, legacy",
                s
            )),
        }
    }
}

/// Ids of the tasks that count as completed under `mode`.
pub fn completed_ids(tasks: &[Task], mode: DependencyMode) -> HashSet<String> {
    tasks
        .iter()
        .filter(|t| mode.satisfies(t.status))
        .map(|t| t.task_id.clone())
        .collect()
}

/// Leaf tasks ready for dispatch, in task order.
pub fn ready_tasks<'a>(
    tasks: &'a [Task],
    graph: &TaskGraph,
    completed: &HashSet<String>,
) -> Vec<&'a Task> {
    tasks
        .iter()
        .filter(|task| {
            task.is_leaf()
                && task.status == TaskStatus::NotStarted
                && !task.is_optional
                && graph
                    .expand_dependencies(&task.dependencies)
                    .iter()
                    .all(|dep| completed.contains(dep))
        })
        .collect()
}

/// Validate the graph, then compute the ready set.
///
/// Any cycle or missing dependency aborts the pass: no task is returned.
pub fn schedule(tasks: &[Task], mode: DependencyMode) -> EngineResult<Vec<Task>> {
    let graph = TaskGraph::build(tasks)?;
    let errors = check_dependencies(&graph);
    if !errors.is_empty() {
        return Err(EngineError::Dependency { errors });
    }

    let completed = completed_ids(tasks, mode);
    Ok(ready_tasks(tasks, &graph, &completed)
        .into_iter()
        .cloned()
        .collect())
}
