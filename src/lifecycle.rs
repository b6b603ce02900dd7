//! Task lifecycle state machine.
//!
//! Forward progress goes through [`transition`], which rejects every edge
//! outside the table below and enforces the review-count gate. Recovery
//! operations (batch rollback, unblocking, fix-loop re-entry) use
//! [`restore`], which is logged and refuses to touch parent tasks.
//!
//! | From             | Allowed targets                            |
//! |------------------|--------------------------------------------|
//! | `not_started`    | `in_progress`, `blocked`                   |
//! | `in_progress`    | `pending_review`, `blocked`                |
//! | `pending_review` | `under_review`, `blocked`                  |
//! | `under_review`   | `final_review`, `blocked`, `fix_required`  |
//! | `final_review`   | `completed`, `blocked`                     |
//! | `fix_required`   | `in_progress`, `blocked`                   |
//! | `blocked`        | `in_progress`, `fix_required`              |
//! | `completed`      | (terminal)                                 |

use crate::dag::TaskGraph;
use crate::errors::{EngineError, EngineResult};
use crate::task::{Task, TaskStatus};
use chrono::Utc;
use tracing::{debug, info};

/// Statuses reachable from `from` in one step.
pub fn allowed_transitions(from: TaskStatus) -> &'static [TaskStatus] {
    use TaskStatus::*;
    match from {
        NotStarted => &[InProgress, Blocked],
        InProgress => &[PendingReview, Blocked],
        PendingReview => &[UnderReview, Blocked],
        UnderReview => &[FinalReview, Blocked, FixRequired],
        FinalReview => &[Completed, Blocked],
        FixRequired => &[InProgress, Blocked],
        Blocked => &[InProgress, FixRequired],
        Completed => &[],
    }
}

pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
    allowed_transitions(from).contains(&to)
}

/// Reject leaving `under_review` with fewer findings than the task's
/// criticality requires.
pub fn check_review_gate(task: &Task, findings_recorded: usize) -> EngineResult<()> {
    let required = task.criticality.required_reviews();
    if findings_recorded < required {
        return Err(EngineError::validation(
            format!("{}.review_findings", task.task_id),
            format!(
                "{} task requires {} review finding(s), found {}",
                task.criticality, required, findings_recorded
            ),
        ));
    }
    Ok(())
}

/// Apply a forward lifecycle step.
///
/// `findings_recorded` is the number of review findings currently held for
/// the task; it is only consulted when leaving `under_review` for
/// `final_review` or `fix_required`.
pub fn transition(task: &mut Task, to: TaskStatus, findings_recorded: usize) -> EngineResult<()> {
    let from = task.status;
    if !task.is_leaf() || !can_transition(from, to) {
        return Err(EngineError::Transition {
            task_id: task.task_id.clone(),
            from,
            to,
        });
    }

    if from == TaskStatus::UnderReview
        && matches!(to, TaskStatus::FinalReview | TaskStatus::FixRequired)
    {
        check_review_gate(task, findings_recorded)?;
    }

    debug!(task_id = %task.task_id, %from, %to, "Task transition");
    task.status = to;
    if to == TaskStatus::Completed {
        task.completed_at = Some(Utc::now());
    }
    Ok(())
}

/// Move a task outside the forward table as part of a recovery operation.
///
/// Used for rollbacks after failed dispatches, unblocking dependents and
/// re-entering the fix loop from review. Parents are never restored; their
/// status is derived by [`update_parent_statuses`].
pub fn restore(task: &mut Task, to: TaskStatus, reason: &str) -> EngineResult<()> {
    let from = task.status;
    if !task.is_leaf() || from == TaskStatus::Completed {
        return Err(EngineError::Transition {
            task_id: task.task_id.clone(),
            from,
            to,
        });
    }
    if from != to {
        info!(task_id = %task.task_id, %from, %to, reason, "Task status restored");
        task.status = to;
    }
    Ok(())
}

/// Derive a parent's status from its direct children.
///
/// Precedence: all completed, then any blocked, then any fix_required, then
/// any in flight (`in_progress` or in review), else not started.
pub fn aggregate_status<I>(children: I) -> TaskStatus
where
    I: IntoIterator<Item = TaskStatus>,
{
    let statuses: Vec<TaskStatus> = children.into_iter().collect();
    if statuses.is_empty() {
        return TaskStatus::NotStarted;
    }
    if statuses.iter().all(|s| *s == TaskStatus::Completed) {
        TaskStatus::Completed
    } else if statuses.contains(&TaskStatus::Blocked) {
        TaskStatus::Blocked
    } else if statuses.contains(&TaskStatus::FixRequired) {
        TaskStatus::FixRequired
    } else if statuses.iter().any(|s| s.is_active()) {
        TaskStatus::InProgress
    } else {
        TaskStatus::NotStarted
    }
}

/// Recompute every parent's status from its children, deepest parents
/// first so nested hierarchies settle in one pass.
///
/// Returns the ids of the parents whose status changed.
pub fn update_parent_statuses(tasks: &mut [Task]) -> EngineResult<Vec<String>> {
    let graph = TaskGraph::build(tasks)?;
    let mut changed = Vec::new();

    for parent in graph.parents_deepest_first() {
        let children = graph.children(parent);
        if children.is_empty() {
            continue;
        }
        let status = aggregate_status(children.iter().map(|&c| tasks[c].status));
        let task = &mut tasks[parent];
        if task.status != status {
            debug!(task_id = %task.task_id, from = %task.status, to = %status, "Parent status aggregated");
            task.status = status;
            task.completed_at = (status == TaskStatus::Completed).then(Utc::now);
            changed.push(task.task_id.clone());
        }
    }

    Ok(changed)
}
