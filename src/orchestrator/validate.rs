//! Consistency checks over a loaded state document.

use crate::config::ForemanConfig;
use crate::dag::{TaskGraph, check_dependencies};
use crate::orchestrator::OperationReport;
use crate::orchestrator::state::{OrchestrationState, StateStore};
use crate::task::TaskStatus;
use std::collections::HashSet;

/// Every inconsistency in `state`, as user-facing messages.
///
/// Covers:
/// - duplicate or dangling task ids in the hierarchy
/// - missing dependencies and cycles
/// - review gate violations on `final_review` and `completed` tasks
/// - `fix_required` tasks without review history
/// - decisions, blocked items and reports that name unknown tasks
pub fn validate_state(state: &OrchestrationState) -> Vec<String> {
    let mut errors = Vec::new();

    let mut seen = HashSet::new();
    let mut duplicates = false;
    for task in &state.tasks {
        if !seen.insert(task.task_id.as_str()) {
            duplicates = true;
            errors.push(format!("Duplicate task id: {}", task.task_id));
        }
    }
    let known = |id: &str| seen.contains(id);

    for task in &state.tasks {
        for sub in &task.subtasks {
            match state.task(sub) {
                None => errors.push(format!("Task {} lists unknown subtask {}", task.task_id, sub)),
                Some(child) => {
                    if let Some(parent) = &child.parent_id
                        && parent != &task.task_id
                    {
                        errors.push(format!(
                            "Task {} is a subtask of {} but names {} as its parent",
                            sub, task.task_id, parent
                        ));
                    }
                }
            }
        }
        if let Some(parent) = &task.parent_id
            && !known(parent)
        {
            errors.push(format!("Task {} names unknown parent {}", task.task_id, parent));
        }
    }

    if !duplicates && let Ok(graph) = TaskGraph::build(&state.tasks) {
        errors.extend(check_dependencies(&graph).iter().map(ToString::to_string));
    }

    for task in state.tasks.iter().filter(|t| t.is_leaf()) {
        let required = task.criticality.required_reviews();
        match task.status {
            TaskStatus::FinalReview => {
                let recorded = state.finding_count(&task.task_id);
                if recorded < required {
                    errors.push(format!(
                        "Task {} is in final_review with {} of {} required review findings",
                        task.task_id, recorded, required
                    ));
                }
            }
            TaskStatus::Completed => {
                if let Some(report) = state.final_report_for(&task.task_id)
                    && report.finding_count < required
                {
                    errors.push(format!(
                        "Task {} was completed on {} of {} required review findings",
                        task.task_id, report.finding_count, required
                    ));
                }
            }
            TaskStatus::FixRequired if task.review_history.is_empty() => {
                errors.push(format!(
                    "Task {} is fix_required without any review history",
                    task.task_id
                ));
            }
            _ => {}
        }
    }

    for decision in &state.pending_decisions {
        if !known(&decision.task_id) {
            errors.push(format!("Pending decision {} references unknown task {}", decision.id, decision.task_id));
        }
    }
    for item in &state.blocked_items {
        if !known(&item.task_id) {
            errors.push(format!("Blocked item references unknown task {}", item.task_id));
        }
    }
    for report in &state.final_reports {
        if !known(&report.task_id) {
            errors.push(format!("Final report references unknown task {}", report.task_id));
        }
    }

    errors
}

/// Load the state file and validate it.
pub fn validate_state_file(config: &ForemanConfig) -> OperationReport {
    let store = StateStore::new(&config.state_file);
    let state = match store.load() {
        Ok(state) => state,
        Err(e) => return OperationReport::from_error("Failed to load state file", &e),
    };

    let errors = validate_state(&state);
    let mut report = if errors.is_empty() {
        OperationReport::success(format!("State is valid ({} tasks)", state.tasks.len()))
    } else {
        OperationReport::failure(format!("State has {} problem(s)", errors.len()), errors)
    };
    for (status, count) in state.status_counts() {
        report.counts.insert(status.to_string(), count);
    }
    report.warnings = config.validate();
    report.pending_decisions = state.pending_decisions.len();
    report
}
