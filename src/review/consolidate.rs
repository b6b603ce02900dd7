//! Review consolidation.
//!
//! Once a task holds as many review findings as its criticality requires,
//! the findings are folded into a single [`FinalReport`]. With auto-complete
//! on, a clean or minor verdict completes the task and a critical or major
//! one sends it into the fix loop.

use crate::errors::{EngineError, EngineResult};
use crate::lifecycle;
use crate::orchestrator::state::OrchestrationState;
use crate::review::findings::{FinalReport, ReviewFinding, generate_summary, overall_severity};
use crate::review::fix_loop::{enter_fix_loop, release_dependents, should_enter_fix_loop};
use crate::task::{Task, TaskStatus};
use chrono::Utc;
use tracing::{debug, info};

/// Counts produced by a consolidation pass.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ConsolidationSummary {
    pub reports_created: usize,
    pub completed: Vec<String>,
    pub fix_required: Vec<String>,
    pub message: String,
}

/// Whether a task's review round is ready to be consolidated.
pub fn is_eligible(task: &Task, findings_recorded: usize) -> bool {
    task.is_leaf()
        && matches!(task.status, TaskStatus::FinalReview | TaskStatus::UnderReview)
        && findings_recorded >= task.criticality.required_reviews()
}

/// Fold a task's findings into its final report.
///
/// Returns `None` when the task already has a report for this round.
pub fn consolidate(
    state: &mut OrchestrationState,
    task_id: &str,
    auto_complete: bool,
) -> EngineResult<Option<FinalReport>> {
    if state.final_report_for(task_id).is_some() {
        debug!(task_id, "Final report already exists, skipping");
        return Ok(None);
    }
    if state.task(task_id).is_none() {
        return Err(EngineError::validation(
            "task_id",
            format!("Unknown task: {}", task_id),
        ));
    }

    let findings: Vec<ReviewFinding> = state.findings_for(task_id).into_iter().cloned().collect();
    let severity = overall_severity(&findings);
    let report = FinalReport {
        task_id: task_id.to_string(),
        overall_severity: severity,
        finding_count: findings.len(),
        summary: generate_summary(&findings, task_id),
        created_at: Utc::now(),
    };
    state.final_reports.push(report.clone());
    info!(task_id, %severity, findings = findings.len(), "Review consolidated");

    if !auto_complete {
        if state.task(task_id).map(|t| t.status) == Some(TaskStatus::UnderReview) {
            state.transition(task_id, TaskStatus::FinalReview)?;
        }
        return Ok(Some(report));
    }

    if should_enter_fix_loop(severity) {
        enter_fix_loop(state, task_id, severity, findings)?;
    } else {
        if state.task(task_id).map(|t| t.status) == Some(TaskStatus::UnderReview) {
            state.transition(task_id, TaskStatus::FinalReview)?;
        }
        state.transition(task_id, TaskStatus::Completed)?;
        if let Some(task) = state.task_mut(task_id) {
            task.last_review_severity = Some(severity);
            task.clear_blocked();
        }
        state.remove_blocked_items(task_id);
        release_dependents(state, task_id)?;
    }

    Ok(Some(report))
}

/// Consolidate every eligible task.
pub fn consolidate_reviews(
    state: &mut OrchestrationState,
    auto_complete: bool,
) -> EngineResult<ConsolidationSummary> {
    let eligible: Vec<String> = state
        .tasks
        .iter()
        .filter(|t| is_eligible(t, state.finding_count(&t.task_id)))
        .filter(|t| state.final_report_for(&t.task_id).is_none())
        .map(|t| t.task_id.clone())
        .collect();

    let mut summary = ConsolidationSummary::default();
    if eligible.is_empty() {
        summary.message = "No tasks to consolidate".to_string();
        return Ok(summary);
    }

    for task_id in eligible {
        if consolidate(state, &task_id, auto_complete)?.is_none() {
            continue;
        }
        summary.reports_created += 1;
        match state.task(&task_id).map(|t| t.status) {
            Some(TaskStatus::Completed) => summary.completed.push(task_id),
            Some(TaskStatus::FixRequired) => summary.fix_required.push(task_id),
            _ => {}
        }
    }

    summary.message = format!(
        "Consolidated {} task(s): {} completed, {} sent to fix loop",
        summary.reports_created,
        summary.completed.len(),
        summary.fix_required.len()
    );
    Ok(summary)
}
