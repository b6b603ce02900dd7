//! Fix-loop controller.
//!
//! A task whose review comes back critical or major enters the fix loop:
//! it moves to `fix_required`, its review round is archived into
//! `review_history`, and everything downstream of it is blocked. Each tick
//! then decides per task whether to retry with the same agent, escalate to
//! a stronger backend, or hand the task to a human.
//!
//! | Completed fix attempts | Critical / major  | Minor / none |
//! |------------------------|-------------------|--------------|
//! | 0, 1                   | Retry             | Pass         |
//! | 2                      | Escalate          | Pass         |
//! | 3 or more              | HumanFallback     | Pass         |

use crate::backend::agent_to_backend;
use crate::dag::{TaskGraph, TaskIndex};
use crate::errors::{EngineError, EngineResult};
use crate::lifecycle;
use crate::orchestrator::state::{DecisionPriority, OrchestrationState, PendingDecision};
use crate::review::findings::{ReviewFinding, Severity, overall_severity};
use crate::task::{ReviewHistoryEntry, Task, TaskStatus};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use tracing::{info, warn};

/// Completed fix attempts after which the next attempt is escalated.
pub const ESCALATION_THRESHOLD: u32 = 2;

/// Completed fix attempts after which a human must step in.
pub const MAX_FIX_ATTEMPTS: u32 = 3;

/// Output longer than this is truncated in fix prompts.
const MAX_OUTPUT_CHARS: usize = 2000;

pub const HUMAN_INTERVENTION_REASON: &str = "human_intervention_required";

/// What the fix loop does next for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixLoopAction {
    Retry,
    Escalate,
    HumanFallback,
    Pass,
}

/// Whether a review at `severity` sends the task into the fix loop.
pub fn should_enter_fix_loop(severity: Severity) -> bool {
    severity.is_blocking()
}

pub fn evaluate_fix_loop_action(fix_attempts: u32, severity: Severity) -> FixLoopAction {
    if !should_enter_fix_loop(severity) {
        FixLoopAction::Pass
    } else if fix_attempts >= MAX_FIX_ATTEMPTS {
        FixLoopAction::HumanFallback
    } else if fix_attempts >= ESCALATION_THRESHOLD {
        FixLoopAction::Escalate
    } else {
        FixLoopAction::Retry
    }
}

/// A fix attempt ready to be dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixRequest {
    pub task_id: String,
    pub backend: String,
    /// 1-based number of the attempt being dispatched.
    pub attempt: u32,
    pub use_escalation: bool,
    /// Critical and major findings of the review that triggered the fix.
    pub findings: Vec<ReviewFinding>,
    pub prompt: String,
}

/// Result of one fix-loop pass over the state.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FixLoopOutcome {
    pub requests: Vec<FixRequest>,
    pub escalated: Vec<String>,
    pub human_fallback: Vec<String>,
    pub errors: Vec<String>,
}

/// Result of applying a completed review round.
#[derive(Debug, Clone, PartialEq)]
pub enum ReviewOutcome {
    /// Review was clean; lists the dependents released back to `not_started`.
    Passed { released: Vec<String> },
    /// Review found blocking issues; lists the dependents newly blocked.
    FixRequired { blocked: Vec<String> },
}

fn unknown_task(task_id: &str) -> EngineError {
    EngineError::validation("task_id", format!("Unknown task: {}", task_id))
}

/// Block every transitive dependent of `task_id` that is not completed yet.
///
/// Returns the ids of the tasks that were newly blocked; each gets one
/// blocked item.
pub fn block_dependents(
    state: &mut OrchestrationState,
    task_id: &str,
    reason: &str,
) -> EngineResult<Vec<String>> {
    let graph = TaskGraph::build(&state.tasks)?;
    let Some(index) = graph.index_of(task_id) else {
        return Err(unknown_task(task_id));
    };

    let mut newly_blocked = Vec::new();
    for dependent in graph.dependents_of(index) {
        let task = &mut state.tasks[dependent];
        if !task.is_leaf() || task.status.is_terminal() || task.status == TaskStatus::Blocked {
            continue;
        }
        lifecycle::transition(task, TaskStatus::Blocked, 0)?;
        task.blocked_reason = Some(reason.to_string());
        task.blocked_by = Some(task_id.to_string());
        newly_blocked.push(task.task_id.clone());
    }

    let resolution = format!("Complete fixes for task {}", task_id);
    for id in &newly_blocked {
        state.add_blocked_item(id, reason, &resolution);
    }
    if !newly_blocked.is_empty() {
        info!(task_id, blocked = ?newly_blocked, "Blocked dependent tasks");
    }
    Ok(newly_blocked)
}

fn fix_wait_reason(task_id: &str) -> String {
    format!("Waiting on fixes for task {}", task_id)
}

/// Whether a task is mid fix loop and so still holds its dependents.
fn holds_dependents(task: &Task) -> bool {
    task.is_leaf()
        && !task.review_history.is_empty()
        && !matches!(task.status, TaskStatus::FinalReview | TaskStatus::Completed)
}

/// Release the tasks blocked by `task_id`.
///
/// A dependent that is still downstream of another task in the fix loop
/// stays blocked and is handed over to that blocker; the rest go back to
/// `not_started`. Returns the released ids.
pub fn release_dependents(state: &mut OrchestrationState, task_id: &str) -> EngineResult<Vec<String>> {
    let graph = TaskGraph::build(&state.tasks)?;
    let blockers: Vec<(TaskIndex, Vec<TaskIndex>)> = state
        .tasks
        .iter()
        .enumerate()
        .filter(|(_, t)| t.task_id != task_id && holds_dependents(t))
        .map(|(index, _)| (index, graph.dependents_of(index)))
        .collect();

    let mut released = Vec::new();
    let mut handed_over = Vec::new();
    for index in 0..state.tasks.len() {
        let task = &state.tasks[index];
        if task.status != TaskStatus::Blocked || task.blocked_by.as_deref() != Some(task_id) {
            continue;
        }

        let remaining = blockers
            .iter()
            .find(|(_, dependents)| dependents.contains(&index))
            .map(|(blocker, _)| &state.tasks[*blocker]);
        if let Some(blocker) = remaining {
            let reason = if blocker.status == TaskStatus::Blocked {
                HUMAN_INTERVENTION_REASON.to_string()
            } else {
                fix_wait_reason(&blocker.task_id)
            };
            let blocker_id = blocker.task_id.clone();
            let task = &mut state.tasks[index];
            task.blocked_reason = Some(reason.clone());
            task.blocked_by = Some(blocker_id.clone());
            handed_over.push((task.task_id.clone(), blocker_id, reason));
            continue;
        }

        let task = &mut state.tasks[index];
        lifecycle::restore(task, TaskStatus::NotStarted, "blocking task passed review")?;
        task.clear_blocked();
        released.push(task.task_id.clone());
    }

    for id in &released {
        state.remove_blocked_items(id);
    }
    for (id, blocker_id, reason) in &handed_over {
        state.remove_blocked_items(id);
        state.add_blocked_item(id, reason, &format!("Complete fixes for task {}", blocker_id));
        info!(task_id = %id, blocked_by = %blocker_id, "Dependent still blocked by another task");
    }
    Ok(released)
}

/// Send a task into the fix loop after a blocking review.
///
/// The current review round (state findings for the task plus `findings`)
/// is archived into a new history entry and the task's final report is
/// dropped, so the next round is reviewed and consolidated afresh.
/// Returns the dependents that were newly blocked.
pub fn enter_fix_loop(
    state: &mut OrchestrationState,
    task_id: &str,
    severity: Severity,
    findings: Vec<ReviewFinding>,
) -> EngineResult<Vec<String>> {
    let recorded = state.finding_count(task_id).max(findings.len());
    let task = state.task_mut(task_id).ok_or_else(|| unknown_task(task_id))?;

    match task.status {
        TaskStatus::FixRequired => {}
        TaskStatus::UnderReview => lifecycle::transition(task, TaskStatus::FixRequired, recorded)?,
        _ => lifecycle::restore(task, TaskStatus::FixRequired, "review found blocking issues")?,
    }

    let mut archived: Vec<ReviewFinding> = Vec::new();
    for finding in state
        .review_findings
        .iter()
        .filter(|f| f.task_id == task_id)
        .chain(findings.iter())
    {
        if !archived.contains(finding) {
            archived.push(finding.clone());
        }
    }
    state.review_findings.retain(|f| f.task_id != task_id);
    state.final_reports.retain(|r| r.task_id != task_id);

    let task = state.task_mut(task_id).ok_or_else(|| unknown_task(task_id))?;
    task.last_review_severity = Some(severity);
    task.review_history.push(ReviewHistoryEntry {
        attempt: task.fix_attempts,
        severity,
        findings: archived,
        reviewed_at: Utc::now(),
    });
    let attempt = task.fix_attempts;

    warn!(task_id, %severity, attempt, "Task entered fix loop");

    let reason = fix_wait_reason(task_id);
    let blocked = block_dependents(state, task_id, &reason)?;
    state.add_blocked_item(
        task_id,
        &format!("Review found {} issues", severity),
        "Fix the review findings and pass re-review",
    );
    Ok(blocked)
}

/// Apply a completed review round to a task.
pub fn on_review_complete(
    state: &mut OrchestrationState,
    task_id: &str,
    findings: Vec<ReviewFinding>,
) -> EngineResult<ReviewOutcome> {
    let severity = overall_severity(&findings);
    if should_enter_fix_loop(severity) {
        let blocked = enter_fix_loop(state, task_id, severity, findings)?;
        return Ok(ReviewOutcome::FixRequired { blocked });
    }

    let recorded = state.finding_count(task_id).max(findings.len());
    let task = state.task_mut(task_id).ok_or_else(|| unknown_task(task_id))?;
    if task.status != TaskStatus::FinalReview {
        lifecycle::transition(task, TaskStatus::FinalReview, recorded)?;
    }
    task.clear_blocked();
    state.remove_blocked_items(task_id);

    let released = release_dependents(state, task_id)?;
    Ok(ReviewOutcome::Passed { released })
}

/// Render a task's past review rounds for an escalation prompt.
pub fn format_review_history(history: &[ReviewHistoryEntry]) -> String {
    if history.is_empty() {
        return "No previous attempts.".to_string();
    }

    let mut out = String::new();
    for entry in history {
        let title = if entry.attempt == 0 {
            "Initial Implementation Review".to_string()
        } else {
            format!("Fix Attempt {} Review", entry.attempt)
        };
        let _ = writeln!(out, "### {} (severity: {})", title, entry.severity.as_str());
        if entry.findings.is_empty() {
            let _ = writeln!(out, "- No findings recorded");
        }
        for finding in &entry.findings {
            let _ = writeln!(out, "- [{}] {}", finding.severity.as_str(), finding.summary);
            if let Some(details) = &finding.details {
                let _ = writeln!(out, "  {}", details);
            }
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}

fn truncate_output(output: &str) -> String {
    if output.chars().count() <= MAX_OUTPUT_CHARS {
        return output.to_string();
    }
    let head: String = output.chars().take(MAX_OUTPUT_CHARS).collect();
    format!("{}...", head)
}

/// Build the prompt sent to the agent for a fix attempt.
pub fn build_fix_prompt(request: &FixRequest, task: &Task) -> String {
    let mut prompt = String::new();
    let _ = writeln!(
        prompt,
        "# Fix Required: Task {} (Attempt {}/{})",
        task.task_id, request.attempt, MAX_FIX_ATTEMPTS
    );
    if request.use_escalation {
        let from = task
            .original_agent
            .as_deref()
            .or(task.owner_agent.as_deref())
            .unwrap_or("previous agent");
        let _ = writeln!(prompt, "\nEscalated from {} after repeated failed fixes.", from);
    }

    let _ = writeln!(prompt, "\n## Task\n{}", task.description);

    let _ = writeln!(prompt, "\n## Review Findings");
    for finding in &request.findings {
        let _ = writeln!(
            prompt,
            "- [{}] {}",
            finding.severity.as_str().to_uppercase(),
            finding.summary
        );
        if let Some(details) = &finding.details {
            let _ = writeln!(prompt, "  {}", details);
        }
    }

    if let Some(output) = task.output.as_deref().filter(|o| !o.is_empty()) {
        let _ = writeln!(prompt, "\n## Original Output\n```\n{}\n```", truncate_output(output));
    }

    if request.use_escalation {
        let _ = writeln!(
            prompt,
            "\n## Previous Fix Attempts History\n{}",
            format_review_history(&task.review_history)
        );
    }

    let _ = writeln!(
        prompt,
        "\n## Instructions\nAddress every finding above without changing unrelated behavior, \
         then summarize the changes you made."
    );
    prompt
}

/// Build the fix request for a task at its current attempt.
///
/// Findings come from the most recent review round in the task's history.
pub fn create_fix_request(task: &Task, backend: &str, use_escalation: bool) -> FixRequest {
    let findings = task
        .review_history
        .last()
        .map(|entry| {
            entry
                .findings
                .iter()
                .filter(|f| f.severity.is_blocking())
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    let mut request = FixRequest {
        task_id: task.task_id.clone(),
        backend: backend.to_string(),
        attempt: task.fix_attempts + 1,
        use_escalation,
        findings,
        prompt: String::new(),
    };
    request.prompt = build_fix_prompt(&request, task);
    request
}

fn current_severity(task: &Task) -> Severity {
    task.last_review_severity
        .or_else(|| task.review_history.last().map(|e| e.severity))
        .unwrap_or(Severity::Major)
}

/// Decide and apply the next fix-loop step for every `fix_required` task.
///
/// Tasks that get a fix request are moved to `in_progress`; the caller
/// dispatches the requests and reports back through
/// [`on_fix_task_complete`] or [`rollback_fix_dispatch`].
pub fn process_fix_loop(
    state: &mut OrchestrationState,
    escalation_backend: &str,
) -> EngineResult<FixLoopOutcome> {
    let mut outcome = FixLoopOutcome::default();
    let candidates: Vec<String> = state
        .tasks
        .iter()
        .filter(|t| t.is_leaf() && t.status == TaskStatus::FixRequired)
        .map(|t| t.task_id.clone())
        .collect();

    for task_id in candidates {
        let task = state.task_mut(&task_id).ok_or_else(|| unknown_task(&task_id))?;
        let severity = current_severity(task);

        match evaluate_fix_loop_action(task.fix_attempts, severity) {
            FixLoopAction::Pass => {}
            FixLoopAction::Retry => {
                let agent = task
                    .owner_agent
                    .clone()
                    .unwrap_or_else(|| task.task_type.default_agent().to_string());
                let backend = match agent_to_backend(&agent) {
                    Ok(backend) => backend,
                    Err(e) => {
                        outcome.errors.push(e.to_string());
                        continue;
                    }
                };
                let request = create_fix_request(task, backend, false);
                lifecycle::transition(task, TaskStatus::InProgress, 0)?;
                info!(task_id = %task_id, attempt = request.attempt, backend, "Retrying fix");
                outcome.requests.push(request);
            }
            FixLoopAction::Escalate => {
                if !task.escalated {
                    task.escalated = true;
                    task.escalated_at = Some(Utc::now());
                    task.original_agent = task.owner_agent.clone();
                }
                let request = create_fix_request(task, escalation_backend, true);
                lifecycle::transition(task, TaskStatus::InProgress, 0)?;
                warn!(
                    task_id = %task_id,
                    attempt = request.attempt,
                    backend = escalation_backend,
                    "Escalating fix to stronger backend"
                );
                outcome.escalated.push(task_id.clone());
                outcome.requests.push(request);
            }
            FixLoopAction::HumanFallback => {
                let attempts = task.fix_attempts;
                lifecycle::transition(task, TaskStatus::Blocked, 0)?;
                task.blocked_reason = Some(HUMAN_INTERVENTION_REASON.to_string());
                task.blocked_by = None;
                let history = format_review_history(&task.review_history);

                block_dependents(state, &task_id, HUMAN_INTERVENTION_REASON)?;
                state.add_blocked_item(
                    &task_id,
                    HUMAN_INTERVENTION_REASON,
                    "Manual fix or decision required",
                );

                let already_pending = state.pending_decisions.iter().any(|d| d.task_id == task_id);
                if !already_pending {
                    state.pending_decisions.push(PendingDecision {
                        id: uuid::Uuid::new_v4().to_string(),
                        task_id: task_id.clone(),
                        context: format!(
                            "HUMAN INTERVENTION REQUIRED: task {} still fails review after {} fix attempts ({}).\n\n{}",
                            task_id, attempts, severity, history
                        ),
                        options: vec![
                            "Fix the task manually and mark it for re-review".to_string(),
                            "Accept the current implementation as is".to_string(),
                            "Abandon the task and its dependents".to_string(),
                        ],
                        priority: DecisionPriority::Critical,
                        created_at: Utc::now(),
                    });
                }
                warn!(task_id = %task_id, attempts, "Fix loop exhausted, human intervention required");
                outcome.human_fallback.push(task_id.clone());
            }
        }
    }

    Ok(outcome)
}

/// Record a finished fix attempt and send the task back to review.
pub fn on_fix_task_complete(task: &mut Task) -> EngineResult<()> {
    lifecycle::transition(task, TaskStatus::PendingReview, 0)?;
    task.fix_attempts += 1;
    info!(task_id = %task.task_id, fix_attempts = task.fix_attempts, "Fix attempt completed");
    Ok(())
}

/// Undo a fix dispatch that failed before completing.
///
/// Only applies to `in_progress` tasks; returns whether the task moved.
/// The attempt counter is left untouched.
pub fn rollback_fix_dispatch(task: &mut Task) -> EngineResult<bool> {
    if task.status != TaskStatus::InProgress {
        return Ok(false);
    }
    lifecycle::restore(task, TaskStatus::FixRequired, "fix dispatch failed")?;
    Ok(true)
}
