//! The `dispatch-reviews` and `consolidate-reviews` operations.

use crate::backend::{DispatchRequest, ExecutionBackend, ExecutionReport, TaskRequest, TaskResult};
use crate::config::ForemanConfig;
use crate::errors::EngineResult;
use crate::orchestrator::state::{OrchestrationState, StateStore};
use crate::orchestrator::{OperationReport, checkpoint, reference_documents};
use crate::review::findings::{ReviewFinding, Severity};
use crate::task::{Task, TaskStatus};
use std::collections::BTreeSet;
use tracing::{error, info, warn};

/// Backend every review runs on.
pub const REVIEW_BACKEND: &str = "codex";

const SUMMARY_LIMIT: usize = 500;

/// `review-{task}-{n}` for reviewer `n` (1-based).
pub fn review_id(task_id: &str, reviewer: usize) -> String {
    format!("review-{}-{}", task_id, reviewer)
}

/// Recover the task id from a review id.
///
/// ```
/// use foreman::orchestrator::reviews::parse_review_task_id;
///
/// assert_eq!(parse_review_task_id("review-2.1-2").as_deref(), Some("2.1"));
/// assert_eq!(parse_review_task_id("2.1"), None);
/// ```
pub fn parse_review_task_id(review_id: &str) -> Option<String> {
    let rest = review_id.strip_prefix("review-")?;
    let (task_id, reviewer) = rest.rsplit_once('-')?;
    if task_id.is_empty() || reviewer.is_empty() || !reviewer.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(task_id.to_string())
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        let cut: String = text.chars().take(limit).collect();
        format!("{}...", cut)
    }
}

/// Prompt body for reviewer `reviewer` of `task`.
pub fn build_review_content(task: &Task, reviewer: usize, spec_path: &str) -> String {
    let mut lines = vec![
        format!("Review Task: {}", task.task_id),
        format!("Reviewer: #{}", reviewer),
        String::new(),
        "Original Task:".to_string(),
        task.description.clone(),
        String::new(),
        "Instructions:".to_string(),
        "Review the implementation for correctness, security and maintainability.".to_string(),
        "Rate the overall severity of the problems you find:".to_string(),
        "- critical: security vulnerability or data loss risk".to_string(),
        "- major: significant bug or design flaw".to_string(),
        "- minor: code style or minor improvement".to_string(),
        "- none: no issues found".to_string(),
        String::new(),
    ];
    lines.extend(reference_documents(spec_path));
    lines.push(String::new());

    if !task.files_changed.is_empty() {
        lines.push("Files Changed:".to_string());
        lines.extend(task.files_changed.iter().map(|f| format!("- {}", f)));
        lines.push(String::new());
    }
    if let Some(output) = task.output.as_deref().filter(|o| !o.trim().is_empty()) {
        lines.push("Implementation Summary:".to_string());
        lines.push(truncate(output, SUMMARY_LIMIT));
        lines.push(String::new());
    }

    lines.push("Output Format:".to_string());
    lines.push(r#"{"severity": "critical|major|minor|none", "summary": "...", "details": "..."}"#.to_string());
    lines.join("\n")
}

fn review_requests(state: &OrchestrationState, config: &ForemanConfig, tasks: &[&Task]) -> Vec<TaskRequest> {
    let workdir = config.workdir_string();
    tasks
        .iter()
        .flat_map(|task| {
            (1..=task.criticality.required_reviews()).map(|n| TaskRequest {
                id: review_id(&task.task_id, n),
                backend: REVIEW_BACKEND.to_string(),
                workdir: workdir.clone(),
                dependencies: vec![task.task_id.clone()],
                target_window: task.target_window.clone(),
                content: build_review_content(task, n, &state.spec_path),
            })
        })
        .collect()
}

fn result_task_id(result: &TaskResult) -> Option<String> {
    if let Some(review_id) = &result.review_id
        && let Some(task_id) = parse_review_task_id(review_id)
    {
        return Some(task_id);
    }
    let id = result.task_id.as_deref()?;
    parse_review_task_id(id).or_else(|| Some(id.to_string()))
}

fn finding_from_result(task_id: &str, result: &TaskResult) -> ReviewFinding {
    let reviewer = result
        .review_id
        .clone()
        .or_else(|| result.task_id.clone().filter(|id| id != task_id))
        .unwrap_or_else(|| review_id(task_id, 1));

    let severity = match result.severity.as_deref() {
        None => Severity::None,
        Some(raw) => raw.parse().unwrap_or_else(|e: String| {
            warn!(task_id, reviewer = %reviewer, "{}; treating as none", e);
            Severity::None
        }),
    };
    let summary = result
        .summary
        .clone()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "Review completed".to_string());

    let mut finding = ReviewFinding::new(task_id, reviewer, severity).with_summary(summary);
    finding.details = result.details.clone();
    finding
}

/// Record a reviewer's finding once per reviewer and task.
fn record_finding(state: &mut OrchestrationState, finding: ReviewFinding) -> bool {
    let duplicate = state
        .review_findings
        .iter()
        .any(|f| f.task_id == finding.task_id && f.reviewer == finding.reviewer);
    if duplicate {
        return false;
    }
    state.review_findings.push(finding);
    true
}

/// Apply a review batch report: advance reviewed tasks and store findings.
fn apply_review_report(
    state: &mut OrchestrationState,
    task_ids: &[String],
    report: &ExecutionReport,
) -> EngineResult<usize> {
    let pending: BTreeSet<&str> = task_ids.iter().map(String::as_str).collect();
    let reviewed: BTreeSet<String> = report.results().filter_map(result_task_id).collect();

    let advancing: Vec<String> = if report.success {
        task_ids.to_vec()
    } else {
        reviewed
            .iter()
            .filter(|id| pending.contains(id.as_str()))
            .cloned()
            .collect()
    };

    for task_id in &advancing {
        if state.task(task_id).map(|t| t.status) == Some(TaskStatus::PendingReview) {
            state.transition(task_id, TaskStatus::UnderReview)?;
        }
    }

    let mut recorded = 0;
    for result in report.results() {
        let Some(task_id) = result_task_id(result) else {
            warn!(task_id = ?result.task_id, review_id = ?result.review_id, "Review result without a task id, skipping");
            continue;
        };
        if !advancing.contains(&task_id) {
            continue;
        }
        if record_finding(state, finding_from_result(&task_id, result)) {
            recorded += 1;
        }
    }

    for task_id in &advancing {
        let Some(task) = state.task(task_id) else {
            continue;
        };
        let required = task.criticality.required_reviews();
        if task.status == TaskStatus::UnderReview && state.finding_count(task_id) >= required {
            state.transition(task_id, TaskStatus::FinalReview)?;
        }
    }
    Ok(recorded)
}

async fn run_reviews(
    state: &mut OrchestrationState,
    store: &StateStore,
    config: &ForemanConfig,
    backend: &dyn ExecutionBackend,
    report: &mut OperationReport,
) -> EngineResult<()> {
    let pending: Vec<&Task> = state
        .tasks
        .iter()
        .filter(|t| t.is_leaf() && t.status == TaskStatus::PendingReview)
        .collect();
    if pending.is_empty() {
        report.message = "No tasks pending review".to_string();
        return Ok(());
    }

    let task_ids: Vec<String> = pending.iter().map(|t| t.task_id.clone()).collect();
    let requests = review_requests(state, config, &pending);
    let review_count = requests.len();
    let dispatch = DispatchRequest {
        tasks: requests,
        session_name: state.session_name.clone(),
        state_file: config.state_file.clone(),
        review: true,
    };
    report.counts.insert("tasks_reviewed".to_string(), task_ids.len());
    report.counts.insert("reviews_dispatched".to_string(), review_count);

    if config.dry_run {
        report.previews.push(dispatch.heredoc());
        report.message = format!("Dispatched {} reviews for {} tasks", review_count, task_ids.len());
        return Ok(());
    }

    info!(reviews = review_count, tasks = task_ids.len(), "Dispatching reviews");
    let exec = match backend.execute(&dispatch).await {
        Ok(exec) => exec,
        Err(e) => {
            error!(error = %e, "Review dispatch failed");
            ExecutionReport::failed(review_count, e.to_string())
        }
    };
    report.errors.extend(exec.errors.iter().cloned());

    let recorded = apply_review_report(state, &task_ids, &exec)?;
    report.counts.insert("findings_recorded".to_string(), recorded);
    state.update_parent_statuses()?;
    checkpoint(store, state, config)?;

    if exec.success {
        report.message = format!("Dispatched {} reviews for {} tasks", review_count, task_ids.len());
    } else {
        report.success = false;
        report.message = format!("Review dispatch failed for {} tasks", task_ids.len());
    }
    Ok(())
}

/// Dispatch reviewers for every leaf task in `pending_review`.
pub async fn dispatch_reviews(config: &ForemanConfig, backend: &dyn ExecutionBackend) -> OperationReport {
    let store = StateStore::new(&config.state_file);
    let mut state = match store.load() {
        Ok(state) => state,
        Err(e) => return OperationReport::from_error("Failed to load state file", &e),
    };

    let mut report = OperationReport::success("");
    report.warnings = config.validate();
    if let Err(e) = run_reviews(&mut state, &store, config, backend, &mut report).await {
        error!(error = %e, "Review dispatch aborted");
        report.success = false;
        report.message = "Review dispatch aborted".to_string();
        report.errors.extend(e.messages());
    }
    report.pending_decisions = state.pending_decisions.len();
    report
}

/// Consolidate every review round that has collected enough findings.
pub fn consolidate_reviews(config: &ForemanConfig) -> OperationReport {
    let store = StateStore::new(&config.state_file);
    let mut state = match store.load() {
        Ok(state) => state,
        Err(e) => return OperationReport::from_error("Failed to load state file", &e),
    };

    let result = crate::review::consolidate_reviews(&mut state, config.auto_complete())
        .and_then(|summary| {
            state.update_parent_statuses()?;
            checkpoint(&store, &state, config)?;
            Ok(summary)
        });

    let mut report = match result {
        Ok(summary) => OperationReport::success(summary.message)
            .with_count("reports_created", summary.reports_created)
            .with_count("completed", summary.completed.len())
            .with_count("fix_required", summary.fix_required.len()),
        Err(e) => {
            error!(error = %e, "Consolidation failed");
            OperationReport::from_error("Consolidation failed", &e)
        }
    };
    report.warnings = config.validate();
    report.pending_decisions = state.pending_decisions.len();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DispatchError;
    use crate::backend::mock::MockBackend;
    use crate::task::Criticality;
    use tempfile::TempDir;

    fn setup(tasks: Vec<Task>) -> (ForemanConfig, StateStore, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("AGENT_STATE.json");
        let store = StateStore::new(&path);
        store
            .save(&OrchestrationState::new("/specs/demo", "orch-demo").with_tasks(tasks))
            .unwrap();
        (ForemanConfig::new(path), store, dir)
    }

    fn implemented(id: &str) -> Task {
        let mut task = Task::new(id, format!("Task {}", id))
            .with_status(TaskStatus::PendingReview)
            .with_routing("kiro-cli", &format!("task-{}", id));
        task.output = Some("Implemented the handler".to_string());
        task.files_changed = vec!["src/handler.rs".to_string()];
        task
    }

    fn verdict(review_id: &str, severity: &str) -> TaskResult {
        TaskResult {
            review_id: Some(review_id.to_string()),
            severity: Some(severity.to_string()),
            summary: Some(format!("{} verdict", severity)),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_review_task_id() {
        assert_eq!(parse_review_task_id("review-3-1").as_deref(), Some("3"));
        assert_eq!(parse_review_task_id("review-1.2.3-10").as_deref(), Some("1.2.3"));
        assert_eq!(parse_review_task_id("review-3-x"), None);
        assert_eq!(parse_review_task_id("review--1"), None);
    }

    #[test]
    fn test_review_content() {
        let mut task = implemented("4");
        task.output = Some("x".repeat(600));
        let content = build_review_content(&task, 2, "/specs/demo");
        assert!(content.starts_with("Review Task: 4\nReviewer: #2"));
        assert!(content.contains("- src/handler.rs"));
        assert!(content.contains(&format!("{}...", "x".repeat(500))));
        assert!(!content.contains(&"x".repeat(501)));
        assert!(content.contains(r#""severity": "critical|major|minor|none""#));
    }

    #[tokio::test]
    async fn test_reviewer_count_follows_criticality() {
        let (config, _store, _dir) = setup(vec![
            implemented("1"),
            implemented("2").with_criticality(Criticality::SecuritySensitive),
        ]);
        let backend = MockBackend::new().respond(Ok(ExecutionReport {
            success: true,
            ..Default::default()
        }));

        let report = dispatch_reviews(&config, &backend).await;
        assert_eq!(report.message, "Dispatched 3 reviews for 2 tasks");
        let sent = backend.recorded();
        assert!(sent[0].review);
        assert_eq!(sent[0].task_ids(), vec!["review-1-1", "review-2-1", "review-2-2"]);
        assert_eq!(sent[0].tasks[0].backend, REVIEW_BACKEND);
        assert_eq!(sent[0].tasks[0].dependencies, vec!["1"]);
    }

    #[tokio::test]
    async fn test_findings_recorded_and_gate_applied() {
        let (config, store, _dir) = setup(vec![
            implemented("1"),
            implemented("2").with_criticality(Criticality::Complex),
        ]);
        let backend = MockBackend::new().respond(Ok(ExecutionReport {
            success: true,
            review_results: vec![verdict("review-1-1", "minor"), verdict("review-2-1", "major")],
            ..Default::default()
        }));

        let report = dispatch_reviews(&config, &backend).await;
        assert!(report.success);
        assert_eq!(report.count("findings_recorded"), 2);

        let state = store.load().unwrap();
        assert_eq!(state.task("1").unwrap().status, TaskStatus::FinalReview);
        // One of two required findings
        assert_eq!(state.task("2").unwrap().status, TaskStatus::UnderReview);
        let finding = state.findings_for("2")[0];
        assert_eq!(finding.reviewer, "review-2-1");
        assert_eq!(finding.severity, Severity::Major);
    }

    #[tokio::test]
    async fn test_unknown_severity_defaults_to_none() {
        let (config, store, _dir) = setup(vec![implemented("1")]);
        let mut result = verdict("review-1-1", "catastrophic");
        result.summary = None;
        let backend = MockBackend::new().respond(Ok(ExecutionReport {
            success: true,
            review_results: vec![result],
            ..Default::default()
        }));

        dispatch_reviews(&config, &backend).await;
        let state = store.load().unwrap();
        let finding = state.findings_for("1")[0];
        assert_eq!(finding.severity, Severity::None);
        assert_eq!(finding.summary, "Review completed");
    }

    #[tokio::test]
    async fn test_partial_failure_advances_only_reviewed_tasks() {
        let (config, store, _dir) = setup(vec![implemented("1"), implemented("2")]);
        let backend = MockBackend::new().respond(Ok(ExecutionReport {
            success: false,
            review_results: vec![verdict("review-1-1", "none")],
            errors: vec!["reviewer 2 crashed".to_string()],
            ..Default::default()
        }));

        let report = dispatch_reviews(&config, &backend).await;
        assert!(!report.success);
        assert_eq!(report.message, "Review dispatch failed for 2 tasks");
        let state = store.load().unwrap();
        assert_eq!(state.task("1").unwrap().status, TaskStatus::FinalReview);
        assert_eq!(state.task("2").unwrap().status, TaskStatus::PendingReview);
    }

    #[tokio::test]
    async fn test_backend_error_leaves_tasks_pending() {
        let (config, store, _dir) = setup(vec![implemented("1")]);
        let backend = MockBackend::new().respond(Err(DispatchError::BinaryNotFound("codeagent-wrapper".into())));

        let report = dispatch_reviews(&config, &backend).await;
        assert!(!report.success);
        assert_eq!(store.load().unwrap().task("1").unwrap().status, TaskStatus::PendingReview);
    }

    #[tokio::test]
    async fn test_nothing_pending() {
        let (config, _store, _dir) = setup(vec![Task::new("1", "x")]);
        let backend = MockBackend::new();
        let report = dispatch_reviews(&config, &backend).await;
        assert!(report.success);
        assert_eq!(report.message, "No tasks pending review");
        assert!(backend.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_previews_reviews() {
        let (config, store, _dir) = setup(vec![implemented("1")]);
        let config = config.with_dry_run(true);
        let report = dispatch_reviews(&config, &MockBackend::new()).await;
        assert!(report.previews[0].contains("id: review-1-1"));
        assert_eq!(store.load().unwrap().task("1").unwrap().status, TaskStatus::PendingReview);
    }

    #[test]
    fn test_consolidate_operation_completes_clean_task() {
        let (config, store, _dir) = setup(vec![
            Task::new("1", "x").with_status(TaskStatus::FinalReview),
            Task::new("2", "y").with_dependencies(&["1"]),
        ]);
        let mut state = store.load().unwrap();
        state
            .review_findings
            .push(ReviewFinding::new("1", "review-1-1", Severity::Minor));
        store.save(&state).unwrap();

        let report = consolidate_reviews(&config);
        assert!(report.success);
        assert_eq!(report.count("completed"), 1);
        assert_eq!(report.message, "Consolidated 1 task(s): 1 completed, 0 sent to fix loop");
        assert_eq!(store.load().unwrap().task("1").unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn test_consolidate_operation_sends_blocking_task_to_fix_loop() {
        let (config, store, _dir) = setup(vec![
            Task::new("1", "x").with_status(TaskStatus::FinalReview),
            Task::new("2", "y").with_dependencies(&["1"]),
        ]);
        let mut state = store.load().unwrap();
        state
            .review_findings
            .push(ReviewFinding::new("1", "review-1-1", Severity::Critical));
        store.save(&state).unwrap();

        let report = consolidate_reviews(&config);
        assert_eq!(report.count("fix_required"), 1);
        let state = store.load().unwrap();
        assert_eq!(state.task("1").unwrap().status, TaskStatus::FixRequired);
        assert_eq!(state.task("2").unwrap().status, TaskStatus::Blocked);
    }

    #[test]
    fn test_consolidate_nothing_eligible() {
        let (config, _store, _dir) = setup(vec![Task::new("1", "x")]);
        let report = consolidate_reviews(&config);
        assert!(report.success);
        assert_eq!(report.message, "No tasks to consolidate");
    }
}
