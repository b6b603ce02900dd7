//! The `dispatch-batch` tick.
//!
//! 1. Load the state document
//! 2. Run the fix loop and dispatch its fix requests, then checkpoint
//! 3. Compute the ready set, failing fast on dependency errors
//! 4. Verify that every ready task carries its routing fields
//! 5. Partition into conflict-free batches and run them one at a time,
//!    checkpointing after each
//! 6. Re-aggregate parents and checkpoint at the end

use crate::backend::{
    DispatchRequest, ExecutionBackend, ExecutionReport, TaskRequest, TaskResult, agent_to_backend,
};
use crate::config::ForemanConfig;
use crate::dag::schedule;
use crate::errors::{EngineError, EngineResult};
use crate::lifecycle;
use crate::orchestrator::state::{OrchestrationState, StateStore};
use crate::orchestrator::{OperationReport, checkpoint, reference_documents};
use crate::partition::partition;
use crate::review::fix_loop::{
    FixRequest, on_fix_task_complete, process_fix_loop, rollback_fix_dispatch,
};
use crate::task::{Task, TaskStatus};
use chrono::Utc;
use std::collections::HashSet;
use tracing::{error, info, warn};

/// Result keys copied verbatim into the task record.
const METRIC_KEYS: [&str; 4] = ["coverage", "coverage_num", "tests_passed", "tests_failed"];

#[derive(Debug, Default)]
struct Tally {
    fix_dispatched: usize,
    fix_failed: usize,
    dispatched: usize,
    completed: usize,
    failed: usize,
    batches: usize,
    errors: Vec<String>,
}

/// Missing routing fields per ready task, as `"{id}: missing a, b"`.
pub fn find_missing_dispatch_fields(tasks: &[Task]) -> Vec<String> {
    tasks
        .iter()
        .filter_map(|task| {
            let mut missing = Vec::new();
            if task.owner_agent.as_deref().is_none_or(str::is_empty) {
                missing.push("owner_agent");
            }
            if task.target_window.as_deref().is_none_or(str::is_empty) {
                missing.push("target_window");
            }
            (!missing.is_empty())
                .then(|| format!("{}: missing {}", task.task_id, missing.join(", ")))
        })
        .collect()
}

/// Prompt body for an implementation task.
pub fn build_task_content(task: &Task, spec_path: &str) -> String {
    let mut lines = vec![
        format!("Task: {}", task.description),
        String::new(),
        format!("Task ID: {}", task.task_id),
        format!("Type: {}", task.task_type),
        String::new(),
    ];
    lines.extend(reference_documents(spec_path));
    lines.push(String::new());

    if !task.details.is_empty() {
        lines.push("Details:".to_string());
        lines.extend(task.details.iter().map(|d| format!("- {}", d)));
        lines.push(String::new());
    }
    if task.has_manifest() {
        lines.push("Files:".to_string());
        lines.extend(task.writes.iter().map(|f| format!("- writes {}", f)));
        lines.extend(task.reads.iter().map(|f| format!("- reads {}", f)));
        lines.push(String::new());
    }
    lines.join("\n")
}

fn task_request(task: &Task, spec_path: &str, workdir: &str) -> EngineResult<TaskRequest> {
    let agent = task.owner_agent.as_deref().unwrap_or_default();
    Ok(TaskRequest {
        id: task.task_id.clone(),
        backend: agent_to_backend(agent)?.to_string(),
        workdir: workdir.to_string(),
        dependencies: task.dependencies.clone(),
        target_window: task.target_window.clone(),
        content: build_task_content(task, spec_path),
    })
}

fn dispatch_request(
    state: &OrchestrationState,
    config: &ForemanConfig,
    tasks: Vec<TaskRequest>,
    review: bool,
) -> DispatchRequest {
    DispatchRequest {
        tasks,
        session_name: state.session_name.clone(),
        state_file: config.state_file.clone(),
        review,
    }
}

/// Copy a backend result's outputs onto the task record.
pub(crate) fn copy_result_fields(state: &mut OrchestrationState, task_id: &str, result: &TaskResult) {
    let Some(task) = state.task_mut(task_id) else {
        return;
    };
    if result.exit_code.is_some() {
        task.exit_code = result.exit_code;
    }
    if result.output.is_some() {
        task.output = result.output.clone();
    }
    if result.error.is_some() {
        task.error = result.error.clone();
    }
    if !result.files_changed.is_empty() {
        task.files_changed = result.files_changed.clone();
    }
    if result.window_id.is_some() {
        task.window_id = result.window_id.clone();
    }
    if result.pane_id.is_some() {
        task.pane_id = result.pane_id.clone();
    }
    for key in METRIC_KEYS {
        if let Some(value) = result.extra.get(key) {
            task.extra.insert(key.to_string(), value.clone());
        }
    }
    task.completed_at = Some(Utc::now());

    if let Some(window) = &result.window_id {
        state
            .window_mapping
            .insert(task_id.to_string(), window.clone());
    }
}

/// Apply one result to an `in_progress` task.
///
/// A result without a recognised status leaves the task `in_progress`.
pub(crate) fn apply_task_result(
    state: &mut OrchestrationState,
    task_id: &str,
    result: &TaskResult,
) -> EngineResult<()> {
    if result.is_completed() {
        state.transition(task_id, TaskStatus::PendingReview)?;
    } else if result.is_blocked() {
        state.transition(task_id, TaskStatus::Blocked)?;
        if let Some(task) = state.task_mut(task_id) {
            task.blocked_reason = result
                .error
                .clone()
                .or_else(|| Some("Blocked by worker agent".to_string()));
        }
    }
    copy_result_fields(state, task_id, result);
    Ok(())
}

fn result_for<'a>(report: &'a ExecutionReport, task_id: &str) -> Option<&'a TaskResult> {
    report
        .results()
        .find(|r| r.task_id.as_deref() == Some(task_id))
}

/// Apply a batch report, rolling back whatever is still `in_progress` when
/// the batch failed.
fn apply_batch_report(
    state: &mut OrchestrationState,
    batch_ids: &[String],
    report: &ExecutionReport,
) -> EngineResult<()> {
    let batch: HashSet<&str> = batch_ids.iter().map(String::as_str).collect();

    let started: Vec<String> = if report.success {
        batch_ids.to_vec()
    } else {
        report
            .results()
            .filter_map(|r| r.task_id.clone())
            .filter(|id| batch.contains(id.as_str()))
            .collect()
    };

    for task_id in &started {
        if state.task(task_id).map(|t| t.status) == Some(TaskStatus::NotStarted) {
            state.transition(task_id, TaskStatus::InProgress)?;
        }
        if let Some(result) = result_for(report, task_id) {
            apply_task_result(state, task_id, result)?;
        }
    }

    if !report.success {
        rollback_batch(state, batch_ids)?;
    }
    Ok(())
}

/// Return a failed batch's unfinished tasks to `not_started`.
pub fn rollback_batch(state: &mut OrchestrationState, batch_ids: &[String]) -> EngineResult<Vec<String>> {
    let mut rolled_back = Vec::new();
    for task_id in batch_ids {
        let Some(task) = state.task_mut(task_id) else {
            continue;
        };
        if task.status != TaskStatus::InProgress {
            continue;
        }
        lifecycle::restore(task, TaskStatus::NotStarted, "batch dispatch failed")?;
        task.clear_execution_output();
        rolled_back.push(task_id.clone());
    }
    if !rolled_back.is_empty() {
        warn!(tasks = ?rolled_back, "Rolled back failed batch");
    }
    Ok(rolled_back)
}

async fn dispatch_fix(
    state: &mut OrchestrationState,
    config: &ForemanConfig,
    backend: &dyn ExecutionBackend,
    request: &FixRequest,
    tally: &mut Tally,
    previews: &mut Vec<String>,
) -> EngineResult<()> {
    let target_window = state.task(&request.task_id).and_then(|t| t.target_window.clone());
    let task_request = TaskRequest {
        id: request.task_id.clone(),
        backend: request.backend.clone(),
        workdir: config.workdir_string(),
        dependencies: Vec::new(),
        target_window,
        content: request.prompt.clone(),
    };
    let dispatch = dispatch_request(state, config, vec![task_request], false);

    if config.dry_run {
        previews.push(dispatch.heredoc());
        tally.fix_dispatched += 1;
        return Ok(());
    }

    let outcome = backend.execute(&dispatch).await;
    let report = match outcome {
        Ok(report) => report,
        Err(e) => ExecutionReport::failed(1, e.to_string()),
    };
    tally.completed += report.tasks_completed;
    tally.failed += report.tasks_failed;
    tally.errors.extend(report.errors.iter().cloned());

    let result_ok = result_for(&report, &request.task_id)
        .is_none_or(|r| !r.is_blocked() && r.exit_code.is_none_or(|code| code == 0));
    let task_missing = || EngineError::validation("task_id", format!("Unknown task: {}", request.task_id));

    if report.success && result_ok {
        if let Some(result) = result_for(&report, &request.task_id) {
            copy_result_fields(state, &request.task_id, result);
        }
        let task = state.task_mut(&request.task_id).ok_or_else(task_missing)?;
        on_fix_task_complete(task)?;
        tally.fix_dispatched += 1;
    } else {
        let task = state.task_mut(&request.task_id).ok_or_else(task_missing)?;
        rollback_fix_dispatch(task)?;
        tally.fix_failed += 1;
        if report.errors.is_empty() {
            tally
                .errors
                .push(format!("Fix task {} dispatch failed", request.task_id));
        }
        warn!(task_id = %request.task_id, "Fix dispatch failed, rolled back to fix_required");
    }
    Ok(())
}

async fn run(
    state: &mut OrchestrationState,
    store: &StateStore,
    config: &ForemanConfig,
    backend: &dyn ExecutionBackend,
    report: &mut OperationReport,
) -> EngineResult<()> {
    let mut tally = Tally::default();

    // Fix loop first so fixes are not starved by new work
    let fix_outcome = process_fix_loop(state, config.escalation_backend())?;
    tally.errors.extend(fix_outcome.errors.iter().cloned());
    if !fix_outcome.requests.is_empty() {
        info!(count = fix_outcome.requests.len(), "Dispatching fix requests");
    }
    for request in &fix_outcome.requests {
        dispatch_fix(state, config, backend, request, &mut tally, &mut report.previews).await?;
    }
    if !fix_outcome.requests.is_empty() || !fix_outcome.human_fallback.is_empty() {
        checkpoint(store, state, config)?;
    }

    let ready = match schedule(&state.tasks, config.dependency_mode()) {
        Ok(ready) => ready,
        Err(e) => {
            error!(error = %e, "Dependency errors prevent scheduling");
            report.success = false;
            report.message = "Dependency errors prevent scheduling".to_string();
            report.errors.extend(e.messages());
            return Ok(());
        }
    };

    if !ready.is_empty() {
        let missing = find_missing_dispatch_fields(&ready);
        if !missing.is_empty() {
            report.success = false;
            report.message = "Missing required dispatch fields. Populate owner_agent and target_window before dispatch.".to_string();
            report.errors.extend(missing);
            return Ok(());
        }
        let unsupported: Vec<String> = ready
            .iter()
            .filter_map(|t| {
                let agent = t.owner_agent.as_deref().unwrap_or_default();
                agent_to_backend(agent)
                    .err()
                    .map(|_| format!("{}: unsupported owner_agent {}", t.task_id, agent))
            })
            .collect();
        if !unsupported.is_empty() {
            report.success = false;
            report.message = "Unsupported owner_agent on ready tasks".to_string();
            report.errors.extend(unsupported);
            return Ok(());
        }
    }

    let batches = partition(&ready);
    if batches.len() > 1 {
        info!(tasks = ready.len(), batches = batches.len(), "Partitioned ready tasks into conflict-free batches");
    }
    let workdir = config.workdir_string();

    for (index, batch) in batches.iter().enumerate() {
        let batch_ids: Vec<String> = batch.iter().map(|t| t.task_id.clone()).collect();
        info!(batch = index + 1, of = batches.len(), tasks = ?batch_ids, "Dispatching batch");

        let requests = batch
            .iter()
            .map(|task| task_request(task, &state.spec_path, &workdir))
            .collect::<EngineResult<Vec<_>>>()?;
        let dispatch = dispatch_request(state, config, requests, false);
        tally.batches += 1;
        tally.dispatched += batch_ids.len();

        if config.dry_run {
            report.previews.push(dispatch.heredoc());
            continue;
        }

        let exec = match backend.execute(&dispatch).await {
            Ok(exec) => exec,
            Err(e) => {
                error!(batch = index + 1, error = %e, "Batch dispatch failed");
                ExecutionReport::failed(batch_ids.len(), e.to_string())
            }
        };
        tally.completed += exec.tasks_completed;
        tally.failed += exec.tasks_failed;
        tally.errors.extend(exec.errors.iter().cloned());
        if !exec.success {
            error!(batch = index + 1, errors = ?exec.errors, "Batch failed");
        }

        apply_batch_report(state, &batch_ids, &exec)?;
        state.update_parent_statuses()?;
        checkpoint(store, state, config)?;

        if !exec.success {
            report.success = false;
        }
    }

    if !config.dry_run {
        state.update_parent_statuses()?;
        checkpoint(store, state, config)?;
    }

    report.errors.append(&mut tally.errors);
    if tally.fix_failed > 0 {
        report.success = false;
    }
    report.message = summarize(&tally, report.success);
    let counts = [
        ("fix_tasks_dispatched", tally.fix_dispatched),
        ("fix_tasks_failed", tally.fix_failed),
        ("tasks_dispatched", tally.dispatched),
        ("tasks_completed", tally.completed),
        ("tasks_failed", tally.failed),
        ("batches", tally.batches),
    ];
    for (key, value) in counts {
        report.counts.insert(key.to_string(), value);
    }
    Ok(())
}

fn summarize(tally: &Tally, success: bool) -> String {
    if !success {
        if tally.dispatched == 0 && tally.fix_failed > 0 {
            return format!(
                "Fix task dispatch failed: {} failed, {} dispatched",
                tally.fix_failed, tally.fix_dispatched
            );
        }
        return format!(
            "Dispatch partially failed: {} completed, {} failed",
            tally.completed, tally.failed
        );
    }

    let mut parts = Vec::new();
    if tally.fix_dispatched > 0 {
        parts.push(format!("{} fix task(s)", tally.fix_dispatched));
    }
    if tally.dispatched > 0 {
        parts.push(format!(
            "{} new task(s) in {} batch(es)",
            tally.dispatched, tally.batches
        ));
    }
    if parts.is_empty() {
        "No tasks ready for dispatch".to_string()
    } else {
        format!("Dispatched {}", parts.join(", "))
    }
}

/// Run one `dispatch-batch` tick against the state file in `config`.
pub async fn dispatch_batch(config: &ForemanConfig, backend: &dyn ExecutionBackend) -> OperationReport {
    let store = StateStore::new(&config.state_file);
    let mut state = match store.load() {
        Ok(state) => state,
        Err(e) => return OperationReport::from_error("Failed to load state file", &e),
    };

    let mut report = OperationReport::success("");
    report.warnings = config.validate();
    if let Err(e) = run(&mut state, &store, config, backend, &mut report).await {
        error!(error = %e, "Dispatch aborted");
        report.success = false;
        report.message = "Dispatch aborted".to_string();
        report.errors.extend(e.messages());
    }
    report.pending_decisions = state.pending_decisions.len();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DispatchError;
    use crate::backend::mock::MockBackend;
    use crate::review::findings::{ReviewFinding, Severity};
    use crate::task::ReviewHistoryEntry;
    use tempfile::TempDir;

    fn routed(id: &str) -> Task {
        Task::new(id, format!("Task {}", id)).with_routing("kiro-cli", &format!("task-{}", id))
    }

    fn setup(tasks: Vec<Task>) -> (ForemanConfig, StateStore, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("AGENT_STATE.json");
        let store = StateStore::new(&path);
        store
            .save(&OrchestrationState::new("/specs/demo", "orch-demo").with_tasks(tasks))
            .unwrap();
        (ForemanConfig::new(path), store, dir)
    }

    fn status(store: &StateStore, id: &str) -> TaskStatus {
        store.load().unwrap().task(id).unwrap().status
    }

    #[tokio::test]
    async fn test_successful_batch_moves_to_pending_review() {
        let (config, store, _dir) = setup(vec![routed("1"), routed("2").with_dependencies(&["1"])]);
        let backend = MockBackend::new();

        let report = dispatch_batch(&config, &backend).await;
        assert!(report.success, "{:?}", report);
        assert_eq!(report.count("tasks_dispatched"), 1);
        assert_eq!(status(&store, "1"), TaskStatus::PendingReview);
        assert_eq!(status(&store, "2"), TaskStatus::NotStarted);

        let sent = backend.recorded();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].session_name, "orch-demo");
        assert!(sent[0].heredoc().contains("target_window: task-1"));
    }

    #[tokio::test]
    async fn test_result_without_status_stays_in_progress() {
        let (config, store, _dir) = setup(vec![routed("1")]);
        let backend = MockBackend::new().respond(Ok(ExecutionReport {
            success: true,
            task_results: vec![TaskResult::for_task("1").with_status("running")],
            ..Default::default()
        }));

        dispatch_batch(&config, &backend).await;
        assert_eq!(status(&store, "1"), TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn test_conflicting_tasks_go_in_separate_batches() {
        let (config, store, _dir) = setup(vec![
            routed("A").with_writes(&["src/a.py"]),
            routed("B").with_writes(&["src/a.py"]),
        ]);
        let backend = MockBackend::new();

        let report = dispatch_batch(&config, &backend).await;
        assert_eq!(report.count("batches"), 2);
        let sent = backend.recorded();
        assert_eq!(sent[0].task_ids(), vec!["A"]);
        assert_eq!(sent[1].task_ids(), vec!["B"]);
        assert_eq!(status(&store, "B"), TaskStatus::PendingReview);
    }

    #[tokio::test]
    async fn test_failed_batch_rolls_back_unfinished_tasks() {
        let (config, store, _dir) = setup(vec![
            routed("1").with_writes(&["a"]),
            routed("2").with_writes(&["b"]),
            routed("3").with_writes(&["c"]),
        ]);
        let backend = MockBackend::new().respond(Ok(ExecutionReport {
            success: false,
            task_results: vec![
                TaskResult::for_task("1").with_exit_code(0),
                TaskResult::for_task("2").with_exit_code(1),
            ],
            errors: vec!["pane crashed".to_string()],
            ..Default::default()
        }));

        let report = dispatch_batch(&config, &backend).await;
        assert!(!report.success);
        assert_eq!(report.exit_code(), 1);
        assert!(report.errors.contains(&"pane crashed".to_string()));

        let state = store.load().unwrap();
        assert_eq!(state.task("1").unwrap().status, TaskStatus::PendingReview);
        assert_eq!(state.task("2").unwrap().status, TaskStatus::NotStarted);
        assert!(state.task("2").unwrap().exit_code.is_none());
        assert_eq!(state.task("3").unwrap().status, TaskStatus::NotStarted);
    }

    #[tokio::test]
    async fn test_backend_error_leaves_tasks_not_started() {
        let (config, store, _dir) = setup(vec![routed("1")]);
        let backend = MockBackend::new().respond(Err(DispatchError::Timeout(3600)));

        let report = dispatch_batch(&config, &backend).await;
        assert!(!report.success);
        assert!(report.errors[0].contains("timed out"));
        assert_eq!(status(&store, "1"), TaskStatus::NotStarted);
    }

    #[tokio::test]
    async fn test_missing_routing_fields_abort() {
        let (config, store, _dir) = setup(vec![Task::new("1", "x"), routed("2")]);
        let backend = MockBackend::new();

        let report = dispatch_batch(&config, &backend).await;
        assert!(!report.success);
        assert_eq!(report.errors, vec!["1: missing owner_agent, target_window"]);
        assert!(backend.recorded().is_empty());
        assert_eq!(status(&store, "2"), TaskStatus::NotStarted);
    }

    #[tokio::test]
    async fn test_dependency_errors_fail_fast() {
        let (config, _store, _dir) = setup(vec![routed("1").with_dependencies(&["9"])]);
        let backend = MockBackend::new();

        let report = dispatch_batch(&config, &backend).await;
        assert!(!report.success);
        assert!(report.errors[0].contains("missing dependencies: 9"));
        assert!(backend.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_builds_previews_without_saving() {
        let (config, store, _dir) = setup(vec![routed("1")]);
        let config = config.with_dry_run(true);
        let backend = MockBackend::new();

        let report = dispatch_batch(&config, &backend).await;
        assert!(report.success);
        assert_eq!(report.previews.len(), 1);
        assert!(report.previews[0].starts_with("---TASK---\nid: 1"));
        assert!(backend.recorded().is_empty());
        assert_eq!(status(&store, "1"), TaskStatus::NotStarted);
    }

    #[tokio::test]
    async fn test_fix_request_dispatched_before_new_work() {
        let mut failing = routed("1").with_status(TaskStatus::FixRequired);
        failing.last_review_severity = Some(Severity::Major);
        failing.review_history.push(ReviewHistoryEntry {
            attempt: 0,
            severity: Severity::Major,
            findings: vec![ReviewFinding::new("1", "review-1-1", Severity::Major).with_summary("Leak")],
            reviewed_at: Utc::now(),
        });
        let (config, store, _dir) = setup(vec![failing, routed("2")]);
        let backend = MockBackend::new();

        let report = dispatch_batch(&config, &backend).await;
        assert!(report.success, "{:?}", report);
        assert_eq!(report.count("fix_tasks_dispatched"), 1);

        let sent = backend.recorded();
        assert!(sent[0].heredoc().contains("Attempt 1/3"));
        let state = store.load().unwrap();
        let task = state.task("1").unwrap();
        assert_eq!(task.status, TaskStatus::PendingReview);
        assert_eq!(task.fix_attempts, 1);
    }

    #[tokio::test]
    async fn test_failed_fix_dispatch_rolls_back() {
        let mut failing = routed("1").with_status(TaskStatus::FixRequired);
        failing.last_review_severity = Some(Severity::Critical);
        let (config, store, _dir) = setup(vec![failing]);
        let backend = MockBackend::new().respond(Err(DispatchError::Timeout(10)));

        let report = dispatch_batch(&config, &backend).await;
        assert!(!report.success);
        let state = store.load().unwrap();
        assert_eq!(state.task("1").unwrap().status, TaskStatus::FixRequired);
        assert_eq!(state.task("1").unwrap().fix_attempts, 0);
    }

    #[tokio::test]
    async fn test_human_fallback_exits_with_pending_decision() {
        let mut failing = routed("1").with_status(TaskStatus::FixRequired);
        failing.fix_attempts = 3;
        failing.last_review_severity = Some(Severity::Critical);
        let (config, store, _dir) = setup(vec![failing]);
        let backend = MockBackend::new();

        let report = dispatch_batch(&config, &backend).await;
        assert_eq!(report.pending_decisions, 1);
        assert_eq!(report.exit_code(), 2);
        assert_eq!(store.load().unwrap().pending_decisions.len(), 1);
    }

    #[tokio::test]
    async fn test_parent_aggregated_after_batch() {
        let (config, store, _dir) = setup(vec![
            Task::new("1", "parent").with_subtasks(&["1.1", "1.2"]),
            routed("1.1").with_parent("1"),
            routed("1.2").with_parent("1"),
        ]);
        let backend = MockBackend::new();

        dispatch_batch(&config, &backend).await;
        assert_eq!(status(&store, "1"), TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn test_missing_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = ForemanConfig::new(dir.path().join("AGENT_STATE.json"));
        let report = dispatch_batch(&config, &MockBackend::new()).await;
        assert!(!report.success);
        assert_eq!(report.message, "Failed to load state file");
    }

    #[test]
    fn test_task_content_lists_details_and_files() {
        let mut task = routed("3").with_writes(&["src/lib.rs"]);
        task.details = vec!["Use the existing pool".to_string()];
        let content = build_task_content(&task, "/specs/demo");
        assert!(content.contains("Task ID: 3"));
        assert!(content.contains("- Requirements: /specs/demo/requirements.md"));
        assert!(content.contains("- Use the existing pool"));
        assert!(content.contains("- writes src/lib.rs"));
    }
}
