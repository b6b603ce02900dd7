//! The persisted orchestration document and its atomic store.
//!
//! [`OrchestrationState`] is the aggregate root mutated in memory during a
//! tick. Only the orchestration driver persists it, through [`StateStore`],
//! at its checkpoints.

use crate::errors::{EngineError, EngineResult};
use crate::lifecycle;
use crate::review::findings::{FinalReport, ReviewFinding};
use crate::task::{Task, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const STATE_FILE_NAME: &str = "AGENT_STATE.json";
pub const DEFAULT_SESSION_NAME: &str = "orchestration";

fn default_spec_path() -> String {
    ".".to_string()
}

fn default_session_name() -> String {
    DEFAULT_SESSION_NAME.to_string()
}

/// One entry per currently blocked task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedItem {
    pub task_id: String,
    pub blocking_reason: String,
    #[serde(default)]
    pub required_resolution: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// Urgency of a pending human decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionPriority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl fmt::Display for DecisionPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        };
        write!(f, "{}", s)
    }
}

/// A decision the engine cannot make and hands to a human.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDecision {
    pub id: String,
    pub task_id: String,
    pub context: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub priority: DecisionPriority,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// The whole orchestration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationState {
    #[serde(default = "default_spec_path")]
    pub spec_path: String,
    #[serde(default = "default_session_name")]
    pub session_name: String,
    /// All tasks; order breaks ties
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub review_findings: Vec<ReviewFinding>,
    #[serde(default)]
    pub final_reports: Vec<FinalReport>,
    #[serde(default)]
    pub blocked_items: Vec<BlockedItem>,
    #[serde(default)]
    pub pending_decisions: Vec<PendingDecision>,
    #[serde(default)]
    pub deferred_fixes: Vec<serde_json::Value>,
    #[serde(default)]
    pub window_mapping: BTreeMap<String, String>,
}

impl Default for OrchestrationState {
    fn default() -> Self {
        Self::new(default_spec_path(), default_session_name())
    }
}

impl OrchestrationState {
    pub fn new(spec_path: impl Into<String>, session_name: impl Into<String>) -> Self {
        Self {
            spec_path: spec_path.into(),
            session_name: session_name.into(),
            tasks: Vec::new(),
            review_findings: Vec::new(),
            final_reports: Vec::new(),
            blocked_items: Vec::new(),
            pending_decisions: Vec::new(),
            deferred_fixes: Vec::new(),
            window_mapping: BTreeMap::new(),
        }
    }

    pub fn with_tasks(mut self, tasks: Vec<Task>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.task_id == task_id)
    }

    fn require_task_mut(&mut self, task_id: &str) -> EngineResult<&mut Task> {
        self.task_mut(task_id).ok_or_else(|| {
            EngineError::validation("task_id", format!("Unknown task: {}", task_id))
        })
    }

    /// Review findings currently recorded for a task.
    pub fn findings_for(&self, task_id: &str) -> Vec<&ReviewFinding> {
        self.review_findings
            .iter()
            .filter(|f| f.task_id == task_id)
            .collect()
    }

    pub fn finding_count(&self, task_id: &str) -> usize {
        self.review_findings
            .iter()
            .filter(|f| f.task_id == task_id)
            .count()
    }

    pub fn final_report_for(&self, task_id: &str) -> Option<&FinalReport> {
        self.final_reports.iter().find(|r| r.task_id == task_id)
    }

    /// Apply a validated lifecycle step, counting the task's findings for
    /// the review gate.
    pub fn transition(&mut self, task_id: &str, to: TaskStatus) -> EngineResult<()> {
        let findings = self.finding_count(task_id);
        let task = self.require_task_mut(task_id)?;
        lifecycle::transition(task, to, findings)
    }

    /// Apply a logged recovery step outside the forward table.
    pub fn restore(&mut self, task_id: &str, to: TaskStatus, reason: &str) -> EngineResult<()> {
        let task = self.require_task_mut(task_id)?;
        lifecycle::restore(task, to, reason)
    }

    /// Record a blocked task, once per task and reason.
    pub fn add_blocked_item(&mut self, task_id: &str, reason: &str, resolution: &str) {
        let exists = self
            .blocked_items
            .iter()
            .any(|b| b.task_id == task_id && b.blocking_reason == reason);
        if !exists {
            self.blocked_items.push(BlockedItem {
                task_id: task_id.to_string(),
                blocking_reason: reason.to_string(),
                required_resolution: resolution.to_string(),
                created_at: Utc::now(),
            });
        }
    }

    pub fn remove_blocked_items(&mut self, task_id: &str) {
        self.blocked_items.retain(|b| b.task_id != task_id);
    }

    /// Whether automation is halted awaiting a human.
    pub fn has_pending_decisions(&self) -> bool {
        !self.pending_decisions.is_empty()
    }

    /// Re-derive every parent's status from its children.
    pub fn update_parent_statuses(&mut self) -> EngineResult<Vec<String>> {
        lifecycle::update_parent_statuses(&mut self.tasks)
    }

    /// Count of tasks per status, in lifecycle order.
    pub fn status_counts(&self) -> Vec<(TaskStatus, usize)> {
        TaskStatus::ALL
            .into_iter()
            .map(|status| {
                let count = self.tasks.iter().filter(|t| t.status == status).count();
                (status, count)
            })
            .filter(|(_, count)| *count > 0)
            .collect()
    }
}

/// Reads and atomically writes the state document.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn temp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }

    /// Load and validate the document.
    pub fn load(&self) -> EngineResult<OrchestrationState> {
        let content = fs::read_to_string(&self.path)
            .map_err(|e| EngineError::state_io(&self.path, format!("Failed to read: {}", e)))?;
        serde_json::from_str(&content).map_err(|e| {
            EngineError::state_io(&self.path, format!("Corrupt state document: {}", e))
        })
    }

    /// Write the document to `<path>.tmp`, then rename it over `<path>`.
    ///
    /// A crash leaves either the previous or the new document, never a
    /// partial one.
    pub fn save(&self, state: &OrchestrationState) -> EngineResult<()> {
        let content = serde_json::to_string_pretty(state)
            .map_err(|e| EngineError::state_io(&self.path, format!("Failed to serialize: {}", e)))?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::state_io(parent, format!("Failed to create directory: {}", e))
            })?;
        }

        let tmp = self.temp_path();
        fs::write(&tmp, content)
            .map_err(|e| EngineError::state_io(&tmp, format!("Failed to write: {}", e)))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| EngineError::state_io(&self.path, format!("Failed to replace: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::findings::Severity;
    use tempfile::tempdir;

    fn make_store() -> (StateStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join(STATE_FILE_NAME);
        (StateStore::new(path), dir)
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let (store, _dir) = make_store();
        let mut state = OrchestrationState::new("/specs/auth", "orch-auth")
            .with_tasks(vec![Task::new("1", "Login").with_writes(&["src/login.rs"])]);
        state
            .window_mapping
            .insert("1".to_string(), "task-1".to_string());

        store.save(&state).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_save_leaves_no_temp_file() {
        let (store, dir) = make_store();
        store.save(&OrchestrationState::default()).unwrap();
        assert!(store.exists());
        assert!(!dir.path().join("AGENT_STATE.json.tmp").exists());
    }

    #[test]
    fn test_missing_file_is_state_io_error() {
        let (store, _dir) = make_store();
        match store.load() {
            Err(EngineError::StateIo { message, .. }) => assert!(message.contains("Failed to read")),
            other => panic!("Expected StateIo, got {:?}", other),
        }
    }

    #[test]
    fn test_corrupt_file_is_state_io_error() {
        let (store, _dir) = make_store();
        fs::write(store.path(), "{ not json").unwrap();
        match store.load() {
            Err(EngineError::StateIo { message, .. }) => assert!(message.contains("Corrupt")),
            other => panic!("Expected StateIo, got {:?}", other),
        }
    }

    #[test]
    fn test_minimal_document_gets_defaults() {
        let (store, _dir) = make_store();
        fs::write(store.path(), r#"{"tasks": [{"task_id": "1"}]}"#).unwrap();
        let state = store.load().unwrap();
        assert_eq!(state.spec_path, ".");
        assert_eq!(state.session_name, DEFAULT_SESSION_NAME);
        assert_eq!(state.tasks.len(), 1);
        assert!(state.review_findings.is_empty());
    }

    #[test]
    fn test_transition_counts_findings() {
        let mut state = OrchestrationState::default()
            .with_tasks(vec![Task::new("1", "x").with_status(TaskStatus::UnderReview)]);
        assert!(state.transition("1", TaskStatus::FinalReview).is_err());

        state
            .review_findings
            .push(ReviewFinding::new("1", "review-1-1", Severity::None));
        state.transition("1", TaskStatus::FinalReview).unwrap();
        assert_eq!(state.task("1").unwrap().status, TaskStatus::FinalReview);
    }

    #[test]
    fn test_transition_unknown_task() {
        let mut state = OrchestrationState::default();
        assert!(matches!(
            state.transition("9", TaskStatus::InProgress),
            Err(EngineError::Validation { .. })
        ));
    }

    #[test]
    fn test_blocked_items_are_deduplicated() {
        let mut state = OrchestrationState::default();
        state.add_blocked_item("1", "fix loop", "resolve");
        state.add_blocked_item("1", "fix loop", "resolve");
        state.add_blocked_item("2", "fix loop", "resolve");
        assert_eq!(state.blocked_items.len(), 2);

        state.remove_blocked_items("1");
        assert_eq!(state.blocked_items.len(), 1);
        assert_eq!(state.blocked_items[0].task_id, "2");
    }

    #[test]
    fn test_status_counts() {
        let state = OrchestrationState::default().with_tasks(vec![
            Task::new("1", "a").with_status(TaskStatus::Completed),
            Task::new("2", "b"),
            Task::new("3", "c"),
        ]);
        assert_eq!(
            state.status_counts(),
            vec![(TaskStatus::NotStarted, 2), (TaskStatus::Completed, 1)]
        );
    }
}
