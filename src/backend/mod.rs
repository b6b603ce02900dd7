//! Execution backend boundary.
//!
//! The engine hands a batch of task requests to an [`ExecutionBackend`] and
//! gets back an [`ExecutionReport`]. The production backend is the external
//! `codeagent-wrapper` executable ([`CodeagentBackend`]); tests plug in an
//! in-memory backend.
//!
//! ## Input format
//!
//! Each task is sent as one heredoc block; blocks are joined by a blank line:
//!
//! ```text
//! ---TASK---
//! id: 2.1
//! backend: kiro-cli
//! workdir: .
//! dependencies: 1.1,1.2
//! target_window: task-2.1
//! ---CONTENT---
//! Implement the login form
//! ```

mod wrapper;

pub use wrapper::{CodeagentBackend, DEFAULT_BINARY, DEFAULT_TIMEOUT_SECS, resolve_binary};

use crate::errors::{EngineError, EngineResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Worker agent to backend name.
pub const AGENT_TO_BACKEND: &[(&str, &str)] = &[
    ("kiro-cli", "kiro-cli"),
    ("gemini", "gemini"),
    ("codex-review", "codex"),
    ("codex", "codex"),
];

/// Backend that runs tasks for `agent`.
pub fn agent_to_backend(agent: &str) -> EngineResult<&'static str> {
    AGENT_TO_BACKEND
        .iter()
        .find(|(name, _)| *name == agent)
        .map(|(_, backend)| *backend)
        .ok_or_else(|| {
            EngineError::validation(
                "owner_agent",
                format!(
                    "Unknown agent '{}'. Valid agents: kiro-cli, gemini, codex-review, codex",
                    agent
                ),
            )
        })
}

/// Failure to get a report out of the backend at all.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Backend binary '{0}' not found (set CODEAGENT_WRAPPER or [backend].command)")]
    BinaryNotFound(String),

    #[error("Failed to run {binary}: {source}")]
    Io {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Execution timed out after {0} seconds")]
    Timeout(u64),
}

impl From<DispatchError> for EngineError {
    fn from(err: DispatchError) -> Self {
        EngineError::dispatch("backend", err.to_string())
    }
}

/// One task in a dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub id: String,
    pub backend: String,
    pub workdir: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_window: Option<String>,
    pub content: String,
}

impl TaskRequest {
    pub fn to_heredoc(&self) -> String {
        let mut lines = vec![
            "---TASK---".to_string(),
            format!("id: {}", self.id),
            format!("backend: {}", self.backend),
            format!("workdir: {}", self.workdir),
        ];
        if !self.dependencies.is_empty() {
            lines.push(format!("dependencies: {}", self.dependencies.join(",")));
        }
        if let Some(window) = &self.target_window {
            lines.push(format!("target_window: {}", window));
        }
        lines.push("---CONTENT---".to_string());
        lines.push(self.content.clone());
        lines.join("\n")
    }
}

/// A batch sent to the backend in one call.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    pub tasks: Vec<TaskRequest>,
    pub session_name: String,
    pub state_file: PathBuf,
    /// Review batch rather than implementation batch
    pub review: bool,
}

impl DispatchRequest {
    pub fn heredoc(&self) -> String {
        self.tasks
            .iter()
            .map(TaskRequest::to_heredoc)
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn task_ids(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Outcome of one task as reported by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_changed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pane_id: Option<String>,

    // Review verdict
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,

    /// Metrics such as coverage and test counts.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TaskResult {
    pub fn for_task(task_id: &str) -> Self {
        Self {
            task_id: Some(task_id.to_string()),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: &str) -> Self {
        self.status = Some(status.to_string());
        self
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    /// Whether the task finished its work.
    pub fn is_completed(&self) -> bool {
        self.status.as_deref() == Some("completed") || self.exit_code == Some(0)
    }

    pub fn is_blocked(&self) -> bool {
        self.status.as_deref() == Some("blocked")
    }
}

/// The backend's account of a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub tasks_completed: usize,
    #[serde(default)]
    pub tasks_failed: usize,
    #[serde(default)]
    pub task_results: Vec<TaskResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub review_results: Vec<TaskResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl ExecutionReport {
    /// Report for a batch that produced nothing usable.
    pub fn failed(task_count: usize, error: impl Into<String>) -> Self {
        Self {
            success: false,
            tasks_completed: 0,
            tasks_failed: task_count,
            errors: vec![error.into()],
            ..Default::default()
        }
    }

    /// Task and review results together.
    pub fn results(&self) -> impl Iterator<Item = &TaskResult> {
        self.task_results.iter().chain(self.review_results.iter())
    }
}

/// Something that can execute a batch of tasks.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn execute(&self, request: &DispatchRequest) -> Result<ExecutionReport, DispatchError>;
}


#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str) -> TaskRequest {
        TaskRequest {
            id: id.to_string(),
            backend: "kiro-cli".to_string(),
            workdir: ".".to_string(),
            dependencies: Vec::new(),
            target_window: None,
            content: format!("Do {}", id),
        }
    }

    #[test]
    fn test_agent_to_backend() {
        assert_eq!(agent_to_backend("kiro-cli").unwrap(), "kiro-cli");
        assert_eq!(agent_to_backend("gemini").unwrap(), "gemini");
        assert_eq!(agent_to_backend("codex-review").unwrap(), "codex");
        assert_eq!(agent_to_backend("codex").unwrap(), "codex");
        assert!(matches!(
            agent_to_backend("claude"),
            Err(EngineError::Validation { .. })
        ));
    }

    #[test]
    fn test_heredoc_minimal_block() {
        assert_eq!(
            request("1").to_heredoc(),
            "---TASK---\nid: 1\nbackend: kiro-cli\nworkdir: .\n---CONTENT---\nDo 1"
        );
    }

    #[test]
    fn test_heredoc_optional_lines() {
        let mut task = request("2.1");
        task.dependencies = vec!["1.1".into(), "1.2".into()];
        task.target_window = Some("task-2.1".into());
        let text = task.to_heredoc();
        assert!(text.contains("dependencies: 1.1,1.2\ntarget_window: task-2.1\n---CONTENT---"));
    }

    #[test]
    fn test_blocks_joined_by_blank_line() {
        let dispatch = DispatchRequest {
            tasks: vec![request("1"), request("2")],
            session_name: "orch".into(),
            state_file: PathBuf::from("AGENT_STATE.json"),
            review: false,
        };
        let text = dispatch.heredoc();
        assert!(text.contains("Do 1\n\n---TASK---\nid: 2"));
        assert_eq!(dispatch.task_ids(), vec!["1", "2"]);
    }

    #[test]
    fn test_report_parses_with_defaults_and_extras() {
        let json = r#"{
            "tasks_completed": 1,
            "task_results": [
                {"task_id": "1", "status": "completed", "coverage": 91.0, "files_changed": ["a.rs"]}
            ]
        }"#;
        let report: ExecutionReport = serde_json::from_str(json).unwrap();
        assert!(!report.success);
        let result = &report.task_results[0];
        assert!(result.is_completed());
        assert_eq!(result.files_changed, vec!["a.rs"]);
        assert_eq!(result.extra.get("coverage"), Some(&serde_json::json!(91.0)));
    }

    #[test]
    fn test_result_completion_rules() {
        assert!(TaskResult::default().with_exit_code(0).is_completed());
        assert!(!TaskResult::default().with_exit_code(1).is_completed());
        assert!(TaskResult::default().with_status("blocked").is_blocked());
        assert!(!TaskResult::default().with_status("running").is_completed());
    }

    #[test]
    fn test_dispatch_error_converts_to_engine_error() {
        let err: EngineError = DispatchError::Timeout(3600).into();
        assert_eq!(err.location(), "backend");
        assert!(err.to_string().contains("3600"));
    }
}
