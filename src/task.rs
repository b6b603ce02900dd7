//! Task records as persisted in the orchestration state document.
//!
//! A [`Task`] is validated once at deserialization: every optional key has a
//! default, enums are closed, and keys this crate does not know about are
//! kept in [`Task::extra`] so they survive a load/save round-trip.

use crate::review::findings::{ReviewFinding, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    NotStarted,
    InProgress,
    PendingReview,
    UnderReview,
    FinalReview,
    Completed,
    Blocked,
    FixRequired,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 8] = [
        Self::NotStarted,
        Self::InProgress,
        Self::PendingReview,
        Self::UnderReview,
        Self::FinalReview,
        Self::Completed,
        Self::Blocked,
        Self::FixRequired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::PendingReview => "pending_review",
            Self::UnderReview => "under_review",
            Self::FinalReview => "final_review",
            Self::Completed => "completed",
            Self::Blocked => "blocked",
            Self::FixRequired => "fix_required",
        }
    }

    /// Check if the task is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Check if the task has finished implementation and sits in the review pipeline.
    pub fn is_in_review(&self) -> bool {
        matches!(
            self,
            Self::PendingReview | Self::UnderReview | Self::FinalReview
        )
    }

    /// Check if work on the task has started but not finished.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::InProgress) || self.is_in_review()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("Unknown task status: {}", s))
    }
}

/// How carefully a task must be reviewed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Criticality {
    #[default]
    Standard,
    Complex,
    SecuritySensitive,
}

impl Criticality {
    /// Number of review findings required before a task may leave review.
    pub fn required_reviews(&self) -> usize {
        match self {
            Self::Standard => 1,
            Self::Complex | Self::SecuritySensitive => 2,
        }
    }
}

impl fmt::Display for Criticality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Standard => "standard",
            Self::Complex => "complex",
            Self::SecuritySensitive => "security-sensitive",
        };
        write!(f, "{}", s)
    }
}

/// Kind of work a task represents; drives the default owner agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    #[default]
    Code,
    Ui,
    Review,
}

impl TaskType {
    /// Worker agent assigned to tasks of this type at init time.
    pub fn default_agent(&self) -> &'static str {
        match self {
            Self::Code => "kiro-cli",
            Self::Ui => "gemini",
            Self::Review => "codex-review",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Code => "code",
            Self::Ui => "ui",
            Self::Review => "review",
        };
        write!(f, "{}", s)
    }
}

/// One past review round of a task in the fix loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewHistoryEntry {
    /// Completed fix attempts when the review happened (0 = initial implementation).
    pub attempt: u32,
    pub severity: Severity,
    #[serde(default)]
    pub findings: Vec<ReviewFinding>,
    #[serde(default = "Utc::now")]
    pub reviewed_at: DateTime<Utc>,
}

/// The unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "type")]
    pub task_type: TaskType,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Back-reference used for lookup only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subtasks: Vec<String>,
    #[serde(default)]
    pub is_optional: bool,
    #[serde(default)]
    pub criticality: Criticality,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_window: Option<String>,

    // File manifest
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub writes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reads: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,

    // Fix loop
    #[serde(default)]
    pub fix_attempts: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub review_history: Vec<ReviewHistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_review_severity: Option<Severity>,
    #[serde(default)]
    pub escalated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,

    // Execution results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_changed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pane_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Keys written by other tools, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Task {
    pub fn new(task_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            description: description.into(),
            task_type: TaskType::default(),
            status: TaskStatus::default(),
            dependencies: Vec::new(),
            parent_id: None,
            subtasks: Vec::new(),
            is_optional: false,
            criticality: Criticality::default(),
            owner_agent: None,
            target_window: None,
            writes: Vec::new(),
            reads: Vec::new(),
            details: Vec::new(),
            fix_attempts: 0,
            review_history: Vec::new(),
            last_review_severity: None,
            escalated: false,
            escalated_at: None,
            original_agent: None,
            blocked_reason: None,
            blocked_by: None,
            output: None,
            error: None,
            exit_code: None,
            files_changed: Vec::new(),
            window_id: None,
            pane_id: None,
            created_at: None,
            completed_at: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_dependencies(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_subtasks(mut self, subtasks: &[&str]) -> Self {
        self.subtasks = subtasks.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_criticality(mut self, criticality: Criticality) -> Self {
        self.criticality = criticality;
        self
    }

    pub fn with_writes(mut self, files: &[&str]) -> Self {
        self.writes = files.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_reads(mut self, files: &[&str]) -> Self {
        self.reads = files.iter().map(|f| f.to_string()).collect();
        self
    }

    /// Set the dispatch routing hints.
    pub fn with_routing(mut self, owner_agent: &str, target_window: &str) -> Self {
        self.owner_agent = Some(owner_agent.to_string());
        self.target_window = Some(target_window.to_string());
        self
    }

    pub fn optional(mut self) -> Self {
        self.is_optional = true;
        self
    }

    /// A task without subtasks; the only kind ever dispatched.
    pub fn is_leaf(&self) -> bool {
        self.subtasks.is_empty()
    }

    /// Whether the task declares which files it reads or writes.
    pub fn has_manifest(&self) -> bool {
        !self.writes.is_empty() || !self.reads.is_empty()
    }

    pub fn clear_blocked(&mut self) {
        self.blocked_reason = None;
        self.blocked_by = None;
    }

    /// Drop the outputs of a dispatch that is being rolled back.
    pub fn clear_execution_output(&mut self) {
        self.window_id = None;
        self.pane_id = None;
        self.exit_code = None;
        self.output = None;
        self.error = None;
        self.completed_at = None;
    }
}
