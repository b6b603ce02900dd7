//! `tasks.md` parser.
//!
//! Task lines are markdown checkboxes followed by a dotted id:
//!
//! ```text
//! - [ ] 1. Set up the database layer
//!   - Create the connection pool
//!   - Depends on: 0
//! - [x] 1.1 Schema migrations
//! - [ ]* 1.2 Property tests for the pool
//! ```
//!
//! The checkbox marker gives the initial status, a `*` after it marks the
//! task optional, and the lines that follow (until the next task) are its
//! details. Hierarchy comes from the dotted id.

use crate::dag::extract_dependencies;
use crate::task::{Criticality, Task, TaskStatus, TaskType};
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

static CHECKBOX_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[-*]\s*\[[xX\s~-]\]").unwrap());

static TASK_LINE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[-*]\s*\[([xX\s~-])\](\*)?\s*(\d+(?:\.\d+)*\.?)\s+(.+)$").unwrap()
});

const UI_KEYWORDS: &[&str] = &[
    "ui", "frontend", "component", "form", "page", "style", "css", "react", "vue",
];

const SECURITY_KEYWORDS: &[&str] = &[
    "security", "auth", "password", "token", "encrypt", "credential", "secret",
];

const COMPLEX_KEYWORDS: &[&str] = &["refactor", "migration", "integration", "architecture"];

/// A malformed line in `tasks.md`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("tasks.md:{line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

fn status_for_marker(marker: &str) -> TaskStatus {
    match marker {
        "x" | "X" => TaskStatus::Completed,
        "-" => TaskStatus::InProgress,
        "~" => TaskStatus::Blocked,
        _ => TaskStatus::NotStarted,
    }
}

fn searchable_text(task: &Task) -> String {
    format!("{} {}", task.description, task.details.join(" ")).to_lowercase()
}

/// Classify a task from its description and details.
pub fn detect_task_type(task: &Task) -> TaskType {
    let text = searchable_text(task);
    if text.contains("review") && (text.contains("property test") || text.contains("audit")) {
        TaskType::Review
    } else if UI_KEYWORDS.iter().any(|k| text.contains(k)) {
        TaskType::Ui
    } else {
        TaskType::Code
    }
}

/// Initial criticality from security and complexity keywords.
pub fn detect_criticality(task: &Task) -> Criticality {
    let text = searchable_text(task);
    if SECURITY_KEYWORDS.iter().any(|k| text.contains(k)) {
        Criticality::SecuritySensitive
    } else if COMPLEX_KEYWORDS.iter().any(|k| text.contains(k)) {
        Criticality::Complex
    } else {
        Criticality::Standard
    }
}

/// Parent id implied by a dotted task id (`2.1.3` -> `2.1`).
pub fn parent_of(task_id: &str) -> Option<&str> {
    task_id.rsplit_once('.').map(|(parent, _)| parent)
}

fn finish(mut task: Task) -> Task {
    task.task_type = detect_task_type(&task);
    task.criticality = detect_criticality(&task);
    task.dependencies = extract_dependencies(&task.details);
    task
}

/// Parse `tasks.md` into tasks in file order.
///
/// Headings and blank lines are skipped. Every malformed checkbox line is
/// reported; the tasks are only usable when the error list is empty.
pub fn parse_tasks(content: &str) -> (Vec<Task>, Vec<ParseError>) {
    let mut tasks: Vec<Task> = Vec::new();
    let mut errors = Vec::new();
    let mut current: Option<Task> = None;
    let mut orphans: Vec<(usize, String, String)> = Vec::new();

    for (index, line) in content.lines().enumerate() {
        let stripped = line.trim();
        if stripped.is_empty() || stripped.starts_with('#') {
            continue;
        }

        if CHECKBOX_REGEX.is_match(stripped) {
            if let Some(done) = current.take() {
                tasks.push(finish(done));
            }
            let Some(caps) = TASK_LINE_REGEX.captures(stripped) else {
                errors.push(ParseError {
                    line: index + 1,
                    message: format!("Invalid task format: {}", stripped),
                });
                continue;
            };

            let task_id = caps[3].trim_end_matches('.').to_string();
            if tasks.iter().any(|t| t.task_id == task_id) {
                errors.push(ParseError {
                    line: index + 1,
                    message: format!("Duplicate task id: {}", task_id),
                });
                continue;
            }

            let mut task = Task::new(task_id.clone(), caps[4].trim()).with_status(status_for_marker(&caps[1]));
            task.is_optional = caps.get(2).is_some();
            if let Some(parent_id) = parent_of(&task_id) {
                task.parent_id = Some(parent_id.to_string());
                match tasks.iter_mut().find(|t| t.task_id == parent_id) {
                    Some(parent) => parent.subtasks.push(task_id.clone()),
                    None => orphans.push((index + 1, task_id.clone(), parent_id.to_string())),
                }
            }
            current = Some(task);
        } else if let Some(task) = current.as_mut() {
            let detail = stripped.strip_prefix('-').map(str::trim).unwrap_or(stripped);
            task.details.push(detail.to_string());
        }
    }

    if let Some(done) = current.take() {
        tasks.push(finish(done));
    }

    for (line, task_id, parent_id) in orphans {
        let message = if tasks.iter().any(|t| t.task_id == parent_id) {
            format!("Task {} appears before its parent task {}", task_id, parent_id)
        } else {
            format!("Task {} has no parent task {}", task_id, parent_id)
        };
        errors.push(ParseError { line, message });
    }
    errors.sort_by_key(|e| e.line);
    (tasks, errors)
}
