//! Review finding types.
//!
//! ## Types
//!
//! - [`Severity`]: Verdict severity reported by one reviewer
//! - [`ReviewFinding`]: One reviewer's verdict for a task
//! - [`FinalReport`]: The consolidated verdict for a task
//!
//! ## Example
//!
//! ```
//! use foreman::review::findings::{ReviewFinding, Severity, overall_severity};
//!
//! let findings = vec![
//!     ReviewFinding::new("2.1", "review-2.1-1", Severity::None),
//!     ReviewFinding::new("2.1", "review-2.1-2", Severity::Major)
//!         .with_summary("Race in cache eviction"),
//! ];
//!
//! assert_eq!(overall_severity(&findings), Severity::Major);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Severity of a review verdict.
///
/// Variants are declared from least to most severe so that `Ord` ranks
/// `critical > major > minor > none`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// No issues found.
    #[default]
    None,
    /// Code style or minor improvement.
    Minor,
    /// Significant bug or design flaw.
    Major,
    /// Security vulnerability or data loss risk.
    Critical,
}

impl Severity {
    /// Check if this severity requires remediation (critical or major).
    ///
    /// # Examples
    ///
    /// ```
    /// use foreman::review::findings::Severity;
    ///
    /// assert!(Severity::Critical.is_blocking());
    /// assert!(Severity::Major.is_blocking());
    /// assert!(!Severity::Minor.is_blocking());
    /// ```
    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::Critical | Self::Major)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Minor => "minor",
            Self::Major => "major",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Self::None),
            "minor" => Ok(Self::Minor),
            "major" => Ok(Self::Major),
            "critical" => Ok(Self::Critical),
            other => Err(format!("Unknown severity: {}", other)),
        }
    }
}

/// One reviewer's verdict for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewFinding {
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub reviewer: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl ReviewFinding {
    pub fn new(task_id: impl Into<String>, reviewer: impl Into<String>, severity: Severity) -> Self {
        Self {
            task_id: task_id.into(),
            reviewer: reviewer.into(),
            severity,
            summary: String::new(),
            details: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// The consolidated verdict for a task. At most one exists per task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalReport {
    pub task_id: String,
    pub overall_severity: Severity,
    pub finding_count: usize,
    #[serde(default)]
    pub summary: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// Highest severity present in `findings`; `none` when empty.
pub fn overall_severity(findings: &[ReviewFinding]) -> Severity {
    findings
        .iter()
        .map(|f| f.severity)
        .max()
        .unwrap_or(Severity::None)
}

/// Human-readable summary of a review round.
pub fn generate_summary(findings: &[ReviewFinding], task_id: &str) -> String {
    let count = |severity: Severity| findings.iter().filter(|f| f.severity == severity).count();

    match overall_severity(findings) {
        Severity::Critical => format!(
            "Task {}: CRITICAL issues found ({} critical, {} major) across {} review(s)",
            task_id,
            count(Severity::Critical),
            count(Severity::Major),
            findings.len()
        ),
        Severity::Major => format!(
            "Task {}: {} major issue(s) found across {} review(s)",
            task_id,
            count(Severity::Major),
            findings.len()
        ),
        Severity::Minor => format!(
            "Task {}: passed with {} minor issue(s)",
            task_id,
            count(Severity::Minor)
        ),
        Severity::None => format!(
            "Task {}: passed review with no issues ({} review(s))",
            task_id,
            findings.len()
        ),
    }
}
