//! Dependency extraction from free-text task annotations.
//!
//! Task details such as `"Dependencies: 1, 2"`, `"Depends on: task-1.1"` or
//! `"After: 3"` are scanned for task ids.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

static ANNOTATION_REGEXES: LazyLock<[Regex; 3]> = LazyLock::new(|| {
    [
        Regex::new(r"(?i)dependenc(?:y|ies)[:\s]+([^\n]+)").unwrap(),
        Regex::new(r"(?i)depends?\s+on[:\s]+([^\n]+)").unwrap(),
        Regex::new(r"(?i)\bafter:\s*([^\n]+)").unwrap(),
    ]
});

static TASK_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:task[-_])?(\d+(?:\.\d+)*)").unwrap());

/// Extract referenced task ids from annotation lines.
///
/// Ids are returned in order of first appearance, without duplicates.
pub fn extract_dependencies<S: AsRef<str>>(lines: &[S]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut deps = Vec::new();

    for line in lines {
        let line = line.as_ref();
        for regex in ANNOTATION_REGEXES.iter() {
            let Some(caps) = regex.captures(line) else {
                continue;
            };
            let Some(rest) = caps.get(1) else {
                continue;
            };
            for id in TASK_ID_REGEX.captures_iter(rest.as_str()) {
                let id = id[1].to_string();
                if seen.insert(id.clone()) {
                    deps.push(id);
                }
            }
        }
    }

    deps
}
