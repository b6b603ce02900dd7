//! Integration tests for the foreman CLI.
//!
//! Dispatch tests either run with `--dry-run` or point `CODEAGENT_WRAPPER`
//! at a stub script that answers with a canned JSON report.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn foreman() -> Command {
    let mut cmd = cargo_bin_cmd!("foreman");
    cmd.env_remove("CODEAGENT_WRAPPER")
        .env_remove("CODEAGENT_WRAPPER_PATH")
        .env_remove("FOREMAN_TIMEOUT_SECS");
    cmd
}

const TASKS_MD: &str = "\
# Tasks

- [ ] 1. Storage layer
- [ ] 1.1 Connection pool
  - Writes: src/pool.rs
- [ ] 1.2 Query builder
- [ ] 2. Settings page
  - Depends on: 1
";

/// Spec directory `<tmp>/specs/billing` with the three required files.
fn create_spec(tasks_md: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let spec = dir.path().join("specs").join("billing");
    fs::create_dir_all(&spec).unwrap();
    fs::write(spec.join("requirements.md"), "# Requirements\n").unwrap();
    fs::write(spec.join("design.md"), "# Design\n").unwrap();
    fs::write(spec.join("tasks.md"), tasks_md).unwrap();
    (dir, spec)
}

fn init_state(dir: &TempDir, spec: &Path) -> PathBuf {
    foreman().arg("init").arg(spec).assert().success();
    dir.path().join("specs").join("AGENT_STATE.json")
}

fn read_state(path: &Path) -> serde_json::Value {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

fn task_status(state: &serde_json::Value, id: &str) -> String {
    state["tasks"]
        .as_array()
        .unwrap()
        .iter()
        .find(|t| t["task_id"] == id)
        .map(|t| t["status"].as_str().unwrap().to_string())
        .unwrap()
}

#[cfg(unix)]
fn stub_backend(dir: &Path, stdout: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("codeagent-wrapper");
    let script = format!(
        "#!/bin/sh\ncat > \"$(dirname \"$0\")/last-input.txt\"\ncat <<'EOF'\n{}\nEOF\n",
        stdout
    );
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        foreman()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("dispatch-batch"))
            .stdout(predicate::str::contains("consolidate-reviews"))
            .stdout(predicate::str::contains("validate-state"));
    }

    #[test]
    fn test_version() {
        foreman().arg("--version").assert().success();
    }

    #[test]
    fn test_missing_state_file_fails() {
        let dir = TempDir::new().unwrap();
        foreman()
            .arg("validate-state")
            .arg(dir.path().join("AGENT_STATE.json"))
            .assert()
            .code(1)
            .stdout(predicate::str::contains("Failed to load state file"));
    }
}

mod init {
    use super::*;

    #[test]
    fn test_init_writes_state_beside_spec() {
        let (dir, spec) = create_spec(TASKS_MD);
        foreman()
            .arg("init")
            .arg(&spec)
            .assert()
            .success()
            .stdout(predicate::str::contains("Orchestration initialized"));

        let state = read_state(&dir.path().join("specs").join("AGENT_STATE.json"));
        assert_eq!(state["session_name"], "orch-billing");
        assert_eq!(state["tasks"].as_array().unwrap().len(), 4);
        assert_eq!(state["tasks"][0]["subtasks"], serde_json::json!(["1.1", "1.2"]));
        assert_eq!(state["tasks"][3]["type"], "ui");
        assert_eq!(state["tasks"][3]["owner_agent"], "gemini");
    }

    #[test]
    fn test_init_custom_session_and_output() {
        let (dir, spec) = create_spec(TASKS_MD);
        let out = dir.path().join("out");
        foreman()
            .args(["init", "--session", "billing-run", "--output"])
            .arg(&out)
            .arg(&spec)
            .assert()
            .success();

        let state = read_state(&out.join("AGENT_STATE.json"));
        assert_eq!(state["session_name"], "billing-run");
    }

    #[test]
    fn test_init_missing_files() {
        let dir = TempDir::new().unwrap();
        foreman()
            .arg("init")
            .arg(dir.path())
            .assert()
            .code(1)
            .stdout(predicate::str::contains("Missing: requirements.md, design.md, tasks.md"));
    }

    #[test]
    fn test_init_reports_dependency_errors() {
        let (_dir, spec) = create_spec("- [ ] 1. Only task\n  - Depends on: 4\n");
        foreman()
            .arg("init")
            .arg(&spec)
            .assert()
            .code(1)
            .stdout(predicate::str::contains("Task 1 has missing dependencies: 4"));
    }
}

mod validate {
    use super::*;

    #[test]
    fn test_fresh_state_is_valid() {
        let (dir, spec) = create_spec(TASKS_MD);
        let state_file = init_state(&dir, &spec);
        foreman()
            .arg("validate-state")
            .arg(&state_file)
            .assert()
            .success()
            .stdout(predicate::str::contains("State is valid (4 tasks)"));
    }

    #[test]
    fn test_json_report() {
        let (dir, spec) = create_spec(TASKS_MD);
        let state_file = init_state(&dir, &spec);
        let output = foreman()
            .args(["--json", "validate-state"])
            .arg(&state_file)
            .output()
            .unwrap();
        assert!(output.status.success());
        let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(report["success"], true);
        assert_eq!(report["counts"]["not_started"], 4);
    }

    #[test]
    fn test_invalid_state_exits_1() {
        let dir = TempDir::new().unwrap();
        let state_file = dir.path().join("AGENT_STATE.json");
        fs::write(
            &state_file,
            r#"{"tasks": [{"task_id": "1", "dependencies": ["2"]}, {"task_id": "2", "dependencies": ["1"]}]}"#,
        )
        .unwrap();
        foreman()
            .arg("validate-state")
            .arg(&state_file)
            .assert()
            .code(1)
            .stdout(predicate::str::contains("Circular dependency"));
    }
}

mod dispatch {
    use super::*;

    #[test]
    fn test_dry_run_prints_backend_input_and_keeps_state() {
        let (dir, spec) = create_spec(TASKS_MD);
        let state_file = init_state(&dir, &spec);
        let before = fs::read_to_string(&state_file).unwrap();

        foreman()
            .args(["--dry-run", "dispatch-batch"])
            .arg(&state_file)
            .assert()
            .success()
            .stdout(predicate::str::contains("---TASK---\nid: 1.1"))
            .stdout(predicate::str::contains("target_window: task-1.2"));

        assert_eq!(fs::read_to_string(&state_file).unwrap(), before);
    }

    #[test]
    fn test_missing_backend_binary() {
        let (dir, spec) = create_spec(TASKS_MD);
        let state_file = init_state(&dir, &spec);
        foreman()
            .env("CODEAGENT_WRAPPER", dir.path().join("no-such-wrapper"))
            .arg("dispatch-batch")
            .arg(&state_file)
            .assert()
            .code(1)
            .stdout(predicate::str::contains("Execution backend unavailable"));
    }

    #[test]
    fn test_pending_human_decision_exits_2() {
        let dir = TempDir::new().unwrap();
        let state_file = dir.path().join("AGENT_STATE.json");
        fs::write(
            &state_file,
            r#"{
                "tasks": [{
                    "task_id": "1",
                    "status": "fix_required",
                    "owner_agent": "kiro-cli",
                    "target_window": "task-1",
                    "fix_attempts": 3,
                    "last_review_severity": "critical"
                }]
            }"#,
        )
        .unwrap();

        foreman()
            .args(["--dry-run", "dispatch-batch"])
            .arg(&state_file)
            .assert()
            .code(2)
            .stdout(predicate::str::contains("human decision(s) pending"));
    }

    #[cfg(unix)]
    #[test]
    fn test_stub_backend_completes_batch() {
        let (dir, spec) = create_spec("- [ ] 1. Connection pool\n- [ ] 2. Index tuning\n");
        let state_file = init_state(&dir, &spec);
        let stub = stub_backend(
            dir.path(),
            r#"{"tasks_completed": 2, "task_results": [
                {"task_id": "1", "status": "completed", "files_changed": ["src/pool.rs"], "coverage": 92},
                {"task_id": "2", "status": "completed"}
            ]}"#,
        );

        foreman()
            .env("CODEAGENT_WRAPPER", &stub)
            .arg("dispatch-batch")
            .arg(&state_file)
            .assert()
            .success()
            .stdout(predicate::str::contains("Dispatched 2 new task(s) in 2 batch(es)"));

        let state = read_state(&state_file);
        assert_eq!(task_status(&state, "1"), "pending_review");
        assert_eq!(task_status(&state, "2"), "pending_review");
        assert_eq!(state["tasks"][0]["coverage"], 92);

        // Tasks without a file manifest run one per batch; the stub keeps the last input
        let input = fs::read_to_string(dir.path().join("last-input.txt")).unwrap();
        assert!(input.contains("id: 2\nbackend: kiro-cli"));
    }

    #[cfg(unix)]
    #[test]
    fn test_review_round_trip() {
        let (dir, spec) = create_spec("- [ ] 1. Connection pool\n");
        let state_file = init_state(&dir, &spec);

        let stub = stub_backend(
            dir.path(),
            r#"{"task_results": [{"task_id": "1", "status": "completed"}]}"#,
        );
        foreman()
            .env("CODEAGENT_WRAPPER", &stub)
            .arg("dispatch-batch")
            .arg(&state_file)
            .assert()
            .success();

        let stub = stub_backend(
            dir.path(),
            r#"{"review_results": [{"review_id": "review-1-1", "severity": "minor", "summary": "Naming nits"}]}"#,
        );
        foreman()
            .env("CODEAGENT_WRAPPER", &stub)
            .arg("dispatch-reviews")
            .arg(&state_file)
            .assert()
            .success()
            .stdout(predicate::str::contains("Dispatched 1 reviews for 1 tasks"));
        assert_eq!(task_status(&read_state(&state_file), "1"), "final_review");

        foreman()
            .arg("consolidate-reviews")
            .arg(&state_file)
            .assert()
            .success()
            .stdout(predicate::str::contains("1 completed"));

        let state = read_state(&state_file);
        assert_eq!(task_status(&state, "1"), "completed");
        assert_eq!(state["final_reports"][0]["overall_severity"], "minor");
    }
}
