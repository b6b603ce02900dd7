//! Backend that shells out to the `codeagent-wrapper` executable.

use super::{DispatchError, DispatchRequest, ExecutionBackend, ExecutionReport};
use async_trait::async_trait;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub const DEFAULT_BINARY: &str = "codeagent-wrapper";

/// Default timeout for one batch (1 hour).
pub const DEFAULT_TIMEOUT_SECS: u64 = 3600;

/// Environment overrides for the binary, in lookup order.
const BINARY_ENV_VARS: [&str; 2] = ["CODEAGENT_WRAPPER", "CODEAGENT_WRAPPER_PATH"];

fn search_dirs(dirs: impl IntoIterator<Item = PathBuf>, name: &str) -> Option<PathBuf> {
    dirs.into_iter()
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

fn home_bin_dirs(home: &Path) -> Vec<PathBuf> {
    vec![
        home.join(".claude").join("bin"),
        home.join(".local").join("bin"),
        home.join("bin"),
    ]
}

fn resolve_with(
    env_override: Option<String>,
    configured: Option<&str>,
    path_var: Option<OsString>,
    home: Option<PathBuf>,
) -> Result<PathBuf, DispatchError> {
    let path_dirs: Vec<PathBuf> = path_var
        .map(|p| env::split_paths(&p).collect())
        .unwrap_or_default();

    let (name, strict) = match (&env_override, configured) {
        (Some(value), _) => (value.as_str(), true),
        (None, Some(command)) => (command, false),
        (None, None) => (DEFAULT_BINARY, false),
    };

    let as_path = Path::new(name);
    if as_path.components().count() > 1 || as_path.is_absolute() {
        return if as_path.is_file() {
            Ok(as_path.to_path_buf())
        } else {
            Err(DispatchError::BinaryNotFound(name.to_string()))
        };
    }

    if let Some(found) = search_dirs(path_dirs, name) {
        return Ok(found);
    }
    if !strict
        && let Some(home) = home
        && let Some(found) = search_dirs(home_bin_dirs(&home), name)
    {
        return Ok(found);
    }
    Err(DispatchError::BinaryNotFound(name.to_string()))
}

/// Locate the wrapper binary.
///
/// Lookup order: `CODEAGENT_WRAPPER` / `CODEAGENT_WRAPPER_PATH`, then the
/// configured command, then `PATH`, then `~/.claude/bin`, `~/.local/bin`
/// and `~/bin`.
pub fn resolve_binary(configured: Option<&str>) -> Result<PathBuf, DispatchError> {
    let env_override = BINARY_ENV_VARS
        .iter()
        .find_map(|var| env::var(var).ok().filter(|v| !v.trim().is_empty()));
    resolve_with(env_override, configured, env::var_os("PATH"), dirs::home_dir())
}

/// Parse the wrapper's stdout into a report.
///
/// Output that is not a JSON report leaves the exit status as the only
/// success signal.
fn parse_report(stdout: &str, stderr: &str, exit_ok: bool, task_count: usize) -> ExecutionReport {
    let trimmed = stdout.trim();
    let json_slice = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => trimmed,
    };

    match serde_json::from_str::<ExecutionReport>(json_slice) {
        Ok(mut report) => {
            report.success = exit_ok;
            report
        }
        Err(e) => {
            debug!(error = %e, "Wrapper output is not a JSON report");
            let stderr = stderr.trim();
            ExecutionReport {
                success: exit_ok,
                tasks_completed: if exit_ok { task_count } else { 0 },
                tasks_failed: if exit_ok { 0 } else { task_count },
                errors: if stderr.is_empty() {
                    Vec::new()
                } else {
                    vec![stderr.to_string()]
                },
                ..Default::default()
            }
        }
    }
}

/// Runs batches through `codeagent-wrapper --parallel`.
#[derive(Debug, Clone)]
pub struct CodeagentBackend {
    binary: PathBuf,
    timeout: Duration,
}

impl CodeagentBackend {
    pub fn new(binary: PathBuf) -> Self {
        Self {
            binary,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Resolve the binary and build a backend for it.
    pub fn locate(configured: Option<&str>) -> Result<Self, DispatchError> {
        Ok(Self::new(resolve_binary(configured)?))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn command(&self, request: &DispatchRequest) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--parallel")
            .arg("--tmux-session")
            .arg(&request.session_name)
            .arg("--state-file")
            .arg(&request.state_file);
        if request.review {
            cmd.arg("--review");
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ExecutionBackend for CodeagentBackend {
    async fn execute(&self, request: &DispatchRequest) -> Result<ExecutionReport, DispatchError> {
        let binary = self.binary.display().to_string();
        let io_err = |source: std::io::Error| DispatchError::Io {
            binary: binary.clone(),
            source,
        };

        info!(
            binary = %binary,
            tasks = request.len(),
            review = request.review,
            "Invoking codeagent-wrapper"
        );
        let mut child = self.command(request).spawn().map_err(io_err)?;

        // Fed concurrently with the wait so a child that stops reading
        // cannot stall the tick past the timeout.
        let writer = child.stdin.take().map(|mut stdin| {
            let heredoc = request.heredoc();
            tokio::spawn(async move {
                stdin.write_all(heredoc.as_bytes()).await?;
                stdin.shutdown().await
            })
        });

        let waited = tokio::time::timeout(self.timeout, child.wait_with_output()).await;
        let output = match waited {
            Ok(result) => result.map_err(io_err)?,
            Err(_) => {
                if let Some(writer) = &writer {
                    writer.abort();
                }
                warn!(timeout_secs = self.timeout.as_secs(), "codeagent-wrapper timed out");
                return Err(DispatchError::Timeout(self.timeout.as_secs()));
            }
        };

        if let Some(writer) = writer
            && let Ok(Err(e)) = writer.await
        {
            debug!(error = %e, "codeagent-wrapper closed stdin before reading all input");
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_ok = output.status.success();
        debug!(exit_ok, code = ?output.status.code(), "codeagent-wrapper exited");

        Ok(parse_report(&stdout, &stderr, exit_ok, request.len()))
    }
}
