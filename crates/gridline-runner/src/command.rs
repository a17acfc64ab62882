//! Shell command execution on the host.

use gridline_core::{Error, Result};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::time::{Duration, timeout};
use tracing::{debug, info, warn};

/// Lines of output kept for error messages.
const TAIL_LINES: usize = 40;

/// A command to run through `sh -c`.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub command: String,
    pub workdir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>, workdir: &Path) -> Self {
        Self {
            command: command.into(),
            workdir: workdir.to_path_buf(),
            env: BTreeMap::new(),
            timeout: None,
        }
    }

    pub fn env(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub duration_ms: u64,
    pub stdout_tail: Vec<String>,
    pub stderr_tail: Vec<String>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last lines of stderr, falling back to stdout.
    pub fn summary(&self) -> String {
        let lines = if self.stderr_tail.is_empty() {
            &self.stdout_tail
        } else {
            &self.stderr_tail
        };
        lines.join("\n")
    }
}

/// Run a command to completion. The child is killed if the returned future
/// is dropped, so cancelling a job never leaves its processes behind.
pub async fn run_command(spec: &CommandSpec) -> Result<CommandOutput> {
    let start = std::time::Instant::now();

    info!(command = %spec.command, workdir = %spec.workdir.display(), "Executing shell command");

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(&spec.command)
        .current_dir(&spec.workdir)
        .envs(&spec.env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Internal(format!("Failed to spawn process: {}", e)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Internal("Child stdout not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Internal("Child stderr not captured".to_string()))?;

    let stdout_handle = tokio::spawn(collect_tail(stdout, "stdout"));
    let stderr_handle = tokio::spawn(collect_tail(stderr, "stderr"));

    let wait_result = match spec.timeout {
        Some(limit) => match timeout(limit, child.wait()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_secs = limit.as_secs(), "Command timed out, killing process");
                let _ = child.kill().await;
                return Err(Error::Internal(format!(
                    "Command timed out after {}s",
                    limit.as_secs()
                )));
            }
        },
        None => child.wait().await,
    };

    let stdout_tail = stdout_handle.await.unwrap_or_default();
    let stderr_tail = stderr_handle.await.unwrap_or_default();

    let status = wait_result
        .map_err(|e| Error::Internal(format!("Failed to wait for process: {}", e)))?;

    let exit_code = status.code().unwrap_or(-1);
    let duration_ms = start.elapsed().as_millis() as u64;

    debug!(exit_code, duration_ms, "Command completed");

    Ok(CommandOutput {
        exit_code,
        duration_ms,
        stdout_tail,
        stderr_tail,
    })
}

async fn collect_tail<R: AsyncRead + Unpin>(reader: R, stream: &'static str) -> Vec<String> {
    let mut lines = BufReader::new(reader).lines();
    let mut tail = VecDeque::with_capacity(TAIL_LINES);

    while let Ok(Some(line)) = lines.next_line().await {
        debug!(stream, "{}", line);
        if tail.len() == TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    tail.into()
}

/// Quote a value for safe inclusion in an `sh -c` command line.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}
