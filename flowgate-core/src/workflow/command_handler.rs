//! Shell command resource handler
//!
//! Resources of the form `command:<shell>` run `<shell>` through `bash -c`.
//! The state input is written to the child's stdin as JSON. Stdout that parses
//! as JSON becomes the result; anything else is returned as a string.

use crate::workflow::error::ResourceError;
use crate::workflow::resource::ResourceHandler;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

/// Resource prefix routed to [`CommandHandler`]
pub const COMMAND_PREFIX: &str = "command:";

/// Error name for a command that exited non-zero
pub const ERROR_COMMAND_FAILED: &str = "Command.Failed";

/// Runs shell commands as Task resources
pub struct CommandHandler {
    /// Upper bound for a single command
    max_duration: Duration,
}

impl CommandHandler {
    /// Create new command handler with a 300 second bound
    pub fn new() -> Self {
        Self {
            max_duration: Duration::from_secs(300),
        }
    }

    pub fn with_max_duration(max_duration: Duration) -> Self {
        Self { max_duration }
    }

    /// Exit codes 1-10 and SIGTERM are reported as task failures (retryable by
    /// `States.TaskFailed` retriers); anything else as `Command.Failed`
    fn classify_exit(exit_code: Option<i32>) -> &'static str {
        match exit_code {
            Some(code) if (1..=10).contains(&code) => crate::workflow::error::ERROR_TASK_FAILED,
            Some(143) => crate::workflow::error::ERROR_TASK_FAILED,
            _ => ERROR_COMMAND_FAILED,
        }
    }

    async fn run(&self, command: &str, input: &Value) -> Result<Value, ResourceError> {
        let start_time = Instant::now();

        let mut child = Command::new("bash")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ResourceError::task_failed(format!("failed to spawn bash: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::to_vec(input)
                .map_err(|e| ResourceError::runtime(format!("failed to encode input: {}", e)))?;
            // A command that ignores stdin may close it early
            if let Err(e) = stdin.write_all(&payload).await {
                tracing::debug!(command = %command, "stdin not consumed: {}", e);
            }
        }

        let output = match timeout(self.max_duration, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ResourceError::task_failed(format!(
                    "failed to wait for command: {}",
                    e
                )))
            }
            Err(_) => {
                return Err(ResourceError::timeout(format!(
                    "command timed out after {} seconds",
                    self.max_duration.as_secs()
                )))
            }
        };

        let duration_ms = start_time.elapsed().as_millis() as u64;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            let exit_code = output.status.code();
            tracing::debug!(command = %command, ?exit_code, duration_ms, "command failed");
            return Err(ResourceError::new(
                Self::classify_exit(exit_code),
                format!(
                    "command exited with {:?}{}",
                    exit_code,
                    if stderr.is_empty() {
                        String::new()
                    } else {
                        format!(": {}", stderr)
                    }
                ),
            ));
        }

        tracing::debug!(command = %command, duration_ms, "command succeeded");

        Ok(serde_json::from_str(&stdout).unwrap_or_else(|_| json!(stdout)))
    }
}

impl Default for CommandHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceHandler for CommandHandler {
    async fn invoke(&self, resource: &str, input: Value) -> Result<Value, ResourceError> {
        let command = resource
            .strip_prefix(COMMAND_PREFIX)
            .map(str::trim)
            .filter(|command| !command.is_empty())
            .ok_or_else(|| {
                ResourceError::runtime(format!("resource '{}' names no command", resource))
            })?;
        self.run(command, &input).await
    }
}
