//! Shell command execution tool

use async_trait::async_trait;
use cairn_agent::{ApprovalCategory, ToolContext, ToolHandler, ToolResult, ToolUse};
use serde_json::json;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// Maximum output size in bytes before truncation
const MAX_OUTPUT_SIZE: usize = 100_000;
/// Maximum number of lines before truncation
const MAX_OUTPUT_LINES: usize = 1000;
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Tool for executing shell commands
pub struct BashTool;

impl BashTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for BashTool {
    fn default() -> Self {
        Self::new()
    }
}

/// One output stream, capped at the line and byte limits
#[derive(Default)]
struct Captured {
    text: String,
    lines: usize,
    truncated: bool,
}

impl Captured {
    fn push(&mut self, line: &str) {
        if self.truncated {
            return;
        }
        if self.lines >= MAX_OUTPUT_LINES || self.text.len() + line.len() > MAX_OUTPUT_SIZE {
            self.truncated = true;
            return;
        }
        if !self.text.is_empty() {
            self.text.push('\n');
        }
        self.text.push_str(line);
        self.lines += 1;
    }

    fn notice(&self, stream: &str) -> String {
        format!(
            "\n\n... ({} truncated at {} lines / {}KB)",
            stream,
            self.lines,
            MAX_OUTPUT_SIZE / 1024
        )
    }
}

#[async_trait]
impl ToolHandler for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the working directory. Returns stdout and stderr."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "timeout": {
                    "type": ["integer", "string"],
                    "description": "Timeout in seconds (optional)"
                }
            },
            "required": ["command"]
        })
    }

    fn approval_category(&self) -> ApprovalCategory {
        ApprovalCategory::Command
    }

    fn describe(&self, block: &ToolUse) -> String {
        format!("[bash for '{}']", block.param("command").unwrap_or_default())
    }

    /// The command line itself, which is what a command approval shows
    fn ui_message(&self, block: &ToolUse) -> String {
        block.param("command").unwrap_or_default().to_string()
    }

    async fn execute(&self, ctx: &ToolContext, block: &ToolUse) -> ToolResult {
        let Some(command) = block.param("command") else {
            return ToolResult::error("Missing 'command' argument");
        };

        let timeout_secs = block
            .params
            .get("timeout")
            .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok())))
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let (shell, shell_arg) = if cfg!(target_os = "windows") {
            ("cmd", "/C")
        } else {
            ("sh", "-c")
        };

        let mut child = match Command::new(shell)
            .arg(shell_arg)
            .arg(command)
            .current_dir(&ctx.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(c) => c,
            Err(e) => return ToolResult::error(format!("Failed to spawn command: {}", e)),
        };

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return ToolResult::error("Failed to capture command output");
        };
        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();
        let mut stdout_done = false;
        let mut stderr_done = false;

        let mut out = Captured::default();
        let mut err = Captured::default();

        let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_secs(timeout_secs);

        let exit_status = loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    let _ = child.kill().await;
                    return ToolResult::error("Command cancelled");
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let _ = child.kill().await;
                    return ToolResult::error(format!(
                        "{}\n{}\n\nCommand timed out after {} seconds",
                        out.text, err.text, timeout_secs
                    ));
                }
                line = stdout_reader.next_line(), if !stdout_done => match line {
                    Ok(Some(l)) => out.push(&l),
                    Ok(None) => stdout_done = true,
                    Err(e) => {
                        stdout_done = true;
                        err.push(&format!("Stdout read error: {}", e));
                    }
                },
                line = stderr_reader.next_line(), if !stderr_done => match line {
                    Ok(Some(l)) => err.push(&l),
                    Ok(None) => stderr_done = true,
                    Err(e) => {
                        stderr_done = true;
                        err.push(&format!("Stderr read error: {}", e));
                    }
                },
                // Drain both pipes before reporting the exit status.
                status = child.wait(), if stdout_done && stderr_done => match status {
                    Ok(status) => break status,
                    Err(e) => return ToolResult::error(format!("Failed to wait for command: {}", e)),
                },
            }
        };

        let mut result = out.text.clone();
        if out.truncated {
            result.push_str(&out.notice("stdout"));
        }
        if !err.text.is_empty() {
            if !result.is_empty() {
                result.push('\n');
            }
            result.push_str(&err.text);
            if err.truncated {
                result.push_str(&err.notice("stderr"));
            }
        }
        if result.is_empty() {
            result = "(no output)".to_string();
        }

        if exit_status.success() {
            ToolResult::text(result)
        } else {
            let code = exit_status.code().unwrap_or(-1);
            ToolResult::error(format!("{}\n\nCommand exited with code {}", result, code))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::tools::tests::{block, ctx};

    #[tokio::test]
    async fn test_runs_in_task_cwd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let result = BashTool::new()
            .execute(&ctx(dir.path()), &block("bash", json!({"command": "ls; echo oops >&2"})))
            .await;
        assert!(!result.is_error, "{}", result.text_content());
        let text = result.text_content();
        assert!(text.contains("marker.txt"));
        assert!(text.contains("oops"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = BashTool::new()
            .execute(&ctx(dir.path()), &block("bash", json!({"command": "exit 3"})))
            .await;
        assert!(result.is_error);
        assert!(result.text_content().contains("exited with code 3"));
    }

    #[tokio::test]
    async fn test_timeout_and_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let tool = BashTool::new();
        let timed_out = tool
            .execute(&ctx(dir.path()), &block("bash", json!({"command": "sleep 5", "timeout": "1"})))
            .await;
        assert!(timed_out.is_error);
        assert!(timed_out.text_content().contains("timed out after 1 seconds"));

        let ctx = ctx(dir.path());
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            cancel.cancel();
        });
        let cancelled = tool
            .execute(&ctx, &block("bash", json!({"command": "sleep 5"})))
            .await;
        assert_eq!(cancelled.text_content(), "Command cancelled");
    }

    #[test]
    fn test_output_is_capped() {
        let mut captured = Captured::default();
        for i in 0..(MAX_OUTPUT_LINES + 10) {
            captured.push(&i.to_string());
        }
        assert!(captured.truncated);
        assert_eq!(captured.lines, MAX_OUTPUT_LINES);
    }
}
