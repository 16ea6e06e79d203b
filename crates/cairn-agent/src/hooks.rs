//! Lifecycle hook scripts.
//!
//! A hook is an executable named after its event (`TaskStart`, ...) in one of
//! the configured hook directories. It receives a JSON [`HookInput`] on stdin
//! and may print a JSON [`HookOutput`]. Every failure mode is soft: the task
//! carries on as if the hook had returned `{"cancel": false}`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::HookSettings;
use crate::handle::ActiveHook;
use crate::host::Ui;
use crate::message::SayKind;

/// Task lifecycle points that can run a hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookEvent {
    TaskStart,
    TaskResume,
    UserPromptSubmit,
    TaskCancel,
}

impl HookEvent {
    pub const ALL: [HookEvent; 4] = [
        HookEvent::TaskStart,
        HookEvent::TaskResume,
        HookEvent::UserPromptSubmit,
        HookEvent::TaskCancel,
    ];

    /// Script file name and `hookName` in the payload
    pub fn name(self) -> &'static str {
        match self {
            HookEvent::TaskStart => "TaskStart",
            HookEvent::TaskResume => "TaskResume",
            HookEvent::UserPromptSubmit => "UserPromptSubmit",
            HookEvent::TaskCancel => "TaskCancel",
        }
    }

    /// Whether the user may cancel a running hook for this event.
    /// The cancel hook itself always runs to the end.
    pub fn is_cancellable(self) -> bool {
        !matches!(self, HookEvent::TaskCancel)
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|event| event.name().eq_ignore_ascii_case(name))
    }
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Event-specific part of the hook payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum HookData {
    TaskStart {
        task: String,
    },
    TaskResume {
        message_count: usize,
        last_message_ts: Option<i64>,
    },
    UserPromptSubmit {
        prompt: String,
    },
    TaskCancel {
        completion_status: String,
    },
}

impl HookData {
    pub fn event(&self) -> HookEvent {
        match self {
            HookData::TaskStart { .. } => HookEvent::TaskStart,
            HookData::TaskResume { .. } => HookEvent::TaskResume,
            HookData::UserPromptSubmit { .. } => HookEvent::UserPromptSubmit,
            HookData::TaskCancel { .. } => HookEvent::TaskCancel,
        }
    }
}

/// JSON written to the hook's stdin
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookInput {
    pub hook_name: String,
    pub timestamp: i64,
    pub task_id: String,
    pub workspace_roots: Vec<String>,
    #[serde(flatten)]
    pub data: HookData,
}

/// JSON a hook may print on stdout
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HookOutput {
    pub cancel: bool,
    pub context_modification: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookStatus {
    #[default]
    Running,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookErrorKind {
    /// Non-zero exit
    Execution,
    Timeout,
    /// Output was not the expected JSON
    Validation,
    /// The script could not be started
    Spawn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookFailure {
    #[serde(rename = "type")]
    pub kind: HookErrorKind,
    pub message: String,
}

/// Payload of a `hook_status` UI message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookStatusMessage {
    pub hook_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    pub status: HookStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub has_json_response: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<HookFailure>,
}

/// What the task does with a finished hook
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HookOutcome {
    pub cancel: bool,
    pub context_modification: Option<String>,
    pub error_message: Option<String>,
    /// `None` when no hook ran at all
    pub status: Option<HookStatus>,
}

impl HookOutcome {
    /// Context to add to the next user turn, tagged with its source
    pub fn context_block(&self, event: HookEvent) -> Option<String> {
        let context = self.context_modification.as_deref()?.trim();
        if context.is_empty() {
            return None;
        }
        Some(format!(
            "<hook_context source=\"{}\">\n{}\n</hook_context>",
            event.name(),
            context
        ))
    }
}

/// How the script run ended, before interpretation
enum RunEnd {
    Exited {
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    Cancelled,
    TimedOut,
    SpawnFailed(std::io::Error),
}

/// Runs hook scripts for a task
#[derive(Debug, Clone)]
pub struct HookExecutor {
    settings: HookSettings,
}

impl HookExecutor {
    pub fn new(settings: HookSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &HookSettings {
        &self.settings
    }

    /// First executable file named after the event in the hook directories
    pub fn find_script(&self, event: HookEvent) -> Option<PathBuf> {
        self.settings
            .dirs
            .iter()
            .map(|dir| dir.join(event.name()))
            .find(|path| path.is_file())
    }

    /// Run the hook for `data`'s event, tracking it as a `hook_status` message.
    ///
    /// Resolves immediately to the default outcome when hooks are disabled or
    /// no script exists for the event.
    pub async fn run(&self, data: HookData, workspace_roots: &[String], ui: &mut Ui) -> HookOutcome {
        let event = data.event();
        if !self.settings.enabled {
            return HookOutcome::default();
        }
        let Some(script) = self.find_script(event) else {
            return HookOutcome::default();
        };

        let mut status = HookStatusMessage {
            hook_name: event.name().to_string(),
            ..Default::default()
        };
        let ts = ui.say(SayKind::HookStatus, Some(status_json(&status)), false).await;

        let input = HookInput {
            hook_name: event.name().to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            task_id: ui.store().task_id().to_string(),
            workspace_roots: workspace_roots.to_vec(),
            data,
        };

        let handle = ui.handle().clone();
        let cancellation = if event.is_cancellable() {
            handle.cancel_token().child_token()
        } else {
            CancellationToken::new()
        };
        let guard = event.is_cancellable().then(|| {
            handle.register_hook(ActiveHook {
                hook_name: event.name().to_string(),
                tool_name: None,
                message_ts: ts,
                cancellation: cancellation.clone(),
            })
        });

        tracing::debug!(hook = %event, script = %script.display(), "running hook");
        let end = self.execute(&script, &input, &cancellation).await;
        drop(guard);

        let outcome = interpret(end, &mut status);
        match status.status {
            HookStatus::Failed => tracing::warn!(
                hook = %event,
                error = ?status.error.as_ref().map(|e| &e.message),
                "hook failed, continuing"
            ),
            HookStatus::Cancelled => tracing::info!(hook = %event, "hook cancelled"),
            _ => tracing::debug!(hook = %event, cancel = outcome.cancel, "hook completed"),
        }
        ui.update_text(ts, status_json(&status)).await;

        // The cancel hook runs while the task is already stopping.
        if event == HookEvent::TaskCancel {
            return HookOutcome {
                cancel: false,
                ..outcome
            };
        }
        outcome
    }

    async fn execute(&self, script: &Path, input: &HookInput, cancel: &CancellationToken) -> RunEnd {
        let payload = match serde_json::to_vec(input) {
            Ok(p) => p,
            Err(e) => return RunEnd::SpawnFailed(e.into()),
        };

        let mut command = Command::new(script);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(root) = input.workspace_roots.first() {
            command.current_dir(root);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return RunEnd::SpawnFailed(e),
        };

        let run = async move {
            if let Some(mut stdin) = child.stdin.take() {
                // A hook that ignores stdin may exit before reading it.
                if let Err(e) = stdin.write_all(&payload).await {
                    tracing::debug!(error = %e, "hook did not read its input");
                }
            }
            child.wait_with_output().await
        };

        tokio::select! {
            _ = cancel.cancelled() => RunEnd::Cancelled,
            _ = tokio::time::sleep(self.settings.timeout) => RunEnd::TimedOut,
            output = run => match output {
                Ok(output) => RunEnd::Exited {
                    code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                },
                Err(e) => RunEnd::SpawnFailed(e),
            },
        }
    }
}

/// Turn a finished run into an outcome, filling in the status record
fn interpret(end: RunEnd, status: &mut HookStatusMessage) -> HookOutcome {
    let fail = |status: &mut HookStatusMessage, kind, message: String| {
        status.status = HookStatus::Failed;
        status.error = Some(HookFailure { kind, message });
        HookOutcome {
            status: Some(HookStatus::Failed),
            ..Default::default()
        }
    };

    match end {
        RunEnd::Cancelled => {
            status.status = HookStatus::Cancelled;
            HookOutcome {
                status: Some(HookStatus::Cancelled),
                ..Default::default()
            }
        }
        RunEnd::TimedOut => fail(status, HookErrorKind::Timeout, "hook timed out".to_string()),
        RunEnd::SpawnFailed(e) => fail(status, HookErrorKind::Spawn, format!("failed to start hook: {e}")),
        RunEnd::Exited { code, stdout, stderr } => {
            status.exit_code = code;
            if code != Some(0) {
                let detail = stderr.trim();
                let message = if detail.is_empty() {
                    format!("hook exited with {}", code.map_or("a signal".to_string(), |c| format!("code {c}")))
                } else {
                    detail.to_string()
                };
                return fail(status, HookErrorKind::Execution, message);
            }
            match parse_output(&stdout) {
                Some(output) => {
                    status.status = HookStatus::Completed;
                    status.has_json_response = true;
                    HookOutcome {
                        cancel: output.cancel,
                        context_modification: output.context_modification,
                        error_message: output.error_message,
                        status: Some(HookStatus::Completed),
                    }
                }
                None => fail(
                    status,
                    HookErrorKind::Validation,
                    "hook output was not a JSON object".to_string(),
                ),
            }
        }
    }
}

/// The whole of stdout as JSON, else its last non-empty line. Empty output
/// is an empty response.
fn parse_output(stdout: &str) -> Option<HookOutput> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Some(HookOutput::default());
    }
    serde_json::from_str(trimmed).ok().or_else(|| {
        trimmed
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .and_then(|line| serde_json::from_str(line).ok())
    })
}

fn status_json(status: &HookStatusMessage) -> String {
    serde_json::to_string(status).unwrap_or_default()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::handle::TaskHandle;
    use crate::host::tests::{ScriptedHost, ui_with};
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;
    use std::time::Duration;

    fn write_script(dir: &Path, event: HookEvent, body: &str) {
        let path = dir.join(event.name());
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn executor(dir: &Path) -> HookExecutor {
        HookExecutor::new(HookSettings {
            enabled: true,
            dirs: vec![dir.to_path_buf()],
            timeout: Duration::from_secs(10),
        })
    }

    fn start() -> HookData {
        HookData::TaskStart {
            task: "fix the build".into(),
        }
    }

    fn last_status(ui: &Ui) -> HookStatusMessage {
        let text = ui.store().last_ui_message().unwrap().text.clone().unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[tokio::test]
    async fn test_disabled_or_missing_hook_is_a_no_op() {
        let hooks = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let mut ui = ui_with(data.path(), Arc::new(ScriptedHost::default()), TaskHandle::new());

        let outcome = executor(hooks.path()).run(start(), &[], &mut ui).await;
        assert_eq!(outcome, HookOutcome::default());

        write_script(hooks.path(), HookEvent::TaskStart, "echo '{\"cancel\":true}'");
        let disabled = HookExecutor::new(HookSettings {
            enabled: false,
            dirs: vec![hooks.path().to_path_buf()],
            ..Default::default()
        });
        let outcome = disabled.run(start(), &[], &mut ui).await;
        assert!(!outcome.cancel);
        assert!(ui.store().ui_messages().is_empty());
    }

    #[tokio::test]
    async fn test_hook_receives_payload_and_returns_context() {
        let hooks = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        write_script(
            hooks.path(),
            HookEvent::TaskStart,
            r#"input=$(cat)
case "$input" in
  *'"hookName":"TaskStart"'*'"task":"fix the build"'*) echo '{"cancel":false,"contextModification":"use make"}' ;;
  *) echo '{"cancel":true}' ;;
esac"#,
        );
        let mut ui = ui_with(data.path(), Arc::new(ScriptedHost::default()), TaskHandle::new());

        let outcome = executor(hooks.path()).run(start(), &[], &mut ui).await;
        assert!(!outcome.cancel);
        assert_eq!(outcome.status, Some(HookStatus::Completed));
        assert_eq!(
            outcome.context_block(HookEvent::TaskStart).unwrap(),
            "<hook_context source=\"TaskStart\">\nuse make\n</hook_context>"
        );

        let status = last_status(&ui);
        assert_eq!(status.status, HookStatus::Completed);
        assert_eq!(status.exit_code, Some(0));
        assert!(status.has_json_response);
        assert_eq!(ui.store().ui_messages().len(), 1);
    }

    #[tokio::test]
    async fn test_hook_can_cancel_task() {
        let hooks = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        write_script(
            hooks.path(),
            HookEvent::UserPromptSubmit,
            "cat > /dev/null\necho 'checking prompt'\necho '{\"cancel\":true,\"errorMessage\":\"not allowed\"}'",
        );
        let mut ui = ui_with(data.path(), Arc::new(ScriptedHost::default()), TaskHandle::new());

        let outcome = executor(hooks.path())
            .run(HookData::UserPromptSubmit { prompt: "rm -rf".into() }, &[], &mut ui)
            .await;
        assert!(outcome.cancel);
        assert_eq!(outcome.error_message.as_deref(), Some("not allowed"));
    }

    #[tokio::test]
    async fn test_failures_are_soft() {
        let hooks = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let mut ui = ui_with(data.path(), Arc::new(ScriptedHost::default()), TaskHandle::new());

        write_script(hooks.path(), HookEvent::TaskStart, "echo boom >&2\nexit 3");
        let outcome = executor(hooks.path()).run(start(), &[], &mut ui).await;
        assert!(!outcome.cancel);
        assert_eq!(outcome.status, Some(HookStatus::Failed));
        let status = last_status(&ui);
        assert_eq!(status.exit_code, Some(3));
        let error = status.error.unwrap();
        assert_eq!(error.kind, HookErrorKind::Execution);
        assert_eq!(error.message, "boom");

        write_script(hooks.path(), HookEvent::TaskStart, "echo 'not json'");
        let outcome = executor(hooks.path()).run(start(), &[], &mut ui).await;
        assert!(!outcome.cancel);
        assert_eq!(last_status(&ui).error.unwrap().kind, HookErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_timeout_is_soft_failure() {
        let hooks = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        write_script(hooks.path(), HookEvent::TaskStart, "sleep 10");
        let mut ui = ui_with(data.path(), Arc::new(ScriptedHost::default()), TaskHandle::new());

        let executor = HookExecutor::new(HookSettings {
            enabled: true,
            dirs: vec![hooks.path().to_path_buf()],
            timeout: Duration::from_millis(200),
        });
        let outcome = executor.run(start(), &[], &mut ui).await;
        assert!(!outcome.cancel);
        assert_eq!(last_status(&ui).error.unwrap().kind, HookErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_abort_cancels_running_hook_and_clears_slot() {
        let hooks = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        write_script(hooks.path(), HookEvent::TaskStart, "sleep 10");
        let handle = TaskHandle::new();
        let mut ui = ui_with(data.path(), Arc::new(ScriptedHost::default()), handle.clone());

        let watcher = {
            let handle = handle.clone();
            tokio::spawn(async move {
                loop {
                    if let Some(active) = handle.active_hook() {
                        assert_eq!(active.hook_name, "TaskStart");
                        handle.abort();
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
        };

        let outcome = executor(hooks.path()).run(start(), &[], &mut ui).await;
        watcher.await.unwrap();
        assert_eq!(outcome.status, Some(HookStatus::Cancelled));
        assert!(handle.active_hook().is_none());
        assert_eq!(last_status(&ui).status, HookStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_hook_runs_after_abort_and_never_cancels() {
        let hooks = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        write_script(hooks.path(), HookEvent::TaskCancel, "cat > /dev/null\necho '{\"cancel\":true}'");
        let handle = TaskHandle::new();
        handle.abort();
        let mut ui = ui_with(data.path(), Arc::new(ScriptedHost::default()), handle.clone());

        let outcome = executor(hooks.path())
            .run(
                HookData::TaskCancel {
                    completion_status: "cancelled".into(),
                },
                &[],
                &mut ui,
            )
            .await;
        assert_eq!(outcome.status, Some(HookStatus::Completed));
        assert!(!outcome.cancel);
        assert!(handle.active_hook().is_none());
    }

    #[test]
    fn test_payload_shape() {
        let input = HookInput {
            hook_name: "TaskResume".into(),
            timestamp: 1,
            task_id: "t".into(),
            workspace_roots: vec!["/w".into()],
            data: HookData::TaskResume {
                message_count: 4,
                last_message_ts: Some(9),
            },
        };
        let json = serde_json::to_value(&input).unwrap();
        assert_eq!(json["hookName"], "TaskResume");
        assert_eq!(json["workspaceRoots"][0], "/w");
        assert_eq!(json["taskResume"]["messageCount"], 4);
        assert_eq!(HookEvent::parse("taskcancel"), Some(HookEvent::TaskCancel));
        assert!(!HookEvent::TaskCancel.is_cancellable());
    }
}
