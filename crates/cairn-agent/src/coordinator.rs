//! Presents assistant content blocks as they stream in: text goes to the UI,
//! tool blocks go through validation, the approval gate and their handler.

use async_trait::async_trait;
use cairn_api::ContentBlock;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::events::TaskEvent;
use crate::guard::{AutoApprovalSettings, MistakeLimit};
use crate::host::{PartialView, Ui};
use crate::message::{AskKind, SayKind};
use crate::processor::Presenter;
use crate::state::{AssistantMessageContent, TaskState, ToolUse};
use crate::tool::{ApprovalCategory, BoxedTool, ToolContext, ToolRegistry, ToolResult};

const DENIED: &str = "The user denied this operation.";

/// Dispatches tool blocks to their handlers, one tool per turn
pub struct ToolCoordinator {
    tools: Arc<ToolRegistry>,
    approval: AutoApprovalSettings,
    mistakes: MistakeLimit,
    context: ToolContext,
    events: broadcast::Sender<TaskEvent>,
}

impl ToolCoordinator {
    pub fn new(
        tools: Arc<ToolRegistry>,
        approval: AutoApprovalSettings,
        mistakes: MistakeLimit,
        context: ToolContext,
        events: broadcast::Sender<TaskEvent>,
    ) -> Self {
        Self {
            tools,
            approval,
            mistakes,
            context,
            events,
        }
    }

    pub fn mistakes(&self) -> MistakeLimit {
        self.mistakes
    }

    /// Present every block from `current_streaming_content_index` on.
    ///
    /// Final blocks are handled exactly once and the index moves past them;
    /// a partial block is shown and the index stays on it until it grows or
    /// is finalized. Once the stream is done and every block has been
    /// handled, the next user turn is marked ready.
    pub async fn present(&self, state: &mut TaskState, ui: &mut Ui) -> Result<()> {
        loop {
            if state.handle.is_aborted() {
                return Err(Error::Aborted);
            }
            let index = state.current_streaming_content_index;
            let Some(block) = state.assistant_message_content.get(index).cloned() else {
                break;
            };
            let partial = block.is_partial();
            match block {
                AssistantMessageContent::Text { content, partial } => {
                    self.present_text(content, partial, state, ui).await;
                }
                AssistantMessageContent::ToolUse(tool) => {
                    self.present_tool(index, tool, state, ui).await?;
                }
            }
            if partial {
                break;
            }
            state.current_streaming_content_index += 1;
        }

        if state.did_complete_reading_stream
            && state.current_streaming_content_index >= state.assistant_message_content.len()
        {
            state.user_message_content_ready = true;
        }
        Ok(())
    }

    async fn present_text(&self, content: String, partial: bool, state: &TaskState, ui: &mut Ui) {
        if state.did_reject_tool || state.did_already_use_tool {
            return;
        }
        let content = strip_thinking_tags(&content);
        if content.trim().is_empty() && partial {
            return;
        }
        ui.say(SayKind::Text, Some(content), partial).await;
    }

    async fn present_tool(
        &self,
        index: usize,
        tool: ToolUse,
        state: &mut TaskState,
        ui: &mut Ui,
    ) -> Result<()> {
        let call_id = state.call_id_for(&tool);
        let handler = self.tools.get(&tool.name).cloned();
        let label = handler
            .as_ref()
            .map_or_else(|| format!("[{}]", tool.name), |h| h.describe(&tool));

        if state.did_reject_tool {
            if !tool.partial {
                push_result(
                    state,
                    call_id,
                    &label,
                    ToolResult::error(format!(
                        "Skipping tool {label} due to user rejecting a previous tool."
                    )),
                );
            }
            return Ok(());
        }
        if state.did_already_use_tool {
            if !tool.partial {
                push_result(
                    state,
                    call_id,
                    &label,
                    ToolResult::error(format!(
                        "Tool {label} was not executed because a tool has already been used in this message. \
                         Only one tool may be used per message. You must assess the first tool's result \
                         before proceeding to use the next tool."
                    )),
                );
            }
            return Ok(());
        }

        let key = tool.error_key(index);

        if tool.partial {
            let Some(handler) = handler else {
                return Ok(());
            };
            let mut view = if self.approval.allows(handler.approval_category()) {
                PartialView::say(ui, say_kind(handler.approval_category()))
            } else {
                PartialView::ask(ui, ask_kind(handler.approval_category()))
            };
            if let Err(e) = handler.handle_partial_block(&tool, &mut view).await {
                if e.is_aborted() {
                    return Err(e);
                }
                // Only the final attempt counts; this is a no-op on the counter.
                self.mistakes.record_failure(state, true);
                if state.mark_reported(&key) {
                    ui.say(
                        SayKind::Error,
                        Some(format!("Error while streaming {label}: {e}")),
                        false,
                    )
                    .await;
                }
            }
            return Ok(());
        }

        if let Err(reason) = self.tools.validate(&tool) {
            tracing::debug!(tool = %tool.name, %reason, "tool call rejected by validation");
            self.mistakes.record_failure(state, false);
            ui.discard_partial().await;
            if state.mark_reported(&key) {
                ui.say(
                    SayKind::Error,
                    Some(format!("Invalid {label} call: {reason}")),
                    false,
                )
                .await;
            }
            push_result(
                state,
                call_id,
                &label,
                ToolResult::error(format!(
                    "{reason}. Please retry with complete and valid parameters."
                )),
            );
            state.did_already_use_tool = true;
            return Ok(());
        }
        let Some(handler) = handler else {
            return Err(Error::Other(format!("tool {} passed validation but is not registered", tool.name)));
        };

        let category = handler.approval_category();
        let preview = handler.ui_message(&tool);
        let mut feedback = None;
        if self.approval.allows(category) {
            ui.say(say_kind(category), Some(preview), false).await;
        } else {
            state.awaiting_approval = true;
            let response = ui.ask(ask_kind(category), Some(preview)).await;
            state.awaiting_approval = false;
            let response = response?;

            if let Some(text) = response.feedback() {
                ui.say(SayKind::UserFeedback, Some(text.to_string()), false).await;
                feedback = Some(text.to_string());
            }
            if !response.is_yes() {
                state.did_reject_tool = true;
                let mut message = DENIED.to_string();
                if let Some(text) = &feedback {
                    message.push_str(&format!(
                        "\nThe user provided the following feedback:\n<feedback>\n{text}\n</feedback>"
                    ));
                }
                push_result(state, call_id, &label, ToolResult::text(message));
                return Ok(());
            }
        }

        if matches!(category, ApprovalCategory::Edit | ApprovalCategory::Command) {
            ui.host().save_checkpoint().await;
        }

        let result = self.execute(&handler, &tool, call_id.clone()).await;
        for touch in &result.touched_files {
            ui.store_mut().record_file_touch(touch);
        }
        if result.is_error {
            self.mistakes.record_failure(state, false);
        } else {
            self.mistakes.record_success(state);
        }
        state.did_already_use_tool = true;

        match result.completion.clone().filter(|_| !result.is_error) {
            Some(completion) => {
                self.complete(state, ui, call_id, &label, completion).await?;
            }
            None => {
                push_result(state, call_id, &label, result);
                if let Some(text) = feedback {
                    state
                        .user_message_content
                        .push(ContentBlock::text(format!("<feedback>\n{text}\n</feedback>")));
                }
            }
        }
        Ok(())
    }

    async fn execute(&self, handler: &BoxedTool, tool: &ToolUse, call_id: Option<String>) -> ToolResult {
        let _ = self.events.send(TaskEvent::ToolExecutionStarted {
            tool_name: tool.name.clone(),
            call_id: call_id.clone(),
        });
        tracing::debug!(tool = %tool.name, ?call_id, "executing tool");
        let result = handler.execute(&self.context, tool).await;
        let _ = self.events.send(TaskEvent::ToolExecutionFinished {
            tool_name: tool.name.clone(),
            call_id,
            is_error: result.is_error,
        });
        result
    }

    /// Show a completion result and ask whether the task is done
    async fn complete(
        &self,
        state: &mut TaskState,
        ui: &mut Ui,
        call_id: Option<String>,
        label: &str,
        completion: String,
    ) -> Result<()> {
        state.completion_attempt_count += 1;
        ui.say(SayKind::CompletionResult, Some(completion), false).await;
        let response = ui.ask(AskKind::CompletionResult, None).await?;

        if response.is_yes() {
            state.did_complete_task = true;
            push_result(state, call_id, label, ToolResult::text("The user accepted the result."));
            return Ok(());
        }
        let message = match response.feedback() {
            Some(text) => {
                ui.say(SayKind::UserFeedback, Some(text.to_string()), false).await;
                format!(
                    "The user has provided feedback on the results. Consider their input to continue \
                     the task, and then attempt completion again.\n<feedback>\n{text}\n</feedback>"
                )
            }
            None => "The user did not accept the result. Continue the task, then attempt completion again."
                .to_string(),
        };
        push_result(state, call_id, label, ToolResult::text(message));
        Ok(())
    }
}

/// Queue a tool's output for the next user turn: a `tool_result` block for
/// native calls, a labelled text block for markup calls.
fn push_result(state: &mut TaskState, call_id: Option<String>, label: &str, result: ToolResult) {
    match call_id {
        Some(tool_use_id) => state.user_message_content.push(ContentBlock::ToolResult {
            tool_use_id,
            content: result.content,
            is_error: result.is_error,
        }),
        None => {
            state
                .user_message_content
                .push(ContentBlock::text(format!("{label} Result:")));
            state.user_message_content.extend(result.content);
        }
    }
}

fn ask_kind(category: ApprovalCategory) -> AskKind {
    match category {
        ApprovalCategory::Command => AskKind::Command,
        _ => AskKind::Tool,
    }
}

fn say_kind(category: ApprovalCategory) -> SayKind {
    match category {
        ApprovalCategory::Command => SayKind::Command,
        _ => SayKind::Tool,
    }
}

fn strip_thinking_tags(text: &str) -> String {
    text.replace("<thinking>\n", "")
        .replace("\n</thinking>", "")
        .replace("<thinking>", "")
        .replace("</thinking>", "")
}

/// Binds a coordinator to a task's UI for one stream
pub struct TurnPresenter<'a> {
    pub coordinator: &'a ToolCoordinator,
    pub ui: &'a mut Ui,
}

#[async_trait]
impl Presenter for TurnPresenter<'_> {
    async fn present(&mut self, state: &mut TaskState) -> Result<()> {
        self.coordinator.present(state, self.ui).await
    }

    async fn reasoning(&mut self, text: &str, partial: bool) -> Result<()> {
        self.ui
            .say(SayKind::Reasoning, Some(text.to_string()), partial)
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::TaskHandle;
    use crate::host::tests::{ScriptedHost, ui_with};
    use crate::message::AskResponse;
    use crate::tool::{FileAccess, ToolHandler};
    use parking_lot::Mutex;
    use serde_json::{Map, Value, json};
    use tokio_util::sync::CancellationToken;

    /// Records executions; fails while `fail` is set. Partial handling fails
    /// when `fail_partial` is set.
    struct RecordingTool {
        name: &'static str,
        category: ApprovalCategory,
        fail: Mutex<bool>,
        fail_partial: bool,
        runs: Mutex<Vec<Map<String, Value>>>,
    }

    impl RecordingTool {
        fn new(name: &'static str, category: ApprovalCategory) -> Self {
            Self {
                name,
                category,
                fail: Mutex::new(false),
                fail_partial: false,
                runs: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ToolHandler for RecordingTool {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "recording"
        }

        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "path": { "type": "string" } },
                "required": ["path"]
            })
        }

        fn approval_category(&self) -> ApprovalCategory {
            self.category
        }

        async fn handle_partial_block(
            &self,
            block: &ToolUse,
            ui: &mut dyn crate::tool::PartialUi,
        ) -> Result<()> {
            if self.fail_partial {
                return Err(Error::Other("path not found".into()));
            }
            ui.show_partial(self.ui_message(block)).await
        }

        async fn execute(&self, _ctx: &ToolContext, block: &ToolUse) -> ToolResult {
            self.runs.lock().push(block.params.clone());
            if *self.fail.lock() {
                return ToolResult::error("diff did not apply");
            }
            match block.name.as_str() {
                "attempt_completion" => ToolResult::completion("all done"),
                _ => ToolResult::text("ok").with_touched(block.param("path").unwrap_or_default(), FileAccess::Edit),
            }
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        ui: Ui,
        host: Arc<ScriptedHost>,
        state: TaskState,
        coordinator: ToolCoordinator,
        tool: Arc<RecordingTool>,
    }

    fn fixture(tool: RecordingTool, approval: AutoApprovalSettings, answers: Vec<AskResponse>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(ScriptedHost::answering(answers));
        let handle = TaskHandle::new();
        let ui = ui_with(dir.path(), host.clone(), handle.clone());
        let tool = Arc::new(tool);
        let registry = ToolRegistry::new().with(tool.clone());
        let (events, _) = broadcast::channel(16);
        let coordinator = ToolCoordinator::new(
            Arc::new(registry),
            approval,
            MistakeLimit::new(3),
            ToolContext {
                cwd: dir.path().to_path_buf(),
                task_id: "task-1".into(),
                cancel: CancellationToken::new(),
            },
            events,
        );
        Fixture {
            _dir: dir,
            ui,
            host,
            state: TaskState::new(handle),
            coordinator,
            tool,
        }
    }

    fn auto() -> AutoApprovalSettings {
        AutoApprovalSettings {
            enabled: true,
            edit: true,
            ..Default::default()
        }
    }

    fn tool_block(name: &str, params: Value, partial: bool) -> AssistantMessageContent {
        let Value::Object(params) = params else { unreachable!() };
        AssistantMessageContent::ToolUse(ToolUse::new(name, params, partial))
    }

    fn native(name: &str, id: &str, params: Value, partial: bool) -> AssistantMessageContent {
        let Value::Object(params) = params else { unreachable!() };
        let mut tool = ToolUse::new(name, params, partial);
        tool.call_id = Some(id.into());
        AssistantMessageContent::ToolUse(tool)
    }

    async fn present(f: &mut Fixture, blocks: Vec<AssistantMessageContent>, done: bool) {
        f.state.assistant_message_content = blocks;
        f.state.did_complete_reading_stream = done;
        f.coordinator.present(&mut f.state, &mut f.ui).await.unwrap();
    }

    fn new_turn(f: &mut Fixture) {
        f.state.reset_for_turn();
    }

    #[tokio::test]
    async fn test_auto_approved_tool_runs_once_after_partials() {
        let mut f = fixture(RecordingTool::new("write", ApprovalCategory::Edit), auto(), vec![]);

        present(&mut f, vec![AssistantMessageContent::text("Writing", true)], false).await;
        present(
            &mut f,
            vec![
                AssistantMessageContent::text("Writing", false),
                tool_block("write", json!({"path": "a"}), true),
            ],
            false,
        )
        .await;
        assert!(f.tool.runs.lock().is_empty());

        let final_blocks = vec![
            AssistantMessageContent::text("Writing", false),
            tool_block("write", json!({"path": "a.rs"}), false),
        ];
        present(&mut f, final_blocks.clone(), false).await;
        present(&mut f, final_blocks, true).await;

        assert_eq!(f.tool.runs.lock().len(), 1);
        assert!(f.state.did_already_use_tool);
        assert!(f.state.user_message_content_ready);
        assert_eq!(f.state.user_message_content[0], ContentBlock::text("[write] Result:"));

        // Partial say for the tool was finalized in place, not duplicated.
        let kinds: Vec<_> = f.ui.store().ui_messages().iter().map(|m| (m.say_kind(), m.partial)).collect();
        assert_eq!(
            kinds,
            vec![(Some(SayKind::Text), false), (Some(SayKind::Tool), false)]
        );
        assert!(f.host.asked_kinds().is_empty());
        assert_eq!(f.ui.store().metadata().files_in_context[0].path, "a.rs");
    }

    #[tokio::test]
    async fn test_rejection_feeds_back_and_skips_later_tools() {
        let mut f = fixture(
            RecordingTool::new("write", ApprovalCategory::Edit),
            AutoApprovalSettings::default(),
            vec![AskResponse {
                response: crate::message::AskResponseKind::NoButtonClicked,
                text: Some("use a different file".into()),
                images: vec![],
                files: vec![],
            }],
        );

        present(
            &mut f,
            vec![
                native("write", "c1", json!({"path": "a"}), false),
                native("write", "c2", json!({"path": "b"}), false),
            ],
            true,
        )
        .await;

        assert!(f.tool.runs.lock().is_empty());
        assert!(f.state.did_reject_tool);
        assert_eq!(f.host.asked_kinds(), vec![AskKind::Tool]);
        let ContentBlock::ToolResult { tool_use_id, content, .. } = &f.state.user_message_content[0] else {
            panic!("expected tool result");
        };
        assert_eq!(tool_use_id, "c1");
        let text = content[0].as_text().unwrap();
        assert!(text.starts_with(DENIED));
        assert!(text.contains("use a different file"));
        let ContentBlock::ToolResult { tool_use_id, content, is_error } = &f.state.user_message_content[1] else {
            panic!("expected skip notice");
        };
        assert_eq!(tool_use_id, "c2");
        assert!(*is_error);
        assert!(content[0].as_text().unwrap().starts_with("Skipping tool [write]"));
    }

    #[tokio::test]
    async fn test_second_tool_in_message_is_not_executed() {
        let mut f = fixture(RecordingTool::new("write", ApprovalCategory::Edit), auto(), vec![]);
        present(
            &mut f,
            vec![
                tool_block("write", json!({"path": "a"}), false),
                tool_block("write", json!({"path": "b"}), false),
            ],
            true,
        )
        .await;
        assert_eq!(f.tool.runs.lock().len(), 1);
        let notices: Vec<_> = f
            .state
            .user_message_content
            .iter()
            .filter_map(ContentBlock::as_text)
            .filter(|t| t.contains("was not executed"))
            .collect();
        assert_eq!(notices.len(), 1);
    }

    #[tokio::test]
    async fn test_mistakes_accumulate_to_limit_and_success_resets() {
        let mut f = fixture(RecordingTool::new("write", ApprovalCategory::Edit), auto(), vec![]);
        *f.tool.fail.lock() = true;
        let limit = f.coordinator.mistakes();

        for n in 1..=3u32 {
            new_turn(&mut f);
            present(&mut f, vec![tool_block("write", json!({"path": "a"}), false)], true).await;
            assert_eq!(f.state.consecutive_mistake_count, n);
            assert_eq!(limit.is_reached(&f.state), n == 3);
        }

        *f.tool.fail.lock() = false;
        new_turn(&mut f);
        present(&mut f, vec![tool_block("write", json!({"path": "a"}), false)], true).await;
        assert_eq!(f.state.consecutive_mistake_count, 0);

        // Validation failures count too.
        new_turn(&mut f);
        present(&mut f, vec![tool_block("write", json!({}), false)], true).await;
        assert_eq!(f.state.consecutive_mistake_count, 1);
        assert!(f.state.did_already_use_tool);
    }

    #[tokio::test]
    async fn test_streaming_failures_count_once() {
        let mut tool = RecordingTool::new("write", ApprovalCategory::Edit);
        tool.fail_partial = true;
        let mut f = fixture(tool, auto(), vec![]);

        for i in 0..10 {
            let path = "a".repeat(i + 1);
            present(&mut f, vec![native("write", "c1", json!({"path": path}), true)], false).await;
        }
        assert_eq!(f.state.consecutive_mistake_count, 0);
        let errors = f
            .ui
            .store()
            .ui_messages()
            .iter()
            .filter(|m| m.say_kind() == Some(SayKind::Error))
            .count();
        assert_eq!(errors, 1);

        // The final attempt is validated and counted exactly once.
        present(&mut f, vec![native("write", "c1", json!({}), false)], true).await;
        assert_eq!(f.state.consecutive_mistake_count, 1);
    }

    #[tokio::test]
    async fn test_command_asks_with_command_kind() {
        let mut f = fixture(
            RecordingTool::new("bash", ApprovalCategory::Command),
            auto(),
            vec![AskResponse::yes()],
        );
        present(&mut f, vec![native("bash", "c1", json!({"path": "ls"}), true)], false).await;
        assert_eq!(
            f.ui.store().last_ui_message().unwrap().ask_kind(),
            Some(AskKind::Command)
        );
        present(&mut f, vec![native("bash", "c1", json!({"path": "ls"}), false)], true).await;

        assert_eq!(f.host.asked_kinds(), vec![AskKind::Command]);
        assert_eq!(f.tool.runs.lock().len(), 1);
        assert_eq!(f.ui.store().ui_messages().len(), 1);
        assert!(matches!(
            &f.state.user_message_content[0],
            ContentBlock::ToolResult { tool_use_id, is_error: false, .. } if tool_use_id == "c1"
        ));
    }

    #[tokio::test]
    async fn test_completion_accepted_or_sent_back() {
        let mut f = fixture(
            RecordingTool::new("attempt_completion", ApprovalCategory::ReadOnly),
            AutoApprovalSettings {
                enabled: true,
                ..Default::default()
            },
            vec![AskResponse::message("also update docs"), AskResponse::yes()],
        );

        present(&mut f, vec![tool_block("attempt_completion", json!({"path": "x"}), false)], true).await;
        assert!(!f.state.did_complete_task);
        assert!(f
            .state
            .user_message_content
            .iter()
            .filter_map(ContentBlock::as_text)
            .any(|t| t.contains("also update docs")));

        new_turn(&mut f);
        present(&mut f, vec![tool_block("attempt_completion", json!({"path": "x"}), false)], true).await;
        assert!(f.state.did_complete_task);
        assert_eq!(f.state.completion_attempt_count, 2);
        assert_eq!(
            f.host.asked_kinds(),
            vec![AskKind::CompletionResult, AskKind::CompletionResult]
        );
    }

    #[tokio::test]
    async fn test_abort_stops_presentation() {
        let mut f = fixture(RecordingTool::new("write", ApprovalCategory::Edit), auto(), vec![]);
        f.state.handle.abort();
        f.state.assistant_message_content = vec![tool_block("write", json!({"path": "a"}), false)];
        let err = f.coordinator.present(&mut f.state, &mut f.ui).await.unwrap_err();
        assert!(err.is_aborted());
        assert!(f.tool.runs.lock().is_empty());
    }

    #[test]
    fn test_strip_thinking_tags() {
        assert_eq!(strip_thinking_tags("<thinking>\nhmm\n</thinking> ok"), "hmm ok");
    }
}
