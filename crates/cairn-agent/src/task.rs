//! The task loop: one API request per turn, tool results fed back until the
//! user accepts a completion, the task is aborted, or a guard halts it.

use cairn_api::{ApiHandler, ContentBlock, ConversationEntry, Role, Usage};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::TaskConfig;
use crate::coordinator::{ToolCoordinator, TurnPresenter};
use crate::error::{Error, Result};
use crate::events::TaskEvent;
use crate::guard::{AutoApprovalGuard, MistakeLimit};
use crate::handle::TaskHandle;
use crate::history::TaskHistoryStore;
use crate::hooks::{HookData, HookEvent, HookExecutor, HookOutcome};
use crate::host::{Host, Ui};
use crate::message::{ApiReqInfo, AskKind, CancelReason, SayKind, UiMessage};
use crate::persistence::MessageStore;
use crate::processor::{INTERRUPTED_BY_API_ERROR, StreamProcessor, StreamStop};
use crate::rate_limit::RateLimiter;
use crate::state::TaskState;
use crate::tool::{ToolContext, ToolRegistry};

pub const NO_TOOLS_USED: &str =
    "[ERROR] You did not use a tool in your previous response! Please retry with a tool use.";

const MISTAKE_LIMIT_PROMPT: &str = "The model has made several mistakes in a row. This may indicate a \
    failure in its thought process or inability to use a tool properly, which can be mitigated with some \
    user guidance (e.g. \"Try breaking down the task into smaller steps\").";

const NO_RESPONSE: &str = "Unexpected API Response: The language model did not provide any assistant \
    messages. This may indicate an issue with the API or the model's output.";

/// Collaborators shared between a task and its sub-tasks
#[derive(Clone)]
pub struct TaskServices {
    pub api: Arc<dyn ApiHandler>,
    pub tools: Arc<ToolRegistry>,
    pub host: Arc<dyn Host>,
    pub history: Arc<TaskHistoryStore>,
    pub rate_limiter: Arc<RateLimiter>,
}

/// Summary of a task that ran to an accepted completion
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOutcome {
    pub turns: u32,
    pub usage: Usage,
    pub cost: f64,
}

enum TurnEnd {
    Completed,
    Continue(Vec<ContentBlock>),
}

/// A single task: its state, message store and the loop that drives it
pub struct Task {
    id: String,
    config: TaskConfig,
    services: TaskServices,
    state: TaskState,
    ui: Ui,
    guard: AutoApprovalGuard,
    mistakes: MistakeLimit,
    coordinator: ToolCoordinator,
    hooks: HookExecutor,
    event_tx: broadcast::Sender<TaskEvent>,
    outcome: TaskOutcome,
}

impl Task {
    /// Create a fresh task with a new id
    pub fn new(config: TaskConfig, services: TaskServices) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let store = MessageStore::new(&id, Arc::clone(&services.history));
        Self::with_store(id, config, services, store)
    }

    /// Reopen a saved task. Call [`Task::resume`] to continue it.
    pub fn load(config: TaskConfig, services: TaskServices, id: &str) -> Result<Self> {
        let store = MessageStore::load(id, Arc::clone(&services.history))?;
        Ok(Self::with_store(id.to_string(), config, services, store))
    }

    fn with_store(id: String, config: TaskConfig, services: TaskServices, store: MessageStore) -> Self {
        let handle = TaskHandle::new();
        let (event_tx, _) = broadcast::channel(256);
        let store = store.with_workspace_paths(vec![config.cwd.display().to_string()]);
        let ui = Ui::new(
            store,
            Arc::clone(&services.host),
            handle.clone(),
            config.ask_timeout,
        );
        let mistakes = MistakeLimit::new(config.mistake_limit);
        let coordinator = ToolCoordinator::new(
            Arc::clone(&services.tools),
            config.auto_approval.clone(),
            mistakes,
            ToolContext {
                cwd: config.cwd.clone(),
                task_id: id.clone(),
                cancel: handle.cancel_token(),
            },
            event_tx.clone(),
        );
        Self {
            guard: AutoApprovalGuard::new(config.auto_approval.clone()),
            hooks: HookExecutor::new(config.hooks.clone()),
            state: TaskState::new(handle),
            id,
            config,
            services,
            ui,
            mistakes,
            coordinator,
            event_tx,
            outcome: TaskOutcome::default(),
        }
    }

    /// Create a child task sharing this task's rate limiter and history store
    pub fn spawn_subtask(&self, config: TaskConfig) -> Task {
        tracing::debug!(parent = %self.id, "spawning sub-task");
        Task::new(config, self.services.clone())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Handle for aborting the task from another task or thread
    pub fn handle(&self) -> TaskHandle {
        self.state.handle.clone()
    }

    pub fn services(&self) -> &TaskServices {
        &self.services
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.event_tx.subscribe()
    }

    pub fn ui_messages(&self) -> &[UiMessage] {
        self.ui.store().ui_messages()
    }

    pub fn api_history(&self) -> &[ConversationEntry] {
        self.ui.store().api_history()
    }

    pub fn state(&self) -> &TaskState {
        &self.state
    }

    /// Start the task with the user's request
    pub async fn start(&mut self, task: &str) -> Result<TaskOutcome> {
        let _ = self.event_tx.send(TaskEvent::TaskStarted {
            task_id: self.id.clone(),
        });
        self.ui.say(SayKind::Task, Some(task.to_string()), false).await;

        let mut content = vec![ContentBlock::text(format!("<task>\n{task}\n</task>"))];
        for data in [
            HookData::TaskStart {
                task: task.to_string(),
            },
            HookData::UserPromptSubmit {
                prompt: task.to_string(),
            },
        ] {
            let event = data.event();
            let outcome = self.run_hook(data).await;
            if outcome.cancel {
                return self.cancelled_by_hook(event, outcome).await;
            }
            content.extend(outcome.context_block(event).map(ContentBlock::text));
        }
        self.run_loop(content).await
    }

    /// Continue a loaded task after asking the user to confirm
    pub async fn resume(&mut self) -> Result<TaskOutcome> {
        let _ = self.event_tx.send(TaskEvent::TaskStarted {
            task_id: self.id.clone(),
        });

        let mut messages = self.ui.store().ui_messages().to_vec();
        while messages.last().is_some_and(|m| {
            m.partial
                || matches!(
                    m.ask_kind(),
                    Some(AskKind::ResumeTask | AskKind::ResumeCompletedTask)
                )
        }) {
            messages.pop();
        }
        let completed = messages.last().is_some_and(|m| {
            m.say_kind() == Some(SayKind::CompletionResult)
                || m.ask_kind() == Some(AskKind::CompletionResult)
        });
        let message_count = messages.len();
        let last_message_ts = messages.last().map(|m| m.ts);
        if let Some(items) = self.ui.store_mut().overwrite_ui_messages(messages) {
            self.ui.host().history_updated(&items);
        }

        let kind = if completed {
            AskKind::ResumeCompletedTask
        } else {
            AskKind::ResumeTask
        };
        let response = self.ui.ask(kind, None).await?;
        let feedback = response.feedback().map(str::to_string);
        if let Some(text) = &feedback {
            self.ui.say(SayKind::UserFeedback, Some(text.clone()), false).await;
        }

        let hook = self
            .run_hook(HookData::TaskResume {
                message_count,
                last_message_ts,
            })
            .await;
        if hook.cancel {
            return self.cancelled_by_hook(HookEvent::TaskResume, hook).await;
        }

        let mut history = self.ui.store().api_history().to_vec();
        let mut content = Vec::new();
        match history.last().map(|e| e.role) {
            // A user turn that never got an answer is re-sent with the resumption note.
            Some(Role::User) => {
                if let Some(entry) = history.pop() {
                    content = entry.content;
                }
            }
            Some(Role::Assistant) => {
                if let Some(entry) = history.last() {
                    for (id, _, _) in entry.tool_uses() {
                        if !content.iter().any(|b| {
                            matches!(b, ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == id)
                        }) {
                            content.push(ContentBlock::tool_result(
                                id,
                                "Task was interrupted before this tool call could be completed.",
                                true,
                            ));
                        }
                    }
                }
            }
            None => {}
        }
        let deleted_range = self.ui.store().deleted_range();
        self.ui.store_mut().overwrite_api_history(history, deleted_range);

        let mut note = format!(
            "[TASK RESUMPTION] This task was interrupted. It may or may not be complete, so please \
             reassess the task context. The current working directory is '{}'. If the task has not \
             been completed, retry the last step before interruption and proceed with completing the task.",
            self.config.cwd.display()
        );
        if completed {
            note.push_str(" The last attempt at completion was shown to the user before the interruption.");
        }
        if let Some(text) = &feedback {
            note.push_str(&format!(
                "\n\nNew instructions for task continuation:\n<user_message>\n{text}\n</user_message>"
            ));
        }
        content.push(ContentBlock::text(note));
        content.extend(hook.context_block(HookEvent::TaskResume).map(ContentBlock::text));

        self.run_loop(content).await
    }

    async fn run_hook(&mut self, data: HookData) -> HookOutcome {
        let event = data.event();
        let roots = vec![self.config.cwd.display().to_string()];
        let outcome = self.hooks.run(data, &roots, &mut self.ui).await;
        if outcome.status.is_some() {
            let _ = self.event_tx.send(TaskEvent::HookFinished {
                hook_name: event.name().to_string(),
                cancel: outcome.cancel,
            });
        }
        outcome
    }

    async fn cancelled_by_hook(&mut self, event: HookEvent, outcome: HookOutcome) -> Result<TaskOutcome> {
        let reason = outcome
            .error_message
            .unwrap_or_else(|| format!("The {event} hook cancelled the task."));
        self.ui.say(SayKind::Error, Some(reason.clone()), false).await;
        Err(Error::Halted(reason))
    }

    async fn run_loop(&mut self, first: Vec<ContentBlock>) -> Result<TaskOutcome> {
        let handle = self.state.handle.clone();
        handle.set_running(true);

        let result = self.drive(first).await;
        match &result {
            Err(e) if e.is_aborted() => self.on_abort().await,
            Err(e) if e.is_user_visible() => {
                tracing::warn!(task_id = %self.id, error = %e, "task stopped");
                let _ = self.event_tx.send(TaskEvent::Error {
                    message: e.to_string(),
                });
            }
            _ => {}
        }

        handle.set_running(false);
        let _ = self.event_tx.send(TaskEvent::TaskEnded {
            turns: self.outcome.turns,
            completed: result.is_ok(),
        });
        result
    }

    async fn drive(&mut self, mut next: Vec<ContentBlock>) -> Result<TaskOutcome> {
        loop {
            if self.state.handle.is_aborted() {
                return Err(Error::Aborted);
            }
            self.check_mistake_limit(&mut next).await?;
            self.check_request_limits().await?;

            match self.turn(next).await? {
                TurnEnd::Completed => return Ok(self.outcome.clone()),
                TurnEnd::Continue(content) => next = content,
            }
        }
    }

    /// Ask the user for guidance once the consecutive-mistake ceiling is hit
    async fn check_mistake_limit(&mut self, next: &mut Vec<ContentBlock>) -> Result<()> {
        if !self.mistakes.is_reached(&self.state) {
            return Ok(());
        }
        let response = self
            .ui
            .ask(AskKind::MistakeLimitReached, Some(MISTAKE_LIMIT_PROMPT.to_string()))
            .await?;
        if let Some(text) = response.feedback() {
            self.ui.say(SayKind::UserFeedback, Some(text.to_string()), false).await;
            next.push(ContentBlock::text(format!(
                "You seem to be having trouble proceeding. The user has provided the following feedback \
                 to help guide you:\n<feedback>\n{text}\n</feedback>"
            )));
        } else if !response.is_yes() {
            return Err(Error::Halted("too many consecutive mistakes".to_string()));
        }
        self.mistakes.record_success(&mut self.state);
        Ok(())
    }

    /// Ask before exceeding the auto-approved request or cost ceiling
    async fn check_request_limits(&mut self) -> Result<()> {
        let check = self.guard.check_limits(self.ui.store().ui_messages());
        let Some(prompt) = check.prompt() else {
            return Ok(());
        };
        tracing::info!(?check, "auto-approval ceiling reached");
        let response = self
            .ui
            .ask(AskKind::AutoApprovalMaxReqReached, Some(prompt))
            .await?;
        if !response.is_yes() && response.feedback().is_none() {
            return Err(Error::Halted("auto-approval limit reached".to_string()));
        }
        self.guard.reset(self.ui.store().ui_messages().len());
        Ok(())
    }

    async fn turn(&mut self, user_content: Vec<ContentBlock>) -> Result<TurnEnd> {
        self.outcome.turns += 1;
        let turn = self.outcome.turns;
        let _ = self.event_tx.send(TaskEvent::TurnStarted { turn });

        let mut info = ApiReqInfo {
            request: Some(
                user_content
                    .iter()
                    .filter_map(ContentBlock::as_text)
                    .collect::<Vec<_>>()
                    .join("\n\n"),
            ),
            ..Default::default()
        };
        let req_ts = self
            .ui
            .say(SayKind::ApiReqStarted, Some(serde_json::to_string(&info)?), false)
            .await;
        self.ui
            .store_mut()
            .add_to_api_history(ConversationEntry::user(user_content));
        self.state.reset_for_turn();

        let api = Arc::clone(&self.services.api);
        let model = api.model();
        self.ui.store_mut().record_model_usage(&model);

        let cancel = self.state.handle.cancel_token();
        let interval = self.config.rate_limit_interval();
        self.services.rate_limiter.wait(interval, &cancel).await?;

        let specs = self.services.tools.specs();
        let stream = loop {
            let attempt = {
                let history = self.ui.store().request_history();
                api.create_message(&self.config.system_prompt, &history, &specs)
                    .await
            };
            match attempt {
                Ok(stream) => break stream,
                Err(e) if matches!(e, cairn_api::Error::Aborted) => return Err(Error::Aborted),
                Err(e) => {
                    tracing::warn!(error = %e, retryable = e.is_retryable(), "API request failed");
                    if e.is_context_overflow() {
                        if let Some((start, end)) = self.ui.store_mut().truncate_context() {
                            self.ui
                                .say(
                                    SayKind::Info,
                                    Some(format!(
                                        "Context window exceeded. Conversation entries {start}-{end} are left out of requests."
                                    )),
                                    false,
                                )
                                .await;
                            self.services.rate_limiter.wait(interval, &cancel).await?;
                            continue;
                        }
                    }
                    let response = self.ui.ask(AskKind::ApiReqFailed, Some(e.to_string())).await?;
                    if !response.is_yes() {
                        return Err(Error::Halted(format!("API request failed: {e}")));
                    }
                    self.ui.say(SayKind::ApiReqRetried, None, false).await;
                    self.services.rate_limiter.wait(interval, &cancel).await?;
                }
            }
        };

        let mut processor = StreamProcessor::new(self.services.tools.grammar(), self.config.max_reparse_bytes);
        let mut presenter = TurnPresenter {
            coordinator: &self.coordinator,
            ui: &mut self.ui,
        };
        let processed = processor
            .process_stream(stream, &mut self.state, &mut presenter, api.as_ref())
            .await;
        let mut local_error = None;
        let (usage, stop, stream_error) = match processed {
            Ok(outcome) => (outcome.usage, outcome.stop, None),
            Err(e) if e.is_aborted() => (processor.usage(), StreamStop::Aborted, None),
            Err(Error::Api(e)) => {
                processor.interrupt(INTERRUPTED_BY_API_ERROR);
                (processor.usage(), StreamStop::Interrupted, Some(e))
            }
            // Raised by an ask or a tool while presenting, not by the provider
            Err(e) => {
                local_error = Some(e);
                (processor.usage(), StreamStop::Interrupted, None)
            }
        };

        let cost = usage.cost(&model);
        info.tokens_in = usage.input_tokens;
        info.tokens_out = usage.output_tokens;
        info.cache_writes = usage.cache_write_tokens;
        info.cache_reads = usage.cache_read_tokens;
        info.cost = Some(cost);
        if stop == StreamStop::Aborted {
            info.cancel_reason = Some(CancelReason::UserCancelled);
        }
        if let Some(e) = &stream_error {
            info.cancel_reason = Some(CancelReason::StreamingFailed);
            info.streaming_failed_message = Some(e.to_string());
        }
        self.ui.update_text(req_ts, serde_json::to_string(&info)?).await;
        self.add_usage(usage, cost);
        let _ = self.event_tx.send(TaskEvent::TurnEnded { turn, usage });

        if stop == StreamStop::Aborted {
            self.ui.close_partial().await;
            if !self.state.handle.is_abandoned() {
                self.record_assistant(&processor);
            }
            return Err(Error::Aborted);
        }

        if let Some(e) = local_error {
            self.ui.close_partial().await;
            self.record_assistant(&processor);
            return Err(e);
        }

        if let Some(e) = stream_error {
            self.ui.close_partial().await;
            self.record_assistant(&processor);
            let response = self.ui.ask(AskKind::ApiReqFailed, Some(e.to_string())).await?;
            if !response.is_yes() {
                return Err(Error::Halted(format!("response stream failed: {e}")));
            }
            self.ui.say(SayKind::ApiReqRetried, None, false).await;
            let mut next = std::mem::take(&mut self.state.user_message_content);
            next.push(ContentBlock::text(
                "The previous response was cut off by an API error. Continue from where it stopped.",
            ));
            return Ok(TurnEnd::Continue(next));
        }

        if !processor.has_content() {
            self.ui.say(SayKind::Error, Some(NO_RESPONSE.to_string()), false).await;
            self.ui.store_mut().add_to_api_history(ConversationEntry::assistant(vec![
                ContentBlock::text("Failure: I did not provide a response."),
            ]));
            self.mistakes.record_failure(&mut self.state, false);
            return Ok(TurnEnd::Continue(vec![ContentBlock::text(NO_TOOLS_USED)]));
        }

        self.record_assistant(&processor);
        if self.state.did_complete_task {
            return Ok(TurnEnd::Completed);
        }

        let used_tool = self
            .state
            .assistant_message_content
            .iter()
            .any(|block| block.as_tool_use().is_some());
        let mut next = std::mem::take(&mut self.state.user_message_content);
        if !used_tool {
            self.mistakes.record_failure(&mut self.state, false);
            next.push(ContentBlock::text(NO_TOOLS_USED));
        }
        Ok(TurnEnd::Continue(next))
    }

    fn record_assistant(&mut self, processor: &StreamProcessor) {
        let content = processor.assistant_entry_content(&self.state);
        if !content.is_empty() {
            self.ui
                .store_mut()
                .add_to_api_history(ConversationEntry::assistant(content));
        }
    }

    fn add_usage(&mut self, usage: Usage, cost: f64) {
        let total = &mut self.outcome.usage;
        total.input_tokens += usage.input_tokens;
        total.output_tokens += usage.output_tokens;
        total.cache_write_tokens += usage.cache_write_tokens;
        total.cache_read_tokens += usage.cache_read_tokens;
        self.outcome.cost += cost;
    }

    async fn on_abort(&mut self) {
        self.ui.close_partial().await;
        if self.state.handle.is_abandoned() {
            tracing::debug!(task_id = %self.id, "task abandoned, skipping cancel hook");
            return;
        }
        self.run_hook(HookData::TaskCancel {
            completion_status: "cancelled".to_string(),
        })
        .await;
    }
}
