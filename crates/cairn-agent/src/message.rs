//! UI-facing message records and the API request bookkeeping they carry

use serde::{Deserialize, Serialize};

/// Kinds of questions the task can put to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskKind {
    Followup,
    Command,
    CompletionResult,
    Tool,
    ApiReqFailed,
    ResumeTask,
    ResumeCompletedTask,
    MistakeLimitReached,
    AutoApprovalMaxReqReached,
    NewTask,
}

/// Kinds of informational messages the task emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SayKind {
    Task,
    Error,
    ApiReqStarted,
    Text,
    Reasoning,
    CompletionResult,
    UserFeedback,
    ApiReqRetried,
    Command,
    CommandOutput,
    Tool,
    DiffError,
    Info,
    HookStatus,
}

/// Whether a message asks for a response or only informs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum UiKind {
    Ask { ask: AskKind },
    Say { say: SayKind },
}

/// Display-oriented record of something that happened in a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiMessage {
    pub ts: i64,
    #[serde(flatten)]
    pub kind: UiKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,
    /// Index of the conversation entry that was last when this message was
    /// appended. That is the latest *user* turn: the paired assistant turn is
    /// only pushed once its stream completes. `-1` when history was empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_history_index: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_history_deleted_range: Option<(usize, usize)>,
}

impl UiMessage {
    /// Create a say message; indices are assigned when it is appended
    pub fn say(ts: i64, say: SayKind, text: Option<String>, partial: bool) -> Self {
        Self::new(ts, UiKind::Say { say }, text, partial)
    }

    /// Create an ask message; indices are assigned when it is appended
    pub fn ask(ts: i64, ask: AskKind, text: Option<String>, partial: bool) -> Self {
        Self::new(ts, UiKind::Ask { ask }, text, partial)
    }

    fn new(ts: i64, kind: UiKind, text: Option<String>, partial: bool) -> Self {
        Self {
            ts,
            kind,
            text,
            images: Vec::new(),
            files: Vec::new(),
            partial,
            conversation_history_index: None,
            conversation_history_deleted_range: None,
        }
    }

    pub fn say_kind(&self) -> Option<SayKind> {
        match self.kind {
            UiKind::Say { say } => Some(say),
            UiKind::Ask { .. } => None,
        }
    }

    pub fn ask_kind(&self) -> Option<AskKind> {
        match self.kind {
            UiKind::Ask { ask } => Some(ask),
            UiKind::Say { .. } => None,
        }
    }

    /// Decode the `ApiReqInfo` payload of an `api_req_started` message
    pub fn api_req_info(&self) -> Option<ApiReqInfo> {
        if self.say_kind() != Some(SayKind::ApiReqStarted) {
            return None;
        }
        self.text
            .as_deref()
            .and_then(|t| serde_json::from_str(t).ok())
    }
}

/// Bookkeeping stored as the text of an `api_req_started` message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiReqInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub cache_writes: u64,
    #[serde(default)]
    pub cache_reads: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<CancelReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming_failed_message: Option<String>,
}

/// Why an API request ended early
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    StreamingFailed,
    UserCancelled,
}

/// The user's answer to an ask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AskResponseKind {
    YesButtonClicked,
    NoButtonClicked,
    MessageResponse,
}

/// Response delivered by the host for a blocking ask
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AskResponse {
    pub response: AskResponseKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
}

impl AskResponse {
    pub fn yes() -> Self {
        Self::of(AskResponseKind::YesButtonClicked, None)
    }

    pub fn no() -> Self {
        Self::of(AskResponseKind::NoButtonClicked, None)
    }

    pub fn message(text: impl Into<String>) -> Self {
        Self::of(AskResponseKind::MessageResponse, Some(text.into()))
    }

    fn of(response: AskResponseKind, text: Option<String>) -> Self {
        Self {
            response,
            text,
            images: Vec::new(),
            files: Vec::new(),
        }
    }

    /// Whether the user approved
    pub fn is_yes(&self) -> bool {
        self.response == AskResponseKind::YesButtonClicked
    }

    /// Feedback text, ignoring blank input
    pub fn feedback(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.trim().is_empty())
    }
}
