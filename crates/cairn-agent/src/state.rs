//! Per-task in-flight state

use cairn_api::ContentBlock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

use crate::handle::TaskHandle;

/// A tool invocation parsed from the assistant's output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUse {
    pub name: String,
    pub params: Map<String, Value>,
    /// Still streaming; may grow with later chunks
    pub partial: bool,
    /// Provider call id for native tool calls, `None` for text markup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

impl ToolUse {
    pub fn new(name: impl Into<String>, params: Map<String, Value>, partial: bool) -> Self {
        Self {
            name: name.into(),
            params,
            partial,
            call_id: None,
        }
    }

    /// String value of a parameter
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).and_then(Value::as_str)
    }

    /// Key used to report errors for this call once per stream
    pub fn error_key(&self, index: usize) -> String {
        match &self.call_id {
            Some(id) => id.clone(),
            None => format!("{}#{}", self.name, index),
        }
    }
}

/// One block of the assistant message being built for the current turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantMessageContent {
    Text { content: String, partial: bool },
    ToolUse(ToolUse),
}

impl AssistantMessageContent {
    pub fn text(content: impl Into<String>, partial: bool) -> Self {
        Self::Text {
            content: content.into(),
            partial,
        }
    }

    pub fn is_partial(&self) -> bool {
        match self {
            Self::Text { partial, .. } => *partial,
            Self::ToolUse(tool) => tool.partial,
        }
    }

    pub fn set_partial(&mut self, value: bool) {
        match self {
            Self::Text { partial, .. } => *partial = value,
            Self::ToolUse(tool) => tool.partial = value,
        }
    }

    pub fn as_tool_use(&self) -> Option<&ToolUse> {
        match self {
            Self::ToolUse(tool) => Some(tool),
            Self::Text { .. } => None,
        }
    }
}

/// Mutable record of everything in flight for one task.
///
/// Owned by the running task; the stream processor, the tool coordinator and
/// the guards read and write it between suspension points.
#[derive(Default)]
pub struct TaskState {
    pub is_streaming: bool,
    pub did_complete_reading_stream: bool,
    pub assistant_message_content: Vec<AssistantMessageContent>,
    /// Index of the next block the coordinator will present
    pub current_streaming_content_index: usize,
    /// Tool name to the provider call id most recently seen for it
    pub tool_use_ids: HashMap<String, String>,
    /// Content accumulated for the next user turn
    pub user_message_content: Vec<ContentBlock>,
    pub user_message_content_ready: bool,
    pub awaiting_approval: bool,
    pub did_reject_tool: bool,
    pub did_already_use_tool: bool,
    /// Set once the user accepts a completion result
    pub did_complete_task: bool,
    pub consecutive_mistake_count: u32,
    pub completion_attempt_count: u32,
    /// Error keys already surfaced during the current stream
    pub reported_errors: HashSet<String>,
    pub handle: TaskHandle,
}

impl TaskState {
    pub fn new(handle: TaskHandle) -> Self {
        Self {
            handle,
            ..Default::default()
        }
    }

    /// Clear per-turn fields before a new API request
    pub fn reset_for_turn(&mut self) {
        self.is_streaming = false;
        self.did_complete_reading_stream = false;
        self.assistant_message_content.clear();
        self.current_streaming_content_index = 0;
        self.user_message_content.clear();
        self.user_message_content_ready = false;
        self.awaiting_approval = false;
        self.did_reject_tool = false;
        self.did_already_use_tool = false;
        self.reported_errors.clear();
    }

    /// Call id for a block, falling back to the last id seen for its tool name
    pub fn call_id_for(&self, tool: &ToolUse) -> Option<String> {
        tool.call_id
            .clone()
            .or_else(|| self.tool_use_ids.get(&tool.name).cloned())
    }

    /// Record an error key; returns `false` if it was already reported
    pub fn mark_reported(&mut self, key: &str) -> bool {
        self.reported_errors.insert(key.to_string())
    }

    /// Whether any tool-result block has been queued for this call id
    pub fn has_result_for(&self, call_id: &str) -> bool {
        self.user_message_content.iter().any(|block| {
            matches!(block, ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == call_id)
        })
    }
}
