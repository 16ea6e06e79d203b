//! Task event types

use cairn_api::Usage;
use serde::{Deserialize, Serialize};

/// Events emitted while a task runs, for observers that are not the host UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// Task loop started (fresh or resumed)
    TaskStarted { task_id: String },

    /// An API request is about to be made
    TurnStarted { turn: u32 },

    /// A hook ran for a lifecycle event
    HookFinished { hook_name: String, cancel: bool },

    /// Tool execution started
    ToolExecutionStarted {
        tool_name: String,
        call_id: Option<String>,
    },

    /// Tool execution completed
    ToolExecutionFinished {
        tool_name: String,
        call_id: Option<String>,
        is_error: bool,
    },

    /// The response for a turn has been recorded
    TurnEnded { turn: u32, usage: Usage },

    /// Task loop finished
    TaskEnded { turns: u32, completed: bool },

    /// Error occurred
    Error { message: String },
}

impl TaskEvent {
    /// Check if this is a terminal event
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskEvent::TaskEnded { .. } | TaskEvent::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tagging() {
        let event = TaskEvent::ToolExecutionFinished {
            tool_name: "bash".into(),
            call_id: Some("t1".into()),
            is_error: false,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "tool_execution_finished");
        assert!(!event.is_terminal());
        assert!(TaskEvent::TaskEnded { turns: 1, completed: true }.is_terminal());
    }
}
