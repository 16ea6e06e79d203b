//! Task completion tool

use async_trait::async_trait;
use cairn_agent::{ApprovalCategory, ToolContext, ToolHandler, ToolResult, ToolUse};
use serde_json::json;

/// Presents the final result; the task ends once the user accepts it
pub struct CompletionTool;

impl CompletionTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CompletionTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolHandler for CompletionTool {
    fn name(&self) -> &str {
        "attempt_completion"
    }

    fn description(&self) -> &str {
        "Present the result of the task to the user once it is done. Do not end the result with a question or an offer of further help."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "result": {
                    "type": "string",
                    "description": "Final description of what was done"
                }
            },
            "required": ["result"]
        })
    }

    fn approval_category(&self) -> ApprovalCategory {
        ApprovalCategory::ReadOnly
    }

    fn describe(&self, _block: &ToolUse) -> String {
        "[attempt_completion]".to_string()
    }

    fn ui_message(&self, block: &ToolUse) -> String {
        block.param("result").unwrap_or_default().to_string()
    }

    async fn execute(&self, _ctx: &ToolContext, block: &ToolUse) -> ToolResult {
        match block.param("result") {
            Some(result) => ToolResult::completion(result.trim()),
            None => ToolResult::error("Missing 'result' argument"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::tests::{block, ctx};

    #[tokio::test]
    async fn test_completion_carries_result() {
        let dir = tempfile::tempdir().unwrap();
        let result = CompletionTool::new()
            .execute(&ctx(dir.path()), &block("attempt_completion", json!({"result": " done \n"})))
            .await;
        assert!(!result.is_error);
        assert_eq!(result.completion.as_deref(), Some("done"));
    }
}
