//! File writing tool

use async_trait::async_trait;
use cairn_agent::{ApprovalCategory, FileAccess, ToolContext, ToolHandler, ToolResult, ToolUse};
use serde_json::json;
use tokio::fs;

use super::resolve_path;

/// Tool for writing file contents
pub struct WriteTool;

impl WriteTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WriteTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolHandler for WriteTool {
    fn name(&self) -> &str {
        "write"
    }

    fn description(&self) -> &str {
        "Write content to a file. Creates the file if it doesn't exist, overwrites if it does. Automatically creates parent directories."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file to write (relative to the working directory or absolute)"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write to the file"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn approval_category(&self) -> ApprovalCategory {
        ApprovalCategory::Edit
    }

    fn describe(&self, block: &ToolUse) -> String {
        format!("[write for '{}']", block.param("path").unwrap_or_default())
    }

    fn ui_message(&self, block: &ToolUse) -> String {
        json!({
            "tool": "write",
            "path": block.param("path"),
            "content": block.param("content"),
        })
        .to_string()
    }

    async fn execute(&self, ctx: &ToolContext, block: &ToolUse) -> ToolResult {
        let Some(path_str) = block.param("path") else {
            return ToolResult::error("Missing 'path' argument");
        };
        let Some(content) = block.param("content") else {
            return ToolResult::error("Missing 'content' argument");
        };
        if path_str == "~" {
            return ToolResult::error("Cannot write to home directory itself");
        }
        let path = resolve_path(&ctx.cwd, path_str);

        if ctx.cancel.is_cancelled() {
            return ToolResult::error("Operation cancelled");
        }

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                if let Err(e) = fs::create_dir_all(parent).await {
                    return ToolResult::error(format!("Failed to create directory: {}", e));
                }
            }
        }

        match fs::write(&path, content).await {
            Ok(()) => ToolResult::text(format!(
                "Successfully wrote {} bytes to {}",
                content.len(),
                path_str
            ))
            .with_touched(path_str, FileAccess::Edit),
            Err(e) => ToolResult::error(format!("Failed to write file: {}", e)),
        }
    }
}
