//! File reading tool

use async_trait::async_trait;
use cairn_agent::{ApprovalCategory, FileAccess, ToolContext, ToolHandler, ToolResult, ToolUse};
use serde_json::json;
use tokio::fs;

use super::resolve_path;

const MAX_LINES: usize = 2000;
const MAX_LINE_LENGTH: usize = 2000;

/// Tool for reading file contents
pub struct ReadTool;

impl ReadTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ReadTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolHandler for ReadTool {
    fn name(&self) -> &str {
        "read"
    }

    fn description(&self) -> &str {
        "Read the contents of a file. Supports text files. For large files, use offset and limit parameters."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file to read (relative to the working directory or absolute)"
                },
                "offset": {
                    "type": ["integer", "string"],
                    "description": "Line number to start reading from (1-indexed)"
                },
                "limit": {
                    "type": ["integer", "string"],
                    "description": "Maximum number of lines to read"
                }
            },
            "required": ["path"]
        })
    }

    fn approval_category(&self) -> ApprovalCategory {
        ApprovalCategory::ReadOnly
    }

    fn describe(&self, block: &ToolUse) -> String {
        format!("[read for '{}']", block.param("path").unwrap_or_default())
    }

    async fn execute(&self, ctx: &ToolContext, block: &ToolUse) -> ToolResult {
        let Some(path_str) = block.param("path") else {
            return ToolResult::error("Missing 'path' argument");
        };
        let path = resolve_path(&ctx.cwd, path_str);

        if ctx.cancel.is_cancelled() {
            return ToolResult::error("Operation cancelled");
        }

        let content = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) => return ToolResult::error(format!("Failed to read file: {}", e)),
        };

        let lines: Vec<&str> = content.lines().collect();
        let total_lines = lines.len();

        // Markup parameters arrive as strings, native calls as numbers.
        let offset = number_param(block, "offset")
            .map(|o| o.saturating_sub(1))
            .unwrap_or(0);
        let limit = number_param(block, "limit").unwrap_or(MAX_LINES);

        if total_lines == 0 {
            return ToolResult::text("(empty file)").with_touched(path_str, FileAccess::Read);
        }
        if offset >= total_lines {
            return ToolResult::error(format!(
                "Offset {} is beyond end of file ({} lines total)",
                offset + 1,
                total_lines
            ));
        }

        let end = offset.saturating_add(limit).min(total_lines);
        let mut had_truncated = false;
        let formatted: Vec<String> = lines[offset..end]
            .iter()
            .map(|line| {
                if line.chars().count() > MAX_LINE_LENGTH {
                    had_truncated = true;
                    line.chars().take(MAX_LINE_LENGTH).collect()
                } else {
                    line.to_string()
                }
            })
            .collect();

        let mut output = formatted.join("\n");

        let mut notices = Vec::new();
        if had_truncated {
            notices.push(format!(
                "Some lines were truncated to {} characters",
                MAX_LINE_LENGTH
            ));
        }
        if end < total_lines {
            notices.push(format!(
                "{} more lines not shown. Use offset={} to continue reading",
                total_lines - end,
                end + 1
            ));
        }
        if !notices.is_empty() {
            output.push_str(&format!("\n\n... ({})", notices.join(". ")));
        }

        ToolResult::text(output).with_touched(path_str, FileAccess::Read)
    }
}

fn number_param(block: &ToolUse, name: &str) -> Option<usize> {
    let value = block.params.get(name)?;
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
        .map(|n| n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::tests::{block, ctx};

    #[tokio::test]
    async fn test_read_with_offset_and_limit() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\ntwo\nthree\nfour").unwrap();

        let result = ReadTool::new()
            .execute(&ctx(dir.path()), &block("read", json!({"path": "a.txt", "offset": "2", "limit": 2})))
            .await;
        assert!(!result.is_error);
        let text = result.text_content();
        assert!(text.starts_with("two\nthree"), "got: {text}");
        assert!(text.contains("Use offset=4"));
        assert_eq!(result.touched_files[0].access, FileAccess::Read);
    }

    #[tokio::test]
    async fn test_read_missing_file_and_bad_offset() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ReadTool::new();
        let missing = tool
            .execute(&ctx(dir.path()), &block("read", json!({"path": "nope.txt"})))
            .await;
        assert!(missing.is_error);
        assert!(missing.touched_files.is_empty());

        std::fs::write(dir.path().join("b.txt"), "only").unwrap();
        let past_end = tool
            .execute(&ctx(dir.path()), &block("read", json!({"path": "b.txt", "offset": 5})))
            .await;
        assert!(past_end.is_error);
        assert!(past_end.text_content().contains("beyond end of file"));
    }
}
