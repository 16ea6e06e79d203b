//! File editing tool

use async_trait::async_trait;
use cairn_agent::{ApprovalCategory, FileAccess, ToolContext, ToolHandler, ToolResult, ToolUse};
use serde_json::json;
use similar::{ChangeTag, TextDiff};
use tokio::fs;

use super::resolve_path;

const MAX_DIFF_LINES: usize = 50;

/// Tool for editing files with find/replace
pub struct EditTool;

impl EditTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for EditTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolHandler for EditTool {
    fn name(&self) -> &str {
        "edit"
    }

    fn description(&self) -> &str {
        "Edit a file by replacing exact text. The old_text must match exactly (including whitespace). Use this for precise, surgical edits."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file to edit (relative to the working directory or absolute)"
                },
                "old_text": {
                    "type": "string",
                    "description": "Exact text to find and replace (must match exactly)"
                },
                "new_text": {
                    "type": "string",
                    "description": "New text to replace the old text with (omit to delete it)"
                }
            },
            "required": ["path", "old_text"]
        })
    }

    fn approval_category(&self) -> ApprovalCategory {
        ApprovalCategory::Edit
    }

    fn describe(&self, block: &ToolUse) -> String {
        format!("[edit for '{}']", block.param("path").unwrap_or_default())
    }

    async fn execute(&self, ctx: &ToolContext, block: &ToolUse) -> ToolResult {
        let Some(path_str) = block.param("path") else {
            return ToolResult::error("Missing 'path' argument");
        };
        let Some(old_text) = block.param("old_text") else {
            return ToolResult::error("Missing 'old_text' argument");
        };
        let new_text = block.param("new_text").unwrap_or_default();
        let path = resolve_path(&ctx.cwd, path_str);

        if ctx.cancel.is_cancelled() {
            return ToolResult::error("Operation cancelled");
        }

        let content = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) => return ToolResult::error(format!("Failed to read file: {}", e)),
        };

        let occurrences = content.matches(old_text).count();
        if occurrences == 0 {
            return ToolResult::error(format!(
                "Could not find the exact text in {}. The old text must match exactly including all whitespace and newlines.",
                path_str
            ));
        }
        if occurrences > 1 {
            return ToolResult::error(format!(
                "Found {} occurrences of the text in {}. The text must be unique. Please provide more context to make it unique.",
                occurrences, path_str
            ));
        }

        let new_content = content.replacen(old_text, new_text, 1);
        if content == new_content {
            return ToolResult::error(format!(
                "No changes made to {}. The replacement produced identical content.",
                path_str
            ));
        }

        let diff = generate_diff(&content, &new_content);

        if ctx.cancel.is_cancelled() {
            return ToolResult::error("Operation cancelled");
        }

        match fs::write(&path, &new_content).await {
            Ok(()) => ToolResult::text(format!(
                "Successfully replaced text in {}. Changed {} characters to {} characters.\n\nDiff:\n{}",
                path_str,
                old_text.len(),
                new_text.len(),
                diff
            ))
            .with_touched(path_str, FileAccess::Edit),
            Err(e) => ToolResult::error(format!("Failed to write file: {}", e)),
        }
    }
}

/// Generate a unified diff string
fn generate_diff(old: &str, new: &str) -> String {
    let diff = TextDiff::from_lines(old, new);
    let mut output = Vec::new();

    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => "-",
            ChangeTag::Insert => "+",
            ChangeTag::Equal => " ",
        };
        output.push(format!("{}{}", sign, change));
    }

    if output.len() > MAX_DIFF_LINES {
        output.truncate(MAX_DIFF_LINES);
        output.push("... (diff truncated)\n".to_string());
    }

    output.join("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::tests::{block, ctx};

    #[tokio::test]
    async fn test_edit_replaces_unique_text() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lib.rs"), "fn a() {}\nfn b() {}\n").unwrap();

        let result = EditTool::new()
            .execute(
                &ctx(dir.path()),
                &block("edit", json!({"path": "lib.rs", "old_text": "fn b() {}", "new_text": "fn c() {}"})),
            )
            .await;
        assert!(!result.is_error, "{}", result.text_content());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("lib.rs")).unwrap(),
            "fn a() {}\nfn c() {}\n"
        );
        let text = result.text_content();
        assert!(text.contains("-fn b() {}"));
        assert!(text.contains("+fn c() {}"));
        assert_eq!(result.touched_files[0].access, FileAccess::Edit);
    }

    #[tokio::test]
    async fn test_edit_rejects_ambiguous_or_missing_text() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x.txt"), "same\nsame\n").unwrap();
        let tool = EditTool::new();

        let ambiguous = tool
            .execute(
                &ctx(dir.path()),
                &block("edit", json!({"path": "x.txt", "old_text": "same", "new_text": "diff"})),
            )
            .await;
        assert!(ambiguous.is_error);
        assert!(ambiguous.text_content().contains("2 occurrences"));

        let missing = tool
            .execute(
                &ctx(dir.path()),
                &block("edit", json!({"path": "x.txt", "old_text": "other", "new_text": "diff"})),
            )
            .await;
        assert!(missing.is_error);
        assert_eq!(std::fs::read_to_string(dir.path().join("x.txt")).unwrap(), "same\nsame\n");
    }
}
