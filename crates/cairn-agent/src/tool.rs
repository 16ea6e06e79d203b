//! Tool handler contract and registry

use async_trait::async_trait;
use cairn_api::{ContentBlock, ToolSpec};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::parser::ToolGrammar;
use crate::state::ToolUse;

/// Approval bucket a tool falls into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalCategory {
    /// Reads files or state without changing anything
    ReadOnly,
    /// Modifies files in the workspace
    Edit,
    /// Runs a shell command
    Command,
    Other,
}

/// How a tool touched a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAccess {
    Read,
    Edit,
}

/// A file read or edited by a tool, recorded in the task metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileTouch {
    pub path: String,
    pub access: FileAccess,
}

/// Result of a tool execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolResult {
    /// Content to return to the model
    pub content: Vec<ContentBlock>,
    /// Whether the execution resulted in an error
    pub is_error: bool,
    /// Set by completion tools: the result to present to the user
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub touched_files: Vec<FileTouch>,
}

impl ToolResult {
    /// Create a successful text result
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            ..Default::default()
        }
    }

    /// Create an error result
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(message)],
            is_error: true,
            ..Default::default()
        }
    }

    /// A completion attempt; the task ends if the user accepts it
    pub fn completion(result: impl Into<String>) -> Self {
        let result = result.into();
        Self {
            content: vec![ContentBlock::text(result.clone())],
            completion: Some(result),
            ..Default::default()
        }
    }

    /// Create a result with multiple content blocks
    pub fn with_content(content: Vec<ContentBlock>) -> Self {
        Self {
            content,
            ..Default::default()
        }
    }

    /// Record a file the tool read or edited
    pub fn with_touched(mut self, path: impl Into<String>, access: FileAccess) -> Self {
        self.touched_files.push(FileTouch {
            path: path.into(),
            access,
        });
        self
    }

    /// Get the text content as a single string
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| c.as_text())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// What a handler gets to run against
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub cwd: PathBuf,
    pub task_id: String,
    pub cancel: CancellationToken,
}

/// UI access granted to a handler while its block is still streaming
#[async_trait]
pub trait PartialUi: Send {
    /// Show or update the in-progress message for the current block
    async fn show_partial(&mut self, text: String) -> Result<()>;
}

/// Trait for executable tools
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Tool name (used in API calls and markup tags)
    fn name(&self) -> &str;

    /// Tool description for the model
    fn description(&self) -> &str;

    /// JSON Schema for parameters. Its `properties` double as the markup
    /// parameter tags and its `required` list is enforced before execution.
    fn parameters_schema(&self) -> Value;

    fn approval_category(&self) -> ApprovalCategory {
        ApprovalCategory::Other
    }

    /// Short label for logs and skip notices
    fn describe(&self, block: &ToolUse) -> String {
        format!("[{}]", block.name)
    }

    /// Payload shown to the user for this block (and sent with the approval ask)
    fn ui_message(&self, block: &ToolUse) -> String {
        serde_json::json!({ "tool": block.name, "params": block.params }).to_string()
    }

    /// Incremental feedback while the block streams in. Must not touch the
    /// filesystem, network or any other external state.
    async fn handle_partial_block(&self, block: &ToolUse, ui: &mut dyn PartialUi) -> Result<()> {
        ui.show_partial(self.ui_message(block)).await
    }

    /// Run the tool on a final block
    async fn execute(&self, ctx: &ToolContext, block: &ToolUse) -> ToolResult;
}

/// Type alias for a shared handler
pub type BoxedTool = Arc<dyn ToolHandler>;

/// Registered handlers with their compiled parameter validators
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<BoxedTool>,
    /// Cached compiled JSON schema validators keyed by tool name
    schema_cache: HashMap<String, Arc<jsonschema::Validator>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool, replacing any tool with the same name
    pub fn register(&mut self, tool: BoxedTool) {
        self.cache_tool_schema(&tool);
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
    }

    pub fn with(mut self, tool: BoxedTool) -> Self {
        self.register(tool);
        self
    }

    /// Compile and cache the JSON schema validator for a tool.
    fn cache_tool_schema(&mut self, tool: &BoxedTool) {
        let schema = tool.parameters_schema();
        match jsonschema::validator_for(&schema) {
            Ok(validator) => {
                self.schema_cache
                    .insert(tool.name().to_string(), Arc::new(validator));
            }
            Err(e) => {
                tracing::warn!(
                    "Invalid tool parameter schema for '{}', skipping validation: {}",
                    tool.name(),
                    e
                );
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&BoxedTool> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Tool definitions for the provider
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .iter()
            .map(|t| ToolSpec::new(t.name(), t.description(), t.parameters_schema()))
            .collect()
    }

    /// Markup grammar: each tool with the properties of its schema
    pub fn grammar(&self) -> ToolGrammar {
        let mut grammar = ToolGrammar::new();
        for tool in &self.tools {
            let schema = tool.parameters_schema();
            let params: Vec<String> = schema
                .get("properties")
                .and_then(Value::as_object)
                .map(|props| props.keys().cloned().collect())
                .unwrap_or_default();
            grammar.add(tool.name(), params);
        }
        grammar
    }

    /// Check a final block before execution.
    /// Returns a message suitable for the model when the block is unusable.
    pub fn validate(&self, block: &ToolUse) -> std::result::Result<(), String> {
        let Some(tool) = self.get(&block.name) else {
            return Err(format!(
                "Tool '{}' does not exist. Available tools: {}",
                block.name,
                self.names().join(", ")
            ));
        };

        let schema = tool.parameters_schema();
        let missing = schema
            .get("required")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .find(|param| match block.params.get(*param) {
                None | Some(Value::Null) => true,
                Some(Value::String(s)) => s.trim().is_empty(),
                Some(_) => false,
            });
        if let Some(param) = missing {
            return Err(format!(
                "Missing value for required parameter '{param}' of tool '{}'. Please retry with complete response.",
                block.name
            ));
        }

        let args = Value::Object(block.params.clone());
        match self
            .schema_cache
            .get(&block.name)
            .and_then(|validator| validate_with_validator(&args, validator))
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Validate tool arguments using a pre-compiled validator.
/// Returns `Some(error_message)` if validation fails, `None` if valid.
fn validate_with_validator(args: &Value, validator: &jsonschema::Validator) -> Option<String> {
    let errors: Vec<String> = validator
        .iter_errors(args)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{}: {}", path, e)
            }
        })
        .collect();

    if errors.is_empty() {
        None
    } else {
        Some(format!(
            "Tool argument validation failed:\n{}",
            errors.join("\n")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// A simple test tool that echoes its arguments.
    struct EchoTool;

    #[async_trait]
    impl ToolHandler for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echoes input"
        }
        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string" },
                    "count": { "type": "integer" }
                },
                "required": ["text"]
            })
        }
        async fn execute(&self, _ctx: &ToolContext, block: &ToolUse) -> ToolResult {
            ToolResult::text(block.param("text").unwrap_or("(empty)"))
        }
    }

    struct Collect(Vec<String>);

    #[async_trait]
    impl PartialUi for Collect {
        async fn show_partial(&mut self, text: String) -> Result<()> {
            self.0.push(text);
            Ok(())
        }
    }

    fn block(params: Value) -> ToolUse {
        ToolUse::new("echo", params.as_object().cloned().unwrap(), false)
    }

    fn registry() -> ToolRegistry {
        ToolRegistry::new().with(Arc::new(EchoTool))
    }

    #[test]
    fn test_validate_accepts_valid_block() {
        assert!(registry().validate(&block(json!({"text": "hi"}))).is_ok());
    }

    #[test]
    fn test_validate_missing_and_blank_required() {
        let registry = registry();
        let err = registry.validate(&block(json!({}))).unwrap_err();
        assert!(err.contains("'text'"), "got: {err}");
        let err = registry.validate(&block(json!({"text": "  "}))).unwrap_err();
        assert!(err.contains("Missing value"), "got: {err}");
    }

    #[test]
    fn test_validate_schema_types() {
        let err = registry()
            .validate(&block(json!({"text": "hi", "count": "three"})))
            .unwrap_err();
        assert!(err.contains("validation failed"), "got: {err}");
    }

    #[test]
    fn test_validate_unknown_tool() {
        let unknown = ToolUse::new("nope", serde_json::Map::new(), false);
        let err = registry().validate(&unknown).unwrap_err();
        assert!(err.contains("Available tools: echo"), "got: {err}");
    }

    #[test]
    fn test_grammar_and_specs_follow_schema() {
        let registry = registry();
        let grammar = registry.grammar();
        let parsed = crate::parser::parse_assistant_message(
            "<echo><text>hi</text></echo>",
            &grammar,
            true,
        );
        assert_eq!(parsed.blocks[0].as_tool_use().unwrap().param("text"), Some("hi"));

        let specs = registry.specs();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "echo");
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut registry = registry();
        registry.register(Arc::new(EchoTool));
        assert_eq!(registry.names(), vec!["echo"]);
    }

    #[tokio::test]
    async fn test_default_partial_handler_shows_ui_message() {
        let mut ui = Collect(Vec::new());
        let tool = EchoTool;
        let mut b = block(json!({"text": "hel"}));
        b.partial = true;
        tool.handle_partial_block(&b, &mut ui).await.unwrap();
        let shown: Value = serde_json::from_str(&ui.0[0]).unwrap();
        assert_eq!(shown["tool"], "echo");
        assert_eq!(shown["params"]["text"], "hel");
    }

    #[test]
    fn test_tool_result_constructors() {
        let r = ToolResult::error("bad");
        assert!(r.is_error);
        assert_eq!(r.text_content(), "bad");

        let r = ToolResult::completion("done").with_touched("a.rs", FileAccess::Edit);
        assert_eq!(r.completion.as_deref(), Some("done"));
        assert_eq!(r.touched_files[0].access, FileAccess::Edit);
        assert!(!r.is_error);
    }
}
