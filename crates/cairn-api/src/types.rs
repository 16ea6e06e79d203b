//! Core conversation types shared by the execution core and providers

use serde::{Deserialize, Serialize};

/// Cost information for a model (per million tokens)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CostInfo {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
}

/// What the core needs to know about the model behind an `ApiHandler`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModelInfo {
    /// Model identifier (e.g., "claude-sonnet-4-5")
    pub id: String,
    /// Provider name, used for bookkeeping only
    pub provider: String,
    /// Cost per million tokens
    pub cost: CostInfo,
    /// Context window size in tokens
    pub context_window: u32,
}

/// Cumulative token usage for one API request
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_write_tokens: u64,
    pub cache_read_tokens: u64,
    /// Most recent provider-reported cost, if the provider reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<f64>,
}

impl Usage {
    /// Cost of this usage: the provider figure when present, otherwise computed from pricing
    pub fn cost(&self, model: &ModelInfo) -> f64 {
        if let Some(cost) = self.total_cost {
            return cost;
        }
        let per_million = |tokens: u64, price: f64| (tokens as f64 / 1_000_000.0) * price;
        per_million(self.input_tokens, model.cost.input)
            + per_million(self.output_tokens, model.cost.output)
            + per_million(self.cache_write_tokens, model.cost.cache_write)
            + per_million(self.cache_read_tokens, model.cost.cache_read)
    }

    /// Whether any tokens were counted
    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0
            && self.output_tokens == 0
            && self.cache_write_tokens == 0
            && self.cache_read_tokens == 0
            && self.total_cost.is_none()
    }
}

/// Speaker of a conversation entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Base64 image payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSource {
    pub media_type: String,
    pub data: String,
}

/// A single block inside a conversation entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text
    Text { text: String },
    /// Image content (base64 encoded)
    Image { source: ImageSource },
    /// Model reasoning, kept so providers that require it can replay it
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    /// Tool invocation issued by the assistant
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// Result of a tool invocation, sent back in the next user turn
    ToolResult {
        tool_use_id: String,
        content: Vec<ContentBlock>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

impl ContentBlock {
    /// Create text content
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Create a tool result carrying a single text block
    pub fn tool_result(tool_use_id: impl Into<String>, text: impl Into<String>, is_error: bool) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: vec![Self::text(text)],
            is_error,
        }
    }

    /// Get text if this is text content
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// One model-facing turn of the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    /// Millisecond timestamp at which the entry was appended
    #[serde(default)]
    pub ts: i64,
}

impl ConversationEntry {
    /// Create a user entry
    pub fn user(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content,
            ts: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Create an assistant entry
    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            ts: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Combined text content
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("")
    }

    /// Tool uses issued in this entry as `(id, name, input)`
    pub fn tool_uses(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        self.content
            .iter()
            .filter_map(|c| match c {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }
}

/// Tool definition for function calling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name (used in API calls)
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// JSON Schema for parameters
    pub parameters: serde_json::Value,
}

impl ToolSpec {
    /// Create a new tool definition
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_prefers_reported_cost() {
        let model = ModelInfo {
            cost: CostInfo {
                input: 3.0,
                output: 15.0,
                ..Default::default()
            },
            ..Default::default()
        };
        let computed = Usage {
            input_tokens: 1_000_000,
            output_tokens: 100_000,
            ..Default::default()
        };
        assert!((computed.cost(&model) - 4.5).abs() < 1e-9);

        let reported = Usage {
            total_cost: Some(0.25),
            ..computed
        };
        assert_eq!(reported.cost(&model), 0.25);
    }

    #[test]
    fn test_tool_result_serializes_without_false_error_flag() {
        let block = ContentBlock::tool_result("call_1", "ok", false);
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "tool_result");
        assert!(json.get("is_error").is_none());

        let err = ContentBlock::tool_result("call_1", "bad", true);
        assert_eq!(serde_json::to_value(&err).unwrap()["is_error"], true);
    }

    #[test]
    fn test_entry_tool_uses() {
        let entry = ConversationEntry::assistant(vec![
            ContentBlock::text("running"),
            ContentBlock::ToolUse {
                id: "t1".into(),
                name: "bash".into(),
                input: serde_json::json!({"cmd": "ls"}),
            },
        ]);
        let uses = entry.tool_uses();
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].0, "t1");
        assert_eq!(uses[0].2["cmd"], "ls");
        assert_eq!(entry.text(), "running");
    }
}
