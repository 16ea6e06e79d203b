//! Streaming chunk types and the provider seam

use crate::error::Result;
use crate::types::{ConversationEntry, ModelInfo, ToolSpec, Usage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::Stream;

/// Fragment of a native tool call.
///
/// Providers send the id and name on the first fragment and argument text on
/// later ones; any field may be absent on a given fragment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Raw JSON text to append to the call's arguments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// One unit of a provider response stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApiStreamChunk {
    /// Assistant text
    Text { text: String },
    /// Plain reasoning text (OpenAI-compatible providers)
    Reasoning { reasoning: String },
    /// Structured reasoning details that must be echoed back verbatim
    ReasoningDetails { details: serde_json::Value },
    /// Anthropic-style thinking delta
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    /// Thinking the provider withheld; only the opaque payload is kept
    RedactedThinking { data: String },
    /// Native tool call fragment
    ToolCalls { tool_call: ToolCallDelta },
    /// Token accounting, usually sent once near the end of the stream
    Usage {
        input_tokens: u64,
        output_tokens: u64,
        #[serde(default)]
        cache_write_tokens: Option<u64>,
        #[serde(default)]
        cache_read_tokens: Option<u64>,
        #[serde(default)]
        total_cost: Option<f64>,
    },
}

impl ApiStreamChunk {
    /// Create a text chunk
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Create a tool call fragment
    pub fn tool_call(id: Option<&str>, name: Option<&str>, arguments: Option<&str>) -> Self {
        Self::ToolCalls {
            tool_call: ToolCallDelta {
                id: id.map(str::to_string),
                name: name.map(str::to_string),
                arguments: arguments.map(str::to_string),
            },
        }
    }

    /// Create a usage chunk with only input/output counts
    pub fn usage(input_tokens: u64, output_tokens: u64) -> Self {
        Self::Usage {
            input_tokens,
            output_tokens,
            cache_write_tokens: None,
            cache_read_tokens: None,
            total_cost: None,
        }
    }

    /// Whether this chunk carries reasoning rather than answer content
    pub fn is_reasoning(&self) -> bool {
        matches!(
            self,
            Self::Reasoning { .. }
                | Self::ReasoningDetails { .. }
                | Self::Thinking { .. }
                | Self::RedactedThinking { .. }
        )
    }

    /// Fold a usage chunk into a running total. Token counts add up; cost is replaced.
    pub fn accumulate_usage(&self, usage: &mut Usage) -> bool {
        match self {
            Self::Usage {
                input_tokens,
                output_tokens,
                cache_write_tokens,
                cache_read_tokens,
                total_cost,
            } => {
                usage.input_tokens += input_tokens;
                usage.output_tokens += output_tokens;
                usage.cache_write_tokens += cache_write_tokens.unwrap_or(0);
                usage.cache_read_tokens += cache_read_tokens.unwrap_or(0);
                if total_cost.is_some() {
                    usage.total_cost = *total_cost;
                }
                true
            }
            _ => false,
        }
    }
}

/// A stream of provider chunks
pub type ApiStream = Pin<Box<dyn Stream<Item = Result<ApiStreamChunk>> + Send>>;

/// The LLM client seam.
///
/// Request building, authentication and model selection live behind this
/// trait; the execution core only consumes the chunk stream it returns.
#[async_trait]
pub trait ApiHandler: Send + Sync {
    /// Model currently in use
    fn model(&self) -> ModelInfo;

    /// Start a streamed completion over the given conversation
    async fn create_message(
        &self,
        system_prompt: &str,
        messages: &[ConversationEntry],
        tools: &[ToolSpec],
    ) -> Result<ApiStream>;

    /// Gracefully stop the in-flight request. Skipped for abandoned tasks.
    async fn abort(&self) {}
}
