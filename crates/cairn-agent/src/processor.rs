//! Streaming chunk processor
//!
//! Rebuilds the assistant message from provider chunks one at a time. Text
//! is re-parsed into blocks after every chunk (only the tail after the last
//! closed tool, and only up to a byte cap); native tool-call fragments are
//! merged by call id. After each chunk the current blocks are handed to a
//! [`Presenter`], which may execute a tool that has just become final.

use async_trait::async_trait;
use cairn_api::{ApiHandler, ApiStream, ApiStreamChunk, ContentBlock, ToolCallDelta, Usage};
use futures::StreamExt;
use serde_json::{Map, Value};

use crate::config::DEFAULT_MAX_REPARSE_BYTES;
use crate::error::Result;
use crate::parser::{ToolGrammar, parse_assistant_message, parse_partial_json};
use crate::state::{AssistantMessageContent, TaskState, ToolUse};

pub const INTERRUPTED_BY_FEEDBACK: &str = "[Response interrupted by user feedback]";
pub const INTERRUPTED_BY_TOOL_USE: &str = "[Response interrupted by a tool use result. Only one tool may be used at a time and should be placed at the end of the message.]";
pub const INTERRUPTED_BY_USER: &str = "[Response interrupted by user]";
pub const INTERRUPTED_BY_API_ERROR: &str = "[Response interrupted by API Error]";

/// Receives the message as it is rebuilt
#[async_trait]
pub trait Presenter: Send {
    /// Show (and, for final tool blocks, act on) `state.assistant_message_content`
    async fn present(&mut self, state: &mut TaskState) -> Result<()>;

    /// Show the reasoning buffer; `partial == false` closes it
    async fn reasoning(&mut self, text: &str, partial: bool) -> Result<()>;
}

/// What a chunk changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkEffect {
    Content,
    Reasoning,
    Usage,
    Ignored,
}

/// Decision taken after each chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamControl {
    Continue,
    /// The task was aborted
    Abort,
    /// Stop reading and record the given marker
    Interrupt(&'static str),
}

/// Why streaming ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStop {
    Completed,
    Interrupted,
    Aborted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamOutcome {
    pub received_usage: bool,
    pub usage: Usage,
    pub stop: StreamStop,
}

#[derive(Debug, Default)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
    params: Map<String, Value>,
    /// Arguments outgrew the speculative-parse bound; `params` is stale
    capped: bool,
}

impl PendingCall {
    /// Parse the full argument string once if speculative parsing stopped
    fn settle(&mut self) {
        if std::mem::take(&mut self.capped) {
            if let Some(params) = parse_partial_json(&self.arguments) {
                self.params = params;
            }
        }
    }
}

/// Native tool calls keyed by call id, in first-seen order
#[derive(Debug)]
pub struct ToolCallAccumulator {
    calls: Vec<PendingCall>,
    max_parse_bytes: usize,
}

impl Default for ToolCallAccumulator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REPARSE_BYTES)
    }
}

impl ToolCallAccumulator {
    /// Arguments longer than `max_parse_bytes` are only parsed once the call
    /// is complete
    pub fn new(max_parse_bytes: usize) -> Self {
        Self {
            calls: Vec::new(),
            max_parse_bytes,
        }
    }

    /// Merge a fragment. A fragment without an id continues the most recent
    /// call; one that cannot be attached anywhere is dropped.
    pub fn push(&mut self, delta: &ToolCallDelta) -> bool {
        let index = match delta.id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => match self.calls.iter().position(|c| c.id == id) {
                Some(i) => i,
                None => {
                    // A new call closes the previous one.
                    if let Some(previous) = self.calls.last_mut() {
                        previous.settle();
                    }
                    self.calls.push(PendingCall {
                        id: id.to_string(),
                        ..Default::default()
                    });
                    self.calls.len() - 1
                }
            },
            None if self.calls.is_empty() => {
                tracing::debug!("dropping tool call fragment with no id and no open call");
                return false;
            }
            None => self.calls.len() - 1,
        };

        let call = &mut self.calls[index];
        if let Some(name) = delta.name.as_deref().filter(|n| !n.is_empty()) {
            call.name = name.to_string();
        }
        if let Some(arguments) = &delta.arguments {
            call.arguments.push_str(arguments);
            if call.arguments.len() > self.max_parse_bytes {
                if !call.capped {
                    tracing::warn!(
                        call_id = %call.id,
                        bytes = call.arguments.len(),
                        limit = self.max_parse_bytes,
                        "tool call arguments too long, deferring parse to end of call"
                    );
                }
                call.capped = true;
            } else if let Some(params) = parse_partial_json(&call.arguments) {
                call.params = params;
            }
        }
        true
    }

    /// Parse every call whose speculative parsing was cut short
    pub fn finish(&mut self) {
        for call in &mut self.calls {
            call.settle();
        }
    }

    /// Tool-use blocks for named calls. Every call but the last is final;
    /// the last stays partial until `finished`.
    pub fn blocks(&self, finished: bool) -> Vec<AssistantMessageContent> {
        let last = self.calls.len().saturating_sub(1);
        self.calls
            .iter()
            .enumerate()
            .filter(|(_, call)| !call.name.is_empty())
            .map(|(i, call)| {
                AssistantMessageContent::ToolUse(ToolUse {
                    name: call.name.clone(),
                    params: call.params.clone(),
                    partial: !finished && i == last,
                    call_id: Some(call.id.clone()),
                })
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// Per-turn stream state
pub struct StreamProcessor {
    grammar: ToolGrammar,
    max_reparse_bytes: usize,
    /// Assistant text exactly as streamed, including any tool markup
    text: String,
    reasoning: String,
    reasoning_open: bool,
    thinking_signature: Option<String>,
    /// Blocks before the last closed tool; never re-parsed
    frozen: Vec<AssistantMessageContent>,
    frozen_len: usize,
    tail: Vec<AssistantMessageContent>,
    reparse_capped: bool,
    tool_calls: ToolCallAccumulator,
    usage: Usage,
    received_usage: bool,
    interruption: Option<&'static str>,
    finished: bool,
}

impl StreamProcessor {
    pub fn new(grammar: ToolGrammar, max_reparse_bytes: usize) -> Self {
        Self {
            grammar,
            max_reparse_bytes,
            text: String::new(),
            reasoning: String::new(),
            reasoning_open: false,
            thinking_signature: None,
            frozen: Vec::new(),
            frozen_len: 0,
            tail: Vec::new(),
            reparse_capped: false,
            tool_calls: ToolCallAccumulator::new(max_reparse_bytes),
            usage: Usage::default(),
            received_usage: false,
            interruption: None,
            finished: false,
        }
    }

    /// Apply one chunk to the buffers
    pub fn handle_chunk(&mut self, chunk: ApiStreamChunk) -> ChunkEffect {
        if chunk.accumulate_usage(&mut self.usage) {
            self.received_usage = true;
            return ChunkEffect::Usage;
        }
        match chunk {
            ApiStreamChunk::Text { text } => {
                self.text.push_str(&text);
                self.reparse();
                ChunkEffect::Content
            }
            ApiStreamChunk::ToolCalls { tool_call } => {
                if self.tool_calls.push(&tool_call) {
                    ChunkEffect::Content
                } else {
                    ChunkEffect::Ignored
                }
            }
            ApiStreamChunk::Reasoning { reasoning } => self.push_reasoning(&reasoning),
            ApiStreamChunk::Thinking {
                thinking,
                signature,
            } => {
                if signature.is_some() {
                    self.thinking_signature = signature;
                }
                self.push_reasoning(&thinking)
            }
            ApiStreamChunk::ReasoningDetails { details } => {
                self.push_reasoning(&reasoning_details_text(&details))
            }
            ApiStreamChunk::RedactedThinking { .. } | ApiStreamChunk::Usage { .. } => {
                ChunkEffect::Ignored
            }
        }
    }

    fn push_reasoning(&mut self, text: &str) -> ChunkEffect {
        if text.is_empty() {
            return ChunkEffect::Ignored;
        }
        self.reasoning.push_str(text);
        self.reasoning_open = true;
        ChunkEffect::Reasoning
    }

    fn reparse(&mut self) {
        let tail = &self.text[self.frozen_len..];
        if tail.len() > self.max_reparse_bytes {
            if !self.reparse_capped {
                tracing::warn!(
                    bytes = tail.len(),
                    limit = self.max_reparse_bytes,
                    "assistant message tail too long, deferring parse to end of stream"
                );
                self.reparse_capped = true;
            }
            return;
        }
        let mut parsed = parse_assistant_message(tail, &self.grammar, false);
        if parsed.stable_blocks > 0 {
            let rest = parsed.blocks.split_off(parsed.stable_blocks);
            self.frozen.extend(parsed.blocks);
            self.frozen_len += parsed.stable_len;
            self.tail = rest;
        } else {
            self.tail = parsed.blocks;
        }
    }

    /// Current content blocks: parsed text and markup, then native calls.
    ///
    /// Text stops growing once a native call has started, so it is final
    /// from that point on.
    pub fn blocks(&self) -> Vec<AssistantMessageContent> {
        let mut blocks: Vec<_> = self.frozen.iter().chain(self.tail.iter()).cloned().collect();
        if !self.tool_calls.is_empty() {
            for block in &mut blocks {
                if let AssistantMessageContent::Text { partial, .. } = block {
                    *partial = false;
                }
            }
        }
        blocks.extend(self.tool_calls.blocks(self.finished));
        if self.finished {
            for block in &mut blocks {
                block.set_partial(false);
            }
        }
        blocks
    }

    /// Decide whether to keep reading after a chunk
    pub fn post_chunk_check(&self, state: &TaskState) -> StreamControl {
        if state.handle.is_aborted() {
            StreamControl::Abort
        } else if state.did_reject_tool {
            StreamControl::Interrupt(INTERRUPTED_BY_FEEDBACK)
        } else if state.did_already_use_tool {
            StreamControl::Interrupt(INTERRUPTED_BY_TOOL_USE)
        } else {
            StreamControl::Continue
        }
    }

    /// Record why the response stopped early
    pub fn interrupt(&mut self, marker: &'static str) {
        self.interruption = Some(marker);
    }

    /// Close the stream: parse the whole tail once more and mark every block final
    pub fn finalize(&mut self) {
        if self.finished {
            return;
        }
        let tail = &self.text[self.frozen_len..];
        self.tail = parse_assistant_message(tail, &self.grammar, true).blocks;
        self.reparse_capped = false;
        self.tool_calls.finish();
        self.finished = true;
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    pub fn received_usage(&self) -> bool {
        self.received_usage
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    /// Whether the turn produced anything worth recording
    pub fn has_content(&self) -> bool {
        !self.text.trim().is_empty() || !self.tool_calls.is_empty()
    }

    /// Content of the assistant conversation entry for this turn.
    ///
    /// Native tool calls are included only when a result for them is queued,
    /// so every recorded tool use is answered in the next user turn.
    pub fn assistant_entry_content(&self, state: &TaskState) -> Vec<ContentBlock> {
        let mut content = Vec::new();
        if !self.reasoning.is_empty() {
            content.push(ContentBlock::Thinking {
                thinking: self.reasoning.clone(),
                signature: self.thinking_signature.clone(),
            });
        }

        let mut text = self.text.clone();
        if let Some(marker) = self.interruption {
            if !text.is_empty() {
                text.push_str("\n\n");
            }
            text.push_str(marker);
        }
        if !text.trim().is_empty() {
            content.push(ContentBlock::text(text));
        }

        for call in &self.tool_calls.calls {
            if !call.name.is_empty() && state.has_result_for(&call.id) {
                content.push(ContentBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: Value::Object(call.params.clone()),
                });
            }
        }
        content
    }

    fn sync_tool_ids(&self, state: &mut TaskState) {
        for call in &self.tool_calls.calls {
            if !call.name.is_empty() {
                state.tool_use_ids.insert(call.name.clone(), call.id.clone());
            }
        }
    }

    fn publish(&self, state: &mut TaskState) {
        self.sync_tool_ids(state);
        state.assistant_message_content = self.blocks();
    }

    /// Drive `stream` to completion, presenting content as it arrives.
    ///
    /// Malformed chunks are skipped. Any other stream error finalizes the
    /// blocks and is returned to the caller. On abort the provider is asked
    /// to stop unless the task was abandoned.
    pub async fn process_stream(
        &mut self,
        mut stream: ApiStream,
        state: &mut TaskState,
        presenter: &mut dyn Presenter,
        api: &dyn ApiHandler,
    ) -> Result<StreamOutcome> {
        let cancel = state.handle.cancel_token();
        state.is_streaming = true;
        state.did_complete_reading_stream = false;

        let result: Result<StreamStop> = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(StreamStop::Aborted),
                next = stream.next() => next,
            };
            let chunk = match next {
                None => break Ok(StreamStop::Completed),
                Some(Ok(chunk)) => chunk,
                Some(Err(e @ (cairn_api::Error::Json(_) | cairn_api::Error::UnexpectedResponse(_)))) => {
                    tracing::warn!(error = %e, "skipping malformed stream chunk");
                    continue;
                }
                Some(Err(e)) => break Err(e.into()),
            };

            let step = match self.handle_chunk(chunk) {
                ChunkEffect::Reasoning => presenter.reasoning(&self.reasoning, true).await,
                ChunkEffect::Content => {
                    let closed = if std::mem::take(&mut self.reasoning_open) {
                        presenter.reasoning(&self.reasoning, false).await
                    } else {
                        Ok(())
                    };
                    self.publish(state);
                    match closed {
                        Ok(()) => presenter.present(state).await,
                        Err(e) => Err(e),
                    }
                }
                ChunkEffect::Usage | ChunkEffect::Ignored => Ok(()),
            };
            if let Err(e) = step {
                break Err(e);
            }

            match self.post_chunk_check(state) {
                StreamControl::Continue => {}
                StreamControl::Abort => break Ok(StreamStop::Aborted),
                StreamControl::Interrupt(marker) => {
                    tracing::debug!(marker, "stopping stream early");
                    self.interrupt(marker);
                    break Ok(StreamStop::Interrupted);
                }
            }
        };
        drop(stream);

        state.is_streaming = false;
        state.did_complete_reading_stream = true;
        self.finalize();
        self.publish(state);

        let stop = match result {
            Ok(stop) => stop,
            Err(e) if e.is_aborted() => StreamStop::Aborted,
            Err(e) => return Err(e),
        };

        let stop = if stop == StreamStop::Aborted {
            if !state.handle.is_abandoned() {
                self.interrupt(INTERRUPTED_BY_USER);
                api.abort().await;
            }
            stop
        } else {
            if self.reasoning_open {
                self.reasoning_open = false;
                presenter.reasoning(&self.reasoning, false).await?;
            }
            match presenter.present(state).await {
                Ok(()) => stop,
                Err(e) if e.is_aborted() => StreamStop::Aborted,
                Err(e) => return Err(e),
            }
        };

        Ok(StreamOutcome {
            received_usage: self.received_usage,
            usage: self.usage,
            stop,
        })
    }
}

/// Readable text from a provider's structured reasoning payload
fn reasoning_details_text(details: &Value) -> String {
    match details {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(reasoning_details_text).collect(),
        Value::Object(obj) => ["text", "summary"]
            .iter()
            .find_map(|key| obj.get(*key).and_then(Value::as_str))
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}
