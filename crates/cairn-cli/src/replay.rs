//! Replay provider: serves recorded chunk streams from a JSON file so the
//! whole pipeline can run without a network client.
//!
//! ```json
//! {
//!   "model": { "id": "recorded", "provider": "replay" },
//!   "delayMs": 20,
//!   "turns": [
//!     [ { "type": "text", "text": "<read><path>Cargo.toml</path></read>" },
//!       { "type": "usage", "input_tokens": 120, "output_tokens": 14 } ],
//!     [ { "type": "text", "text": "Done." }, { "error": "connection reset" } ]
//!   ]
//! }
//! ```
//!
//! A bare array of turns is accepted as well.

use async_trait::async_trait;
use cairn_api::{ApiHandler, ApiStream, ApiStreamChunk, ConversationEntry, ModelInfo, ToolSpec};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

/// One recorded stream item: a chunk, or a failure that ends the stream
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ReplayItem {
    Chunk(ApiStreamChunk),
    Failure { error: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayScript {
    #[serde(default)]
    pub model: Option<ModelInfo>,
    /// Pause between chunks, to make streaming visible
    #[serde(default)]
    pub delay_ms: u64,
    pub turns: Vec<Vec<ReplayItem>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ScriptFile {
    Full(ReplayScript),
    Turns(Vec<Vec<ReplayItem>>),
}

impl ReplayScript {
    pub fn parse(json: &str) -> serde_json::Result<Self> {
        Ok(match serde_json::from_str(json)? {
            ScriptFile::Full(script) => script,
            ScriptFile::Turns(turns) => ReplayScript {
                turns,
                ..Default::default()
            },
        })
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(Self::parse(&json)?)
    }
}

/// An `ApiHandler` that answers each request with the next recorded turn
pub struct ReplayApi {
    model: ModelInfo,
    delay: Duration,
    turns: Mutex<VecDeque<Vec<ReplayItem>>>,
    requests: Mutex<usize>,
}

impl ReplayApi {
    pub fn new(script: ReplayScript) -> Self {
        let model = script.model.unwrap_or_else(|| ModelInfo {
            id: "replay".to_string(),
            provider: "replay".to_string(),
            ..Default::default()
        });
        Self {
            model,
            delay: Duration::from_millis(script.delay_ms),
            turns: Mutex::new(script.turns.into()),
            requests: Mutex::new(0),
        }
    }

    /// Requests served so far
    pub fn requests(&self) -> usize {
        *self.requests.lock()
    }

    pub fn remaining(&self) -> usize {
        self.turns.lock().len()
    }
}

#[async_trait]
impl ApiHandler for ReplayApi {
    fn model(&self) -> ModelInfo {
        self.model.clone()
    }

    async fn create_message(
        &self,
        _system_prompt: &str,
        messages: &[ConversationEntry],
        _tools: &[ToolSpec],
    ) -> cairn_api::Result<ApiStream> {
        let turn = self.turns.lock().pop_front();
        let Some(turn) = turn else {
            return Err(cairn_api::Error::UnexpectedResponse(
                "replay script has no more turns".to_string(),
            ));
        };
        let request = {
            let mut requests = self.requests.lock();
            *requests += 1;
            *requests
        };
        tracing::debug!(request, history = messages.len(), chunks = turn.len(), "replaying turn");

        let delay = self.delay;
        Ok(Box::pin(async_stream::stream! {
            for item in turn {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                match item {
                    ReplayItem::Chunk(chunk) => yield Ok(chunk),
                    ReplayItem::Failure { error } => {
                        yield Err(cairn_api::Error::Stream(error));
                        break;
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn test_parse_full_and_bare_scripts() {
        let full = ReplayScript::parse(
            r#"{"model": {"id": "m", "provider": "p"}, "delayMs": 5,
                "turns": [[{"type": "text", "text": "hi"}, {"error": "boom"}]]}"#,
        )
        .unwrap();
        assert_eq!(full.model.unwrap().id, "m");
        assert_eq!(full.delay_ms, 5);
        assert!(matches!(full.turns[0][1], ReplayItem::Failure { .. }));

        let bare = ReplayScript::parse(r#"[[{"type": "usage", "input_tokens": 1, "output_tokens": 2}]]"#)
            .unwrap();
        assert!(bare.model.is_none());
        assert!(matches!(bare.turns[0][0], ReplayItem::Chunk(ApiStreamChunk::Usage { .. })));
    }

    #[tokio::test]
    async fn test_turns_are_served_in_order_then_exhausted() {
        let api = ReplayApi::new(
            ReplayScript::parse(
                r#"[[{"type": "text", "text": "a"}], [{"type": "text", "text": "b"}, {"error": "cut"}, {"type": "text", "text": "never"}]]"#,
            )
            .unwrap(),
        );

        let first: Vec<_> = api.create_message("", &[], &[]).await.unwrap().collect().await;
        assert_eq!(first.len(), 1);
        assert_eq!(*first[0].as_ref().unwrap(), ApiStreamChunk::text("a"));

        let second: Vec<_> = api.create_message("", &[], &[]).await.unwrap().collect().await;
        assert_eq!(second.len(), 2);
        assert!(matches!(second[1], Err(cairn_api::Error::Stream(_))));

        assert!(api.create_message("", &[], &[]).await.is_err());
        assert_eq!(api.requests(), 2);
        assert_eq!(api.remaining(), 0);
    }
}
