//! The presentation seam: what a task needs from the editor or terminal
//! hosting it, and the `Ui` wrapper that turns say/ask calls into persisted
//! UI messages.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::handle::TaskHandle;
use crate::history::HistoryItem;
use crate::message::{AskKind, AskResponse, SayKind, UiKind, UiMessage};
use crate::persistence::MessageStore;
use crate::tool::PartialUi;

/// Callbacks implemented by the host UI
#[async_trait]
pub trait Host: Send + Sync {
    /// A message was appended or changed in place (including partial updates)
    fn message_changed(&self, _message: &UiMessage) {}

    /// Present a question and wait for the user's answer
    async fn ask(&self, message: &UiMessage) -> AskResponse;

    /// Snapshot the workspace before a side effect
    async fn save_checkpoint(&self) {}

    /// Full message list after a structural change
    async fn post_state(&self, _messages: &[UiMessage]) {}

    /// The global task history changed
    fn history_updated(&self, _items: &[HistoryItem]) {}
}

/// Say/ask front end over a task's message store
pub struct Ui {
    store: MessageStore,
    host: Arc<dyn Host>,
    handle: TaskHandle,
    ask_timeout: Option<Duration>,
    last_ts: i64,
}

impl Ui {
    pub fn new(
        store: MessageStore,
        host: Arc<dyn Host>,
        handle: TaskHandle,
        ask_timeout: Option<Duration>,
    ) -> Self {
        let last_ts = store.ui_messages().iter().map(|m| m.ts).max().unwrap_or(0);
        Self {
            store,
            host,
            handle,
            ask_timeout,
            last_ts,
        }
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut MessageStore {
        &mut self.store
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    pub fn handle(&self) -> &TaskHandle {
        &self.handle
    }

    /// Millisecond timestamps, strictly increasing within a task
    fn next_ts(&mut self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        let ts = now.max(self.last_ts + 1);
        self.last_ts = ts;
        ts
    }

    pub async fn say(&mut self, kind: SayKind, text: Option<String>, partial: bool) -> i64 {
        self.say_with(kind, text, Vec::new(), Vec::new(), partial).await
    }

    /// Emit an informational message.
    ///
    /// While the last message is a partial of the same kind, it is updated in
    /// place rather than appended; the update that clears `partial` saves it.
    pub async fn say_with(
        &mut self,
        kind: SayKind,
        text: Option<String>,
        images: Vec<String>,
        files: Vec<String>,
        partial: bool,
    ) -> i64 {
        self.emit(UiKind::Say { say: kind }, text, images, files, partial)
            .await
    }

    /// Show a question that is still streaming in. Never waits.
    pub async fn ask_partial(&mut self, kind: AskKind, text: Option<String>) -> i64 {
        self.emit(UiKind::Ask { ask: kind }, text, Vec::new(), Vec::new(), true)
            .await
    }

    /// Ask the user and wait for the answer.
    ///
    /// Fails with [`Error::Aborted`] if the task is cancelled first, or
    /// [`Error::TimedOut`] if an ask timeout is configured and expires.
    pub async fn ask(&mut self, kind: AskKind, text: Option<String>) -> Result<AskResponse> {
        if self.handle.is_aborted() {
            return Err(Error::Aborted);
        }
        let ts = self
            .emit(UiKind::Ask { ask: kind }, text, Vec::new(), Vec::new(), false)
            .await;
        let Some(message) = self.store.ui_message(ts).cloned() else {
            return Err(Error::Other(format!("ask message {ts} vanished")));
        };

        let cancel = self.handle.cancel_token();
        let timeout = self.ask_timeout;
        let host = Arc::clone(&self.host);
        let expired = async move {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Aborted),
            _ = expired => Err(Error::TimedOut(format!("a response to the {kind:?} question"))),
            response = host.ask(&message) => {
                tracing::debug!(?kind, response = ?response.response, "ask answered");
                Ok(response)
            }
        }
    }

    /// Drop a trailing partial message left by a block that will not be
    /// finalized
    pub async fn discard_partial(&mut self) {
        if self.store.pop_partial_ui_message().is_some() {
            self.host.post_state(self.store.ui_messages()).await;
        }
    }

    /// Mark a trailing partial message complete, as it stands
    pub async fn close_partial(&mut self) {
        let Some(ts) = self.store.last_ui_message().filter(|m| m.partial).map(|m| m.ts) else {
            return;
        };
        self.store.update_ui_message(ts, |m| m.partial = false);
        if let Some(items) = self.store.save_ui_messages() {
            self.host.history_updated(&items);
        }
        if let Some(message) = self.store.ui_message(ts) {
            self.host.message_changed(message);
        }
    }

    /// Replace the text of an existing message and save
    pub async fn update_text(&mut self, ts: i64, text: String) {
        let found = self.store.update_ui_message(ts, |m| m.text = Some(text));
        if !found {
            tracing::debug!(ts, "update for unknown message");
            return;
        }
        if let Some(items) = self.store.save_ui_messages() {
            self.host.history_updated(&items);
        }
        if let Some(message) = self.store.ui_message(ts) {
            self.host.message_changed(message);
        }
    }

    async fn emit(
        &mut self,
        kind: UiKind,
        text: Option<String>,
        images: Vec<String>,
        files: Vec<String>,
        partial: bool,
    ) -> i64 {
        let continuing = self
            .store
            .last_ui_message()
            .filter(|m| m.partial && m.kind == kind)
            .map(|m| m.ts);

        let ts = match continuing {
            Some(ts) => {
                self.store.update_ui_message(ts, |m| {
                    m.text = text;
                    m.images = images;
                    m.files = files;
                    m.partial = partial;
                });
                if !partial {
                    if let Some(items) = self.store.save_ui_messages() {
                        self.host.history_updated(&items);
                    }
                }
                ts
            }
            None => {
                let ts = self.next_ts();
                let mut message = UiMessage::say(ts, SayKind::Text, text, partial);
                message.kind = kind;
                message.images = images;
                message.files = files;
                if let Some(items) = self.store.add_to_ui_messages(message) {
                    self.host.history_updated(&items);
                }
                self.host.post_state(self.store.ui_messages()).await;
                ts
            }
        };
        if let Some(message) = self.store.ui_message(ts) {
            self.host.message_changed(message);
        }
        ts
    }
}

/// Streams a partial tool block into the UI as either an ask (when the
/// final block will need approval) or a say.
pub struct PartialView<'a> {
    ui: &'a mut Ui,
    kind: UiKind,
}

impl<'a> PartialView<'a> {
    pub fn ask(ui: &'a mut Ui, ask: AskKind) -> Self {
        Self {
            ui,
            kind: UiKind::Ask { ask },
        }
    }

    pub fn say(ui: &'a mut Ui, say: SayKind) -> Self {
        Self {
            ui,
            kind: UiKind::Say { say },
        }
    }
}

#[async_trait]
impl PartialUi for PartialView<'_> {
    async fn show_partial(&mut self, text: String) -> Result<()> {
        if self.ui.handle.is_aborted() {
            return Err(Error::Aborted);
        }
        match self.kind {
            UiKind::Ask { ask } => self.ui.ask_partial(ask, Some(text)).await,
            UiKind::Say { say } => self.ui.say(say, Some(text), true).await,
        };
        Ok(())
    }
}
