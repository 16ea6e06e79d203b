//! Per-task message persistence
//!
//! A task directory holds the model-facing conversation, the UI message list
//! and a small metadata file. Every mutation is written through immediately;
//! a failed write is logged and remembered but never stops the task.

use cairn_api::{ConversationEntry, ModelInfo};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::history::{HistoryItem, TaskHistoryStore, UI_MESSAGES_FILE};
use crate::message::UiMessage;
use crate::storage;
use crate::tool::{FileAccess, FileTouch};

pub const API_HISTORY_FILE: &str = "api_conversation_history.json";
pub const METADATA_FILE: &str = "task_metadata.json";

/// Model used for a turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelUsage {
    pub ts: i64,
    pub model_id: String,
    pub model_provider_id: String,
}

/// A file that entered the task's context through a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileContextEntry {
    pub path: String,
    pub record_source: FileAccess,
    pub ts: i64,
}

/// Contents of `task_metadata.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetadata {
    #[serde(default)]
    pub model_usage: Vec<ModelUsage>,
    #[serde(default)]
    pub files_in_context: Vec<FileContextEntry>,
}

/// Conversation and UI message lists for one task, backed by its directory
pub struct MessageStore {
    task_id: String,
    dir: PathBuf,
    history: Arc<TaskHistoryStore>,
    workspace_paths: Vec<String>,
    api_history: Vec<ConversationEntry>,
    ui_messages: Vec<UiMessage>,
    deleted_range: Option<(usize, usize)>,
    metadata: TaskMetadata,
    last_save_error: Option<String>,
}

impl MessageStore {
    /// Empty store for a new task under `history.tasks_dir()/<task_id>`
    pub fn new(task_id: impl Into<String>, history: Arc<TaskHistoryStore>) -> Self {
        let task_id = task_id.into();
        Self {
            dir: history.tasks_dir().join(&task_id),
            task_id,
            history,
            workspace_paths: Vec::new(),
            api_history: Vec::new(),
            ui_messages: Vec::new(),
            deleted_range: None,
            metadata: TaskMetadata::default(),
            last_save_error: None,
        }
    }

    /// Load an existing task, falling back to `.bak` copies of unreadable files
    pub fn load(task_id: impl Into<String>, history: Arc<TaskHistoryStore>) -> Result<Self> {
        let mut store = Self::new(task_id, history);
        if !store.dir.is_dir() {
            return Err(Error::Other(format!(
                "no saved task at {}",
                store.dir.display()
            )));
        }
        store.api_history = load_with_backup(&store.dir.join(API_HISTORY_FILE))?.unwrap_or_default();
        store.ui_messages = load_with_backup(&store.dir.join(UI_MESSAGES_FILE))?.unwrap_or_default();
        store.metadata = load_with_backup(&store.dir.join(METADATA_FILE))?.unwrap_or_default();
        store.deleted_range = store
            .ui_messages
            .iter()
            .rev()
            .find_map(|m| m.conversation_history_deleted_range);
        tracing::debug!(
            task_id = %store.task_id,
            api_entries = store.api_history.len(),
            ui_messages = store.ui_messages.len(),
            "loaded task"
        );
        Ok(store)
    }

    pub fn with_workspace_paths(mut self, paths: Vec<String>) -> Self {
        self.workspace_paths = paths;
        self
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn history(&self) -> &Arc<TaskHistoryStore> {
        &self.history
    }

    pub fn api_history(&self) -> &[ConversationEntry] {
        &self.api_history
    }

    pub fn ui_messages(&self) -> &[UiMessage] {
        &self.ui_messages
    }

    pub fn ui_message(&self, ts: i64) -> Option<&UiMessage> {
        self.ui_messages.iter().rev().find(|m| m.ts == ts)
    }

    pub fn last_ui_message(&self) -> Option<&UiMessage> {
        self.ui_messages.last()
    }

    pub fn deleted_range(&self) -> Option<(usize, usize)> {
        self.deleted_range
    }

    pub fn metadata(&self) -> &TaskMetadata {
        &self.metadata
    }

    /// Most recent write failure, cleared by the next successful save
    pub fn last_save_error(&self) -> Option<&str> {
        self.last_save_error.as_deref()
    }

    pub fn add_to_api_history(&mut self, entry: ConversationEntry) {
        self.api_history.push(entry);
        self.save_api_history();
    }

    /// Replace the conversation wholesale, recording the truncated window
    pub fn overwrite_api_history(
        &mut self,
        entries: Vec<ConversationEntry>,
        deleted_range: Option<(usize, usize)>,
    ) {
        self.api_history = entries;
        if deleted_range.is_some() {
            self.deleted_range = deleted_range;
        }
        self.save_api_history();
    }

    /// Widen the window of entries left out of requests after the provider
    /// reported a context overflow. The first entry (the task) and the latest
    /// one always stay, and an even count is dropped so turns keep
    /// alternating. Returns the inclusive window, or `None` when nothing more
    /// can go.
    pub fn truncate_context(&mut self) -> Option<(usize, usize)> {
        let dropped = self.deleted_range.map_or(0, |(start, end)| end + 1 - start);
        let visible_middle = self.api_history.len().saturating_sub(2 + dropped);
        let remove = (visible_middle / 2) & !1;
        if remove == 0 {
            return None;
        }
        let range = (1, dropped + remove);
        tracing::warn!(task_id = %self.task_id, ?range, "truncating conversation sent to the provider");
        self.deleted_range = Some(range);
        Some(range)
    }

    /// The conversation as sent to the provider, without the truncated window
    pub fn request_history(&self) -> Cow<'_, [ConversationEntry]> {
        match self.deleted_range {
            Some((start, end)) => Cow::Owned(
                self.api_history
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i < start || *i > end)
                    .map(|(_, entry)| entry.clone())
                    .collect(),
            ),
            None => Cow::Borrowed(&self.api_history),
        }
    }

    /// Append a UI message and save.
    ///
    /// The message gets `conversation_history_index = api_history.len() - 1`:
    /// the last entry already pushed, which during streaming is the user turn
    /// whose assistant reply is still being built.
    pub fn add_to_ui_messages(&mut self, mut message: UiMessage) -> Option<Vec<HistoryItem>> {
        message.conversation_history_index = Some(self.api_history.len() as i64 - 1);
        message.conversation_history_deleted_range = self.deleted_range;
        self.ui_messages.push(message);
        self.save_ui_messages()
    }

    /// Mutate a message in place without saving. Returns `false` if no
    /// message has this timestamp.
    pub fn update_ui_message(&mut self, ts: i64, update: impl FnOnce(&mut UiMessage)) -> bool {
        match self.ui_messages.iter_mut().rev().find(|m| m.ts == ts) {
            Some(message) => {
                update(message);
                true
            }
            None => false,
        }
    }

    /// Remove the last UI message if it is still partial
    pub fn pop_partial_ui_message(&mut self) -> Option<UiMessage> {
        if !self.ui_messages.last().is_some_and(|m| m.partial) {
            return None;
        }
        let removed = self.ui_messages.pop();
        self.save_ui_messages();
        removed
    }

    pub fn overwrite_ui_messages(&mut self, messages: Vec<UiMessage>) -> Option<Vec<HistoryItem>> {
        self.ui_messages = messages;
        self.save_ui_messages()
    }

    /// Note the model answering the current turn
    pub fn record_model_usage(&mut self, model: &ModelInfo) {
        let unchanged = self
            .metadata
            .model_usage
            .last()
            .is_some_and(|last| last.model_id == model.id && last.model_provider_id == model.provider);
        if unchanged {
            return;
        }
        self.metadata.model_usage.push(ModelUsage {
            ts: chrono::Utc::now().timestamp_millis(),
            model_id: model.id.clone(),
            model_provider_id: model.provider.clone(),
        });
        self.save_metadata();
    }

    pub fn record_file_touch(&mut self, touch: &FileTouch) {
        self.metadata.files_in_context.push(FileContextEntry {
            path: touch.path.clone(),
            record_source: touch.access,
            ts: chrono::Utc::now().timestamp_millis(),
        });
        self.save_metadata();
    }

    /// Rewind to the UI message with timestamp `ts`.
    ///
    /// UI messages after it are dropped, and the conversation keeps
    /// `conversation_history_index + 2` entries: the user turn the message
    /// points at plus the assistant reply paired with it.
    pub fn restore_to(&mut self, ts: i64) -> Result<()> {
        let Some(index) = self.ui_messages.iter().position(|m| m.ts == ts) else {
            return Err(Error::Other(format!("no message with timestamp {ts}")));
        };
        let history_index = self.ui_messages[index].conversation_history_index.unwrap_or(-1);
        let keep = usize::try_from(history_index + 2)
            .unwrap_or(0)
            .min(self.api_history.len());

        self.api_history.truncate(keep);
        self.ui_messages.truncate(index + 1);
        self.deleted_range = match self.deleted_range {
            Some(range) if range.1 + 1 < keep => Some(range),
            _ => None,
        };
        self.save_api_history();
        self.save_ui_messages();
        Ok(())
    }

    /// Write `ui_messages.json` and upsert the derived summary into the
    /// global history. Returns the updated history when that succeeded.
    pub fn save_ui_messages(&mut self) -> Option<Vec<HistoryItem>> {
        let path = self.dir.join(UI_MESSAGES_FILE);
        let result = save_with_backup(&path, &self.ui_messages);
        self.note_save("ui messages", result);

        let mut item = HistoryItem::from_messages(
            &self.task_id,
            &self.ui_messages,
            storage::dir_size(&self.dir),
        )?;
        item.workspace_paths = self.workspace_paths.clone();
        match self.history.upsert(item) {
            Ok(items) => Some(items),
            Err(e) => {
                tracing::error!(task_id = %self.task_id, error = %e, "failed to update task history");
                self.last_save_error = Some(e.to_string());
                None
            }
        }
    }

    fn save_api_history(&mut self) {
        let path = self.dir.join(API_HISTORY_FILE);
        let result = save_with_backup(&path, &self.api_history);
        self.note_save("conversation history", result);
    }

    fn save_metadata(&mut self) {
        let path = self.dir.join(METADATA_FILE);
        let result = save_with_backup(&path, &self.metadata);
        self.note_save("task metadata", result);
    }

    fn note_save(&mut self, what: &str, result: io::Result<()>) {
        match result {
            Ok(()) => self.last_save_error = None,
            Err(e) => {
                tracing::warn!(task_id = %self.task_id, error = %e, "failed to save {what}");
                self.last_save_error = Some(format!("failed to save {what}: {e}"));
            }
        }
    }
}

/// Keep the current file as `<file>.bak`, then write the new content atomically
fn save_with_backup<T: Serialize + ?Sized>(path: &Path, value: &T) -> io::Result<()> {
    match fs::copy(path, storage::bak_path(path)) {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::debug!(path = %path.display(), error = %e, "could not refresh .bak copy"),
    }
    storage::write_json_atomic(path, value)
}

fn load_with_backup<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match storage::read_json(path) {
        Ok(Some(value)) => return Ok(Some(value)),
        Ok(None) => {}
        Err(e) if e.kind() == io::ErrorKind::InvalidData => {
            tracing::warn!(path = %path.display(), error = %e, "unreadable task file, trying .bak copy");
        }
        Err(e) => return Err(e.into()),
    }
    let bak = storage::bak_path(path);
    match storage::read_json(&bak) {
        Ok(value) => Ok(value),
        Err(e) => Err(e.into()),
    }
}
