//! Process-wide index of task summaries (`taskHistory.json`)
//!
//! The index is small and rewritten wholesale on every change, so it is the
//! file most exposed to torn writes and accidental truncation. Writes are
//! validated, rotated into timestamped backups and applied atomically; reads
//! never turn corruption into an empty list.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::message::{SayKind, UiMessage};
use crate::storage;

/// File name of the global index
pub const HISTORY_FILE: &str = "taskHistory.json";
/// Number of timestamped backups retained
pub const MAX_BACKUPS: usize = 5;

const BACKUP_MARKER: &str = ".backup-";
const CORRUPT_MARKER: &str = ".corrupt-";
/// Per-task UI message file, read when rebuilding the index from task directories
pub const UI_MESSAGES_FILE: &str = "ui_messages.json";

/// Errors raised by the history store
#[derive(Error, Debug)]
pub enum HistoryError {
    /// Reading or writing a history file failed
    #[error("history I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// An item handed to `write` is structurally invalid
    #[error("invalid history item at index {index}: {reason}")]
    Invalid { index: usize, reason: String },

    /// The primary file is corrupt and neither backups nor task directories
    /// yielded a usable list
    #[error("task history at {path} is corrupt and could not be recovered: {reason}")]
    Unrecoverable { path: PathBuf, reason: String },
}

impl HistoryError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

type HistoryResult<T> = std::result::Result<T, HistoryError>;

/// Summary of a single task, independent of its detail files
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryItem {
    pub id: String,
    /// Last activity, milliseconds since the epoch
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    /// First line of the task prompt
    #[serde(default)]
    pub task: String,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub cache_writes: u64,
    #[serde(default)]
    pub cache_reads: u64,
    #[serde(default)]
    pub total_cost: f64,
    /// Bytes on disk used by the task directory
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workspace_paths: Vec<String>,
    #[serde(default)]
    pub is_favorited: bool,
}

impl HistoryItem {
    /// Derive a summary from a task's full UI message list.
    ///
    /// Returns `None` for an empty list: there is nothing to summarize yet.
    pub fn from_messages(id: &str, messages: &[UiMessage], size: u64) -> Option<Self> {
        let first = messages.first()?;
        let last = messages.last()?;

        let task = messages
            .iter()
            .find(|m| m.say_kind() == Some(SayKind::Task))
            .and_then(|m| m.text.clone())
            .unwrap_or_default();

        let mut item = HistoryItem {
            id: id.to_string(),
            ts: last.ts,
            created_at: Some(first.ts),
            task,
            size,
            ..Default::default()
        };
        for info in messages.iter().filter_map(UiMessage::api_req_info) {
            item.tokens_in += info.tokens_in;
            item.tokens_out += info.tokens_out;
            item.cache_writes += info.cache_writes;
            item.cache_reads += info.cache_reads;
            item.total_cost += info.cost.unwrap_or(0.0);
        }
        Some(item)
    }

    fn validate(&self, index: usize) -> HistoryResult<()> {
        if self.id.trim().is_empty() {
            return Err(HistoryError::Invalid {
                index,
                reason: "missing id".to_string(),
            });
        }
        if self.ts <= 0 {
            return Err(HistoryError::Invalid {
                index,
                reason: format!("timestamp must be positive, got {}", self.ts),
            });
        }
        Ok(())
    }
}

/// How a successful `write` related to what was on disk before
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Normal write
    Written,
    /// An empty list replaced a non-empty one. Allowed, but logged loudly.
    ClearedNonEmpty { previous_len: usize },
}

/// Global task index with backup rotation and corruption recovery
pub struct TaskHistoryStore {
    path: PathBuf,
    tasks_dir: PathBuf,
    /// Serializes read-modify-write cycles from tasks in this process
    write_lock: Mutex<()>,
}

impl TaskHistoryStore {
    /// Store rooted at `data_dir`: the index lives at `data_dir/taskHistory.json`
    /// and per-task directories under `data_dir/tasks`.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            path: data_dir.join(HISTORY_FILE),
            tasks_dir: data_dir.join("tasks"),
            write_lock: Mutex::new(()),
        }
    }

    /// Path of the primary index file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory holding per-task detail directories
    pub fn tasks_dir(&self) -> &Path {
        &self.tasks_dir
    }

    /// Read the index.
    ///
    /// A missing file is an empty history. A corrupt file triggers recovery
    /// from backups, then from task directories; if both fail this returns
    /// [`HistoryError::Unrecoverable`] rather than an empty list.
    pub fn read(&self) -> HistoryResult<Vec<HistoryItem>> {
        let content = match fs::read(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(HistoryError::io(&self.path, e)),
        };
        match serde_json::from_slice::<Vec<HistoryItem>>(&content) {
            Ok(items) => Ok(items),
            Err(e) => {
                tracing::error!(
                    path = %self.path.display(),
                    error = %e,
                    "task history is corrupt, attempting recovery"
                );
                self.recover(&e.to_string())
            }
        }
    }

    /// Replace the index with `items`.
    ///
    /// Order: validate every item, back up the current file, write atomically.
    pub fn write(&self, items: &[HistoryItem]) -> HistoryResult<WriteOutcome> {
        for (index, item) in items.iter().enumerate() {
            item.validate(index)?;
        }
        let _guard = self.write_lock.lock();
        self.write_locked(items)
    }

    /// Insert or replace the summary for `item.id`, keeping the favorite flag
    /// and creation time already recorded. Returns the updated index.
    pub fn upsert(&self, mut item: HistoryItem) -> HistoryResult<Vec<HistoryItem>> {
        item.validate(0)?;
        let _guard = self.write_lock.lock();
        let mut items = self.read()?;
        match items.iter_mut().find(|existing| existing.id == item.id) {
            Some(existing) => {
                item.is_favorited = existing.is_favorited;
                item.created_at = existing.created_at.or(item.created_at);
                if item.workspace_paths.is_empty() {
                    item.workspace_paths = std::mem::take(&mut existing.workspace_paths);
                }
                *existing = item;
            }
            None => items.push(item),
        }
        self.write_locked(&items)?;
        Ok(items)
    }

    /// Remove a task from the index. Returns the updated index.
    pub fn delete(&self, id: &str) -> HistoryResult<Vec<HistoryItem>> {
        let _guard = self.write_lock.lock();
        let mut items = self.read()?;
        items.retain(|item| item.id != id);
        self.write_locked(&items)?;
        Ok(items)
    }

    /// Re-derive summaries from the task directories and merge them into the
    /// index. Favorites and creation times already recorded are kept; items
    /// without a task directory are left alone.
    pub fn rebuild_from_tasks(&self) -> HistoryResult<Vec<HistoryItem>> {
        let _guard = self.write_lock.lock();
        let mut items = self.read()?;
        for mut derived in self.reconstruct_from_tasks().unwrap_or_default() {
            match items.iter_mut().find(|existing| existing.id == derived.id) {
                Some(existing) => {
                    derived.is_favorited = existing.is_favorited;
                    derived.created_at = existing.created_at.or(derived.created_at);
                    derived.workspace_paths = std::mem::take(&mut existing.workspace_paths);
                    *existing = derived;
                }
                None => items.push(derived),
            }
        }
        items.sort_by_key(|item| item.ts);
        self.write_locked(&items)?;
        Ok(items)
    }

    /// Existing backups, newest first
    pub fn backups(&self) -> Vec<PathBuf> {
        let Some(dir) = self.path.parent() else {
            return Vec::new();
        };
        let Ok(entries) = fs::read_dir(dir) else {
            return Vec::new();
        };
        let prefix = format!("{HISTORY_FILE}{BACKUP_MARKER}");
        let mut backups: Vec<(BackupStamp, PathBuf)> = entries
            .filter_map(|e| e.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                let stamp = BackupStamp::parse(name.strip_prefix(&prefix)?)?;
                Some((stamp, entry.path()))
            })
            .collect();
        backups.sort_by(|a, b| b.0.cmp(&a.0));
        backups.into_iter().map(|(_, path)| path).collect()
    }

    fn write_locked(&self, items: &[HistoryItem]) -> HistoryResult<WriteOutcome> {
        let previous = match fs::read(&self.path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(HistoryError::io(&self.path, e)),
        };
        let previous_len = match &previous {
            Some(bytes) => match serde_json::from_slice::<Vec<HistoryItem>>(bytes) {
                Ok(list) => Some(list.len()),
                Err(e) => {
                    tracing::warn!(error = %e, "existing task history is unreadable, not backing it up");
                    None
                }
            },
            None => None,
        };

        if let (Some(bytes), Some(_)) = (&previous, previous_len) {
            self.create_backup(bytes)?;
        }

        storage::write_json_atomic(&self.path, items)
            .map_err(|e| HistoryError::io(&self.path, e))?;

        let cleared = items.is_empty() && previous_len.is_some_and(|n| n > 0);
        // The first write has nothing to rotate, and a clear must not be
        // undone by recovery; both get a recovery point of the new state.
        if cleared || self.backups().is_empty() {
            let bytes = serde_json::to_vec_pretty(items)
                .map_err(|e| HistoryError::io(&self.path, e.into()))?;
            self.create_backup(&bytes)?;
        }

        match previous_len {
            Some(n) if n > 0 && items.is_empty() => {
                tracing::warn!(
                    path = %self.path.display(),
                    previous_len = n,
                    "task history overwritten with an empty list"
                );
                Ok(WriteOutcome::ClearedNonEmpty { previous_len: n })
            }
            _ => Ok(WriteOutcome::Written),
        }
    }

    fn create_backup(&self, bytes: &[u8]) -> HistoryResult<()> {
        let stamp = backup_timestamp();
        let mut seq = 0u32;
        let backup = loop {
            let name = if seq == 0 {
                format!("{HISTORY_FILE}{BACKUP_MARKER}{stamp}")
            } else {
                format!("{HISTORY_FILE}{BACKUP_MARKER}{stamp}-{seq}")
            };
            let candidate = self.path.with_file_name(name);
            if !candidate.exists() {
                break candidate;
            }
            seq += 1;
        };
        storage::write_atomic(&backup, bytes).map_err(|e| HistoryError::io(&backup, e))?;

        for stale in self.backups().into_iter().skip(MAX_BACKUPS) {
            if let Err(e) = fs::remove_file(&stale) {
                tracing::warn!(path = %stale.display(), error = %e, "failed to prune history backup");
            }
        }
        Ok(())
    }

    /// Run the recovery cascade and restore the primary file from its result
    fn recover(&self, reason: &str) -> HistoryResult<Vec<HistoryItem>> {
        let recovered = self
            .recover_from_backups()
            .or_else(|| self.reconstruct_from_tasks());

        let Some(items) = recovered else {
            return Err(HistoryError::Unrecoverable {
                path: self.path.clone(),
                reason: reason.to_string(),
            });
        };

        let corrupt = self
            .path
            .with_file_name(format!("{HISTORY_FILE}{CORRUPT_MARKER}{}", backup_timestamp()));
        if let Err(e) = fs::rename(&self.path, &corrupt) {
            tracing::warn!(error = %e, "could not set aside corrupt task history");
        }
        if let Err(e) = storage::write_json_atomic(&self.path, &items) {
            tracing::warn!(error = %e, "recovered task history could not be written back");
        }
        tracing::info!(count = items.len(), "task history recovered");
        Ok(items)
    }

    fn recover_from_backups(&self) -> Option<Vec<HistoryItem>> {
        for backup in self.backups() {
            let parsed = fs::read(&backup)
                .ok()
                .and_then(|bytes| serde_json::from_slice::<Vec<HistoryItem>>(&bytes).ok());
            match parsed {
                Some(items) => {
                    tracing::info!(
                        backup = %backup.display(),
                        count = items.len(),
                        "recovered task history from backup"
                    );
                    return Some(items);
                }
                None => {
                    tracing::warn!(backup = %backup.display(), "backup unusable, trying an older one");
                }
            }
        }
        None
    }

    /// Best-effort rebuild from `tasks/<id>/ui_messages.json`
    fn reconstruct_from_tasks(&self) -> Option<Vec<HistoryItem>> {
        let entries = fs::read_dir(&self.tasks_dir).ok()?;
        let mut items: Vec<HistoryItem> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|entry| {
                let id = entry.file_name().to_string_lossy().into_owned();
                let dir = entry.path();
                let messages: Vec<UiMessage> =
                    storage::read_json(&dir.join(UI_MESSAGES_FILE)).ok()??;
                HistoryItem::from_messages(&id, &messages, storage::dir_size(&dir))
            })
            .collect();
        if items.is_empty() {
            return None;
        }
        items.sort_by_key(|item| item.ts);
        tracing::info!(count = items.len(), "reconstructed task history from task directories");
        Some(items)
    }
}

fn backup_timestamp() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%dT%H-%M-%S%.3fZ")
        .to_string()
}

/// Sort key for a backup suffix such as `2026-10-19T15-04-05.123Z-2`
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct BackupStamp {
    stamp: String,
    seq: u32,
}

impl BackupStamp {
    fn parse(suffix: &str) -> Option<Self> {
        let (stamp, seq) = match suffix.split_once("Z-") {
            Some((stamp, seq)) => (format!("{stamp}Z"), seq.parse().ok()?),
            None => (suffix.to_string(), 0),
        };
        if !stamp.ends_with('Z') {
            return None;
        }
        Some(Self { stamp, seq })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ApiReqInfo;

    fn item(id: &str, ts: i64) -> HistoryItem {
        HistoryItem {
            id: id.to_string(),
            ts,
            task: format!("task {id}"),
            ..Default::default()
        }
    }

    #[test]
    fn test_missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskHistoryStore::new(dir.path());
        assert!(store.read().unwrap().is_empty());
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskHistoryStore::new(dir.path());
        let items = vec![item("a", 1), item("b", 2)];
        assert_eq!(store.write(&items).unwrap(), WriteOutcome::Written);
        assert_eq!(store.read().unwrap(), items);
    }

    #[test]
    fn test_write_rejects_invalid_items() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskHistoryStore::new(dir.path());

        let err = store.write(&[item("a", 1), item("", 2)]).unwrap_err();
        assert!(matches!(err, HistoryError::Invalid { index: 1, .. }));

        let err = store.write(&[item("a", 0)]).unwrap_err();
        assert!(matches!(err, HistoryError::Invalid { index: 0, .. }));

        assert!(!store.path().exists(), "rejected writes must not touch disk");
    }

    #[test]
    fn test_corrupt_primary_recovers_from_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskHistoryStore::new(dir.path());
        let items = vec![item("a", 1), item("b", 2), item("c", 3)];
        store.write(&items).unwrap();

        let mut bytes = fs::read(store.path()).unwrap();
        for b in bytes.iter_mut() {
            *b = b'#';
        }
        fs::write(store.path(), &bytes).unwrap();

        assert_eq!(store.read().unwrap(), items);
        // The primary is restored so the next read is a plain read.
        assert_eq!(store.read().unwrap(), items);
    }

    #[test]
    fn test_recovery_skips_unusable_backups() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskHistoryStore::new(dir.path());
        store.write(&[item("a", 1)]).unwrap();
        store.write(&[item("a", 1), item("b", 2)]).unwrap();
        store.write(&[item("a", 1), item("b", 2), item("c", 3)]).unwrap();

        // Newest backup holds the second write; break it so the older one is used.
        let newest = store.backups().into_iter().next().unwrap();
        fs::write(&newest, b"{not json").unwrap();
        fs::write(store.path(), b"garbage").unwrap();

        let recovered = store.read().unwrap();
        assert!(!recovered.is_empty());
        assert_eq!(recovered[0].id, "a");
    }

    #[test]
    fn test_corruption_without_recovery_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskHistoryStore::new(dir.path());
        fs::write(store.path(), b"[{\"id\": ").unwrap();

        let err = store.read().unwrap_err();
        assert!(matches!(err, HistoryError::Unrecoverable { .. }));
    }

    #[test]
    fn test_corruption_reconstructs_from_task_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskHistoryStore::new(dir.path());

        let task_dir = store.tasks_dir().join("task-1");
        let info = ApiReqInfo {
            tokens_in: 7,
            tokens_out: 3,
            cost: Some(0.25),
            ..Default::default()
        };
        let messages = vec![
            UiMessage::say(100, SayKind::Task, Some("fix the bug".into()), false),
            UiMessage::say(
                200,
                SayKind::ApiReqStarted,
                Some(serde_json::to_string(&info).unwrap()),
                false,
            ),
        ];
        storage::write_json_atomic(&task_dir.join(UI_MESSAGES_FILE), &messages).unwrap();
        fs::write(store.path(), b"not json").unwrap();

        let recovered = store.read().unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].id, "task-1");
        assert_eq!(recovered[0].task, "fix the bug");
        assert_eq!(recovered[0].ts, 200);
        assert_eq!(recovered[0].tokens_in, 7);
        assert!((recovered[0].total_cost - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_rebuild_merges_task_directories_into_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskHistoryStore::new(dir.path());
        let mut kept = item("kept", 50);
        kept.is_favorited = true;
        let mut stale = item("task-1", 10);
        stale.is_favorited = true;
        store.write(&[kept, stale]).unwrap();

        let messages = vec![
            UiMessage::say(100, SayKind::Task, Some("rebuilt".into()), false),
            UiMessage::say(300, SayKind::Text, Some("working".into()), false),
        ];
        for id in ["task-1", "task-2"] {
            storage::write_json_atomic(&store.tasks_dir().join(id).join(UI_MESSAGES_FILE), &messages)
                .unwrap();
        }

        let items = store.rebuild_from_tasks().unwrap();
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["kept", "task-1", "task-2"]);
        assert!(items[1].is_favorited);
        assert_eq!(items[1].task, "rebuilt");
        assert_eq!(items[1].ts, 300);
        assert!(!items[2].is_favorited);
        assert_eq!(store.read().unwrap(), items);
    }

    #[test]
    fn test_empty_overwrite_is_reported_not_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskHistoryStore::new(dir.path());

        assert_eq!(store.write(&[]).unwrap(), WriteOutcome::Written);
        assert_eq!(store.write(&[]).unwrap(), WriteOutcome::Written);

        store.write(&[item("a", 1), item("b", 2)]).unwrap();
        assert_eq!(
            store.write(&[]).unwrap(),
            WriteOutcome::ClearedNonEmpty { previous_len: 2 }
        );
        assert!(store.read().unwrap().is_empty());
    }

    #[test]
    fn test_corruption_after_clear_recovers_the_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskHistoryStore::new(dir.path());
        store.write(&[item("a", 1), item("b", 2)]).unwrap();
        store.write(&[]).unwrap();

        fs::write(store.path(), b"[{\"id\": ").unwrap();
        assert!(store.read().unwrap().is_empty());

        // An empty backup behind a broken newer one still counts.
        store.write(&[]).unwrap();
        store.write(&[]).unwrap();
        let newest = store.backups().into_iter().next().unwrap();
        fs::write(&newest, b"{not json").unwrap();
        fs::write(store.path(), b"garbage").unwrap();
        assert!(store.read().unwrap().is_empty());
    }

    #[test]
    fn test_backups_are_pruned_to_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskHistoryStore::new(dir.path());
        for i in 1..=9 {
            let items: Vec<_> = (1..=i).map(|n| item(&format!("t{n}"), n)).collect();
            store.write(&items).unwrap();
        }
        let backups = store.backups();
        assert_eq!(backups.len(), MAX_BACKUPS);

        // Newest backup is the state before the last write.
        let newest: Vec<HistoryItem> =
            serde_json::from_slice(&fs::read(&backups[0]).unwrap()).unwrap();
        assert_eq!(newest.len(), 8);
    }

    #[test]
    fn test_upsert_preserves_favorite_and_creation() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskHistoryStore::new(dir.path());
        let mut original = item("a", 1);
        original.is_favorited = true;
        original.created_at = Some(1);
        store.write(&[original, item("b", 2)]).unwrap();

        let mut update = item("a", 50);
        update.created_at = Some(40);
        update.tokens_in = 9;
        let list = store.upsert(update).unwrap();

        assert_eq!(list.len(), 2);
        assert_eq!(list[0].ts, 50);
        assert_eq!(list[0].tokens_in, 9);
        assert!(list[0].is_favorited);
        assert_eq!(list[0].created_at, Some(1));

        let list = store.upsert(item("c", 3)).unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(store.delete("b").unwrap().len(), 2);
    }

    #[test]
    fn test_backup_stamp_ordering() {
        let a = BackupStamp::parse("2026-01-01T00-00-00.000Z").unwrap();
        let b = BackupStamp::parse("2026-01-01T00-00-00.000Z-2").unwrap();
        let c = BackupStamp::parse("2026-01-01T00-00-00.000Z-10").unwrap();
        let d = BackupStamp::parse("2026-01-01T00-00-00.001Z").unwrap();
        assert!(a < b && b < c && c < d);
        assert!(BackupStamp::parse("garbage").is_none());
    }
}
