//! cairn-agent: the task execution core
//!
//! This crate turns a provider's chunk stream into validated, approved tool
//! executions while keeping a crash-safe record of the conversation: the
//! streaming chunk processor, message persistence, the task history store,
//! the tool coordinator and its guards, the shared rate limiter, lifecycle
//! hooks and the task loop that ties them together.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod guard;
pub mod handle;
pub mod history;
pub mod hooks;
pub mod host;
pub mod message;
pub mod parser;
pub mod persistence;
pub mod processor;
pub mod rate_limit;
pub mod state;
pub mod storage;
pub mod task;
pub mod tool;

pub use config::{HookSettings, TaskConfig};
pub use coordinator::ToolCoordinator;
pub use error::{Error, Result};
pub use events::TaskEvent;
pub use guard::{AutoApprovalGuard, AutoApprovalSettings, LimitCheck, MistakeLimit};
pub use handle::TaskHandle;
pub use history::{HistoryError, HistoryItem, TaskHistoryStore, WriteOutcome};
pub use hooks::{HookData, HookEvent, HookExecutor, HookOutcome};
pub use host::{Host, Ui};
pub use message::{AskKind, AskResponse, SayKind, UiMessage};
pub use persistence::MessageStore;
pub use processor::{StreamOutcome, StreamProcessor};
pub use rate_limit::RateLimiter;
pub use state::{AssistantMessageContent, TaskState, ToolUse};
pub use task::{Task, TaskOutcome, TaskServices};
pub use tool::{ApprovalCategory, BoxedTool, FileAccess, ToolContext, ToolHandler, ToolRegistry, ToolResult};
