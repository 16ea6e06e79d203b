//! Built-in tools for the coding agent

mod bash;
mod completion;
mod edit;
mod read;
mod write;

pub use bash::BashTool;
pub use completion::CompletionTool;
pub use edit::EditTool;
pub use read::ReadTool;
pub use write::WriteTool;

use cairn_agent::ToolRegistry;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Registry with every built-in tool
pub fn registry() -> ToolRegistry {
    ToolRegistry::new()
        .with(Arc::new(BashTool::new()))
        .with(Arc::new(ReadTool::new()))
        .with(Arc::new(WriteTool::new()))
        .with(Arc::new(EditTool::new()))
        .with(Arc::new(CompletionTool::new()))
}

/// Resolve a tool path argument: `~` expands to the home directory and
/// relative paths are taken from the task's working directory.
pub(crate) fn resolve_path(cwd: &Path, path: &str) -> PathBuf {
    let expanded = if let Some(stripped) = path.strip_prefix("~/") {
        match dirs::home_dir() {
            Some(home) => home.join(stripped),
            None => PathBuf::from(path),
        }
    } else if path == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else {
        PathBuf::from(path)
    };
    if expanded.is_absolute() {
        expanded
    } else {
        cwd.join(expanded)
    }
}
