//! Subcommands of the `cairn` binary

pub mod history;
pub mod hooks;
pub mod replay;

pub use history::HistoryCommand;
pub use hooks::HooksCommand;
pub use replay::ReplayOptions;
