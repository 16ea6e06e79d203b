//! Error types for cairn-agent

use thiserror::Error;

use crate::history::HistoryError;

/// Result type alias using cairn-agent Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a task
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the provider layer
    #[error(transparent)]
    Api(#[from] cairn_api::Error),

    /// The global task history could not be read or written
    #[error(transparent)]
    History(#[from] HistoryError),

    /// Filesystem failure outside the history store
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The task was cancelled while this operation was waiting
    #[error("Task aborted")]
    Aborted,

    /// A local wait expired (for example an unanswered ask)
    #[error("Timed out waiting for {0}")]
    TimedOut(String),

    /// The user declined to continue past a guard prompt
    #[error("Task halted: {0}")]
    Halted(String),

    /// A generic task error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error means the task was cancelled
    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted | Error::Api(cairn_api::Error::Aborted))
    }

    /// Whether the error should be shown to the user as a failure.
    ///
    /// Timeouts are usually voluntary abandonment and cancellation is
    /// user-initiated, so neither is reported.
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, Error::TimedOut(_)) && !self.is_aborted()
    }
}
