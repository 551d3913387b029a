//! Error types for `remotebuild` core library.

use thiserror::Error;

use crate::build_info::BuildStatus;

/// Result type alias using `remotebuild` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `remotebuild` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A status change that would move a record backward or skip a stage
    #[error("Illegal status transition from {from} to {to}")]
    Transition { from: BuildStatus, to: BuildStatus },

    /// Malformed change list manifest
    #[error("Invalid change list: {0}")]
    ChangeList(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
