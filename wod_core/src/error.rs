//! Error types for the wod_core library.

use std::io;

use crate::script::StatementId;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for wod_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Statement tree failed validation
    #[error("Script error: {0}")]
    Script(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// A strategy matched a statement but could not build a block from it.
///
/// The registry recovers from these by handing the statement to the fallback
/// strategy, so they never reach the dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    /// The statement lacks the fragment the strategy keys on
    #[error("statement {id} has no {fragment} fragment")]
    MissingFragment {
        id: StatementId,
        fragment: &'static str,
    },

    /// A fragment carries a value the strategy cannot execute
    #[error("statement {id}: {message}")]
    InvalidFragment { id: StatementId, message: String },
}
