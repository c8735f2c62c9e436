//! Error types for Duet core library.

use thiserror::Error;

/// Result type alias using Duet Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for Duet operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed wire line
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Command word not part of the protocol
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
