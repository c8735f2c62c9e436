//! Relay error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("username {0} is already taken")]
    UsernameTaken(String),

    #[error("invalid username: {0}")]
    InvalidUsername(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] duet_core::Error),
}
