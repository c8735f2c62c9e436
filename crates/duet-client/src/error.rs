//! Client error types.

use thiserror::Error;

use crate::connection::ConnectionError;
use crate::sequencing::SequencingError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no username configured")]
    MissingUsername,

    #[error("not connected to relay")]
    NotConnected,

    #[error(transparent)]
    Sequencing(#[from] SequencingError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Core(#[from] duet_core::Error),
}
