//! Error types for taskmon.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("broker error: {0}")]
    Broker(#[from] sqlx::Error),

    #[error("broker connection lost: {0}")]
    ConnectionLost(String),

    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the event consumer loop must stop on this error.
    ///
    /// Broker failures end the loop and are left to the caller's restart
    /// policy. A payload that does not decode only costs that one message.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Decode(_) | Error::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
