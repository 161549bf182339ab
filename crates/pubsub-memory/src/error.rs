use proven_pubsub::BrokerError;
use thiserror::Error;

/// Errors that can occur in the in-memory broker.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Operation on a closed connection.
    #[error("connection closed")]
    Closed,

    /// Connection rejected.
    #[error("connection rejected: {0}")]
    Connect(String),

    /// Publish rejected.
    #[error("publish rejected: {0}")]
    Publish(String),

    /// Pull source failed.
    #[error("pull failed: {0}")]
    Pull(String),

    /// Stream does not exist.
    #[error("stream not found: {0}")]
    StreamNotFound(String),
}

impl BrokerError for Error {}
