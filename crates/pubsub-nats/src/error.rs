use proven_pubsub::BrokerError;
use thiserror::Error;

/// Errors that can occur in the NATS backend.
#[derive(Debug, Error)]
pub enum Error {
    /// Draining the client failed.
    #[error("failed to drain connection: {0}")]
    Close(String),

    /// Handshake failed.
    #[error("failed to connect: {0}")]
    Connect(async_nats::ConnectErrorKind),

    /// Creating the pull consumer failed.
    #[error("failed to create consumer: {0}")]
    Consumer(async_nats::jetstream::stream::ConsumerErrorKind),

    /// Creating or looking up the stream failed.
    #[error("failed to create stream: {0}")]
    CreateStream(async_nats::jetstream::context::CreateStreamErrorKind),

    /// Consumer message stream failed.
    #[error("failed to get consumer messages: {0}")]
    Messages(async_nats::jetstream::consumer::pull::MessagesErrorKind),

    /// Publish failed or was not acknowledged.
    #[error("failed to publish: {0}")]
    Publish(async_nats::jetstream::context::PublishErrorKind),

    /// Opening the consumer message stream failed.
    #[error("consumer stream error: {0}")]
    Stream(async_nats::jetstream::consumer::StreamErrorKind),
}

impl BrokerError for Error {}
