use crate::broker::{BoxError, RawMessage};

use std::fmt;

use thiserror::Error;

/// Convenience alias for results in this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Broad classification of an [`Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid or missing connection or subscribe options.
    Configuration,

    /// Handshake failure, or an operation attempted without an open connection.
    Connection,

    /// The broker rejected or failed to deliver a published message.
    Publish,

    /// Decoding or observing one specific message failed.
    MessageHandling,

    /// The pull source failed and the consumer loop stopped.
    Consume,
}

/// Errors that can occur in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Consumer has already been subscribed.
    #[error("consumer for stream {0} has already been subscribed")]
    AlreadySubscribed(String),

    /// Connect called while a connection is enabled.
    #[error("already connected")]
    AlreadyConnected,

    /// Closing the connection failed.
    #[error("failed to close connection: {0}")]
    Close(#[source] BoxError),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Broker rejected the handshake.
    #[error("failed to connect: {0}")]
    Connect(#[source] BoxError),

    /// Message could not be serialized.
    #[error("failed to encode message for stream {stream}: {source}")]
    Encode {
        /// The stream the message was destined for.
        stream: String,

        /// The serialization failure.
        source: serde_json::Error,
    },

    /// Decode or observer fault for a single message.
    #[error(transparent)]
    MessageHandling(#[from] MessageHandlingFault),

    /// Operation requires an open connection.
    #[error("no connection available")]
    NoConnection,

    /// Broker failed to accept a published message.
    #[error("failed to publish to stream {stream}: {source}")]
    Publish {
        /// The stream published to.
        stream: String,

        /// The broker failure.
        source: BoxError,
    },

    /// Pull source failed.
    #[error("failed to pull from stream {stream}: {source}")]
    Pull {
        /// The stream pulled from.
        stream: String,

        /// The broker failure.
        source: BoxError,
    },

    /// Installing a signal handler failed.
    #[error("failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),

    /// Stream provisioning failed.
    #[error("failed to ensure stream {stream}: {source}")]
    Stream {
        /// The stream being provisioned.
        stream: String,

        /// The broker failure.
        source: BoxError,
    },
}

impl Error {
    /// Returns the classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadySubscribed(_) | Self::Configuration(_) => ErrorKind::Configuration,
            Self::AlreadyConnected
            | Self::Close(_)
            | Self::Connect(_)
            | Self::NoConnection
            | Self::Signal(_)
            | Self::Stream { .. } => ErrorKind::Connection,
            Self::Encode { .. } | Self::Publish { .. } => ErrorKind::Publish,
            Self::MessageHandling(_) => ErrorKind::MessageHandling,
            Self::Pull { .. } => ErrorKind::Consume,
        }
    }

    /// Returns the wrapped message fault, if this is one.
    #[must_use]
    pub const fn as_message_fault(&self) -> Option<&MessageHandlingFault> {
        match self {
            Self::MessageHandling(fault) => Some(fault),
            _ => None,
        }
    }
}

/// A fault raised while processing one specific broker message.
///
/// Carries the original fault and the raw message so error observers can tell
/// a misbehaving message apart from connectivity problems.
pub struct MessageHandlingFault {
    annotation: Option<String>,
    cause: BoxError,
    message: RawMessage,
}

impl MessageHandlingFault {
    /// Wraps a fault raised while handling `message`.
    pub fn new(cause: impl Into<BoxError>, message: RawMessage) -> Self {
        Self {
            annotation: None,
            cause: cause.into(),
            message,
        }
    }

    /// Attaches a human-readable annotation.
    #[must_use]
    pub fn with_annotation(mut self, annotation: impl Into<String>) -> Self {
        self.annotation = Some(annotation.into());
        self
    }

    /// The annotation, if any.
    #[must_use]
    pub fn annotation(&self) -> Option<&str> {
        self.annotation.as_deref()
    }

    /// The originating fault.
    #[must_use]
    pub fn cause(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self.cause.as_ref()
    }

    /// The raw broker message that was being processed.
    #[must_use]
    pub const fn message(&self) -> &RawMessage {
        &self.message
    }
}

impl fmt::Debug for MessageHandlingFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageHandlingFault")
            .field("annotation", &self.annotation)
            .field("cause", &self.cause)
            .field("subject", &self.message.subject())
            .field("sequence", &self.message.sequence())
            .finish()
    }
}

impl fmt::Display for MessageHandlingFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to handle message on {}", self.message.subject())?;
        if let Some(sequence) = self.message.sequence() {
            write!(f, " (seq {sequence})")?;
        }
        match &self.annotation {
            Some(annotation) => write!(f, ": {annotation}: {}", self.cause),
            None => write!(f, ": {}", self.cause),
        }
    }
}

impl std::error::Error for MessageHandlingFault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.cause.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerMessage;

    use std::sync::Arc;

    use async_trait::async_trait;
    use bytes::Bytes;

    #[derive(Debug)]
    struct StaticMessage(Bytes);

    #[async_trait]
    impl BrokerMessage for StaticMessage {
        fn subject(&self) -> &str {
            "orders"
        }

        fn payload(&self) -> &Bytes {
            &self.0
        }

        fn sequence(&self) -> Option<u64> {
            Some(7)
        }

        async fn ack(&self) -> Result<(), BoxError> {
            Ok(())
        }
    }

    #[test]
    fn test_fault_display_includes_message_context() {
        let message: RawMessage = Arc::new(StaticMessage(Bytes::from_static(b"{}")));
        let fault = MessageHandlingFault::new("boom", message).with_annotation("observer failed");

        assert_eq!(
            fault.to_string(),
            "failed to handle message on orders (seq 7): observer failed: boom"
        );
        assert_eq!(fault.annotation(), Some("observer failed"));
        assert_eq!(fault.cause().to_string(), "boom");
        assert!(std::error::Error::source(&fault).is_some());
    }

    #[test]
    fn test_error_kinds() {
        let message: RawMessage = Arc::new(StaticMessage(Bytes::new()));

        assert_eq!(Error::NoConnection.kind(), ErrorKind::Connection);
        assert_eq!(Error::AlreadyConnected.kind(), ErrorKind::Connection);
        assert_eq!(
            Error::Configuration("bad".to_string()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            Error::Publish {
                stream: "orders".to_string(),
                source: "nope".into(),
            }
            .kind(),
            ErrorKind::Publish
        );

        let error = Error::from(MessageHandlingFault::new("boom", message));
        assert_eq!(error.kind(), ErrorKind::MessageHandling);
        assert!(error.as_message_fault().is_some());
    }
}
