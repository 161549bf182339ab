use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use proven_pubsub::{BoxError, BrokerMessage};

/// A message pulled from a `JetStream` consumer.
pub struct NatsMessage {
    inner: async_nats::jetstream::Message,
    sequence: Option<u64>,
}

impl NatsMessage {
    pub(crate) fn new(inner: async_nats::jetstream::Message) -> Self {
        let sequence = inner.info().ok().map(|info| info.stream_sequence);

        Self { inner, sequence }
    }
}

impl fmt::Debug for NatsMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatsMessage")
            .field("subject", &self.inner.subject.as_str())
            .field("sequence", &self.sequence)
            .field("length", &self.inner.payload.len())
            .finish()
    }
}

#[async_trait]
impl BrokerMessage for NatsMessage {
    fn subject(&self) -> &str {
        self.inner.subject.as_str()
    }

    fn payload(&self) -> &Bytes {
        &self.inner.payload
    }

    fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    async fn ack(&self) -> Result<(), BoxError> {
        self.inner.ack().await
    }
}
