use crate::error::Error;
use crate::message::NatsMessage;

use async_nats::Client;
use async_nats::jetstream::Context;
use async_nats::jetstream::consumer::AckPolicy;
use async_nats::jetstream::consumer::pull::{Config as NatsConsumerConfig, MessagesErrorKind};
use async_nats::jetstream::stream::Config as NatsStreamConfig;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use proven_pubsub::{BrokerConnection, PullOptions};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// An open NATS connection with a `JetStream` context.
#[derive(Clone, Debug)]
pub struct NatsConnection {
    client: Client,
    closed: CancellationToken,
    jetstream: Context,
}

impl NatsConnection {
    pub(crate) fn new(client: Client, closed: CancellationToken) -> Self {
        let jetstream = async_nats::jetstream::new(client.clone());

        Self {
            client,
            closed,
            jetstream,
        }
    }
}

#[async_trait]
impl BrokerConnection for NatsConnection {
    type Error = Error;
    type Message = NatsMessage;

    async fn ensure_stream(&self, stream: &str) -> Result<(), Self::Error> {
        self.jetstream
            .get_or_create_stream(NatsStreamConfig {
                name: stream.to_string(),
                subjects: vec![stream.to_string()],
                ..Default::default()
            })
            .await
            .map_err(|e| Error::CreateStream(e.kind()))?;

        Ok(())
    }

    async fn publish(&self, stream: &str, payload: Bytes) -> Result<u64, Self::Error> {
        let seq = self
            .jetstream
            .publish(stream.to_string(), payload)
            .await
            .map_err(|e| Error::Publish(e.kind()))?
            .await
            .map_err(|e| Error::Publish(e.kind()))?
            .sequence;

        Ok(seq)
    }

    async fn pull(
        &self,
        stream: &str,
        options: &PullOptions,
    ) -> Result<BoxStream<'static, Result<Self::Message, Self::Error>>, Self::Error> {
        let consumer = self
            .jetstream
            .create_consumer_on_stream(
                NatsConsumerConfig {
                    durable_name: options.durable_name.clone(),
                    ack_policy: AckPolicy::Explicit,
                    ..Default::default()
                },
                stream,
            )
            .await
            .map_err(|e| Error::Consumer(e.kind()))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| Error::Stream(e.kind()))?;

        debug!(stream, durable_name = ?options.durable_name, "pulling from stream");

        // Missed heartbeats are recovered by the client; anything else ends the
        // consumer.
        let messages = messages.filter_map(|message| async move {
            match message {
                Ok(message) => Some(Ok(NatsMessage::new(message))),
                Err(e) if matches!(e.kind(), MessagesErrorKind::MissingHeartbeat) => {
                    warn!(error = %e, "missed consumer heartbeat");
                    None
                }
                Err(e) => Some(Err(Error::Messages(e.kind()))),
            }
        });

        Ok(messages.boxed())
    }

    async fn close(&self) -> Result<(), Self::Error> {
        let result = self
            .client
            .drain()
            .await
            .map_err(|e| Error::Close(e.to_string()));

        self.closed.cancel();

        result
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }
}
