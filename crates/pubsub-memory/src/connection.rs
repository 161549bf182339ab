use crate::error::Error;
use crate::message::MemoryMessage;
use crate::{Shared, append};

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use proven_pubsub::{BrokerConnection, PullOptions};
use tokio_util::sync::CancellationToken;
use tracing::debug;

enum Step {
    Deliver(MemoryMessage),
    Fail(String),
    End,
    Wait,
}

/// A connection to a [`MemoryBroker`](crate::MemoryBroker).
#[derive(Clone, Debug)]
pub struct MemoryConnection {
    closed: CancellationToken,
    shared: Arc<Shared>,
}

impl MemoryConnection {
    pub(crate) const fn new(shared: Arc<Shared>, closed: CancellationToken) -> Self {
        Self { closed, shared }
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.is_cancelled() {
            return Err(Error::Closed);
        }

        Ok(())
    }

    fn next_step(&self, stream: &str, durable_name: Option<&str>, cursor: &mut usize) -> Step {
        if self.closed.is_cancelled() {
            return Step::End;
        }

        let mut state = self.shared.state.lock();

        if let Some(durable_name) = durable_name {
            let key = (stream.to_string(), durable_name.to_string());
            *cursor = (*cursor).max(state.durable_cursors.get(&key).copied().unwrap_or(0));
        }

        let Some(log) = state.streams.get(stream) else {
            return Step::Fail(format!("stream {stream} was deleted"));
        };

        if let Some(record) = log.records.get(*cursor).cloned() {
            *cursor += 1;
            if let Some(durable_name) = durable_name {
                state
                    .durable_cursors
                    .insert((stream.to_string(), durable_name.to_string()), *cursor);
            }
            return Step::Deliver(MemoryMessage::new(stream.to_string(), record));
        }

        if let Some(reason) = &log.pull_fault {
            return Step::Fail(reason.clone());
        }

        if log.terminated {
            return Step::End;
        }

        Step::Wait
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    type Error = Error;
    type Message = MemoryMessage;

    async fn ensure_stream(&self, stream: &str) -> Result<(), Self::Error> {
        self.ensure_open()?;

        self.shared
            .state
            .lock()
            .streams
            .entry(stream.to_string())
            .or_default();

        Ok(())
    }

    async fn publish(&self, stream: &str, payload: Bytes) -> Result<u64, Self::Error> {
        self.ensure_open()?;

        let seq = {
            let mut state = self.shared.state.lock();

            if let Some(reason) = &state.publish_fault {
                return Err(Error::Publish(reason.clone()));
            }

            let log = state
                .streams
                .get_mut(stream)
                .ok_or_else(|| Error::StreamNotFound(stream.to_string()))?;

            append(log, payload)
        };

        self.shared.wake();

        Ok(seq)
    }

    async fn pull(
        &self,
        stream: &str,
        options: &PullOptions,
    ) -> Result<BoxStream<'static, Result<Self::Message, Self::Error>>, Self::Error> {
        self.ensure_open()?;

        if !self.shared.state.lock().streams.contains_key(stream) {
            return Err(Error::StreamNotFound(stream.to_string()));
        }

        debug!(stream, durable_name = ?options.durable_name, "pulling from memory stream");

        let connection = self.clone();
        let stream = stream.to_string();
        let durable_name = options.durable_name.clone();

        let messages = async_stream::stream! {
            let mut cursor = 0;

            loop {
                // Registered before the check so a wake in between is not lost.
                let notified = connection.shared.notify.notified();

                match connection.next_step(&stream, durable_name.as_deref(), &mut cursor) {
                    Step::Deliver(message) => yield Ok(message),
                    Step::Fail(reason) => {
                        yield Err(Error::Pull(reason));
                        break;
                    }
                    Step::End => break,
                    Step::Wait => notified.await,
                }
            }
        };

        Ok(messages.boxed())
    }

    async fn close(&self) -> Result<(), Self::Error> {
        self.closed.cancel();
        self.shared.wake();

        Ok(())
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }
}
