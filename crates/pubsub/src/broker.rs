use crate::config::ConnectionConfig;

use std::error::Error as StdError;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

/// Boxed error used for faults that cross the broker or observer boundary.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// A broker message with its concrete backend type erased.
pub type RawMessage = Arc<dyn BrokerMessage>;

/// Marker trait for broker backend errors.
pub trait BrokerError: StdError + Send + Sync + 'static {}

/// Options passed to the broker when a consumer starts pulling.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PullOptions {
    /// Durable consumer name. `None` creates an ephemeral consumer.
    pub durable_name: Option<String>,
}

/// A broker that can open connections.
#[async_trait]
pub trait Broker
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for the broker.
    type Error: BrokerError;

    /// The connection type produced by a successful handshake.
    type Connection: BrokerConnection<Error = Self::Error>;

    /// Performs one connection handshake.
    async fn connect(&self, config: &ConnectionConfig) -> Result<Self::Connection, Self::Error>;
}

/// A live connection to a broker.
///
/// All network operations of the pub/sub layer go through this trait. The
/// connection serializes its own operations; callers share it freely.
#[async_trait]
pub trait BrokerConnection
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for the connection.
    type Error: BrokerError;

    /// The message type yielded by pull sources.
    type Message: BrokerMessage;

    /// Creates the named stream if it does not exist yet.
    async fn ensure_stream(&self, stream: &str) -> Result<(), Self::Error>;

    /// Publishes a payload to the stream and resolves once the broker has
    /// acknowledged receipt, returning the stream sequence.
    async fn publish(&self, stream: &str, payload: Bytes) -> Result<u64, Self::Error>;

    /// Opens a pull source on the stream.
    ///
    /// Transient conditions are handled inside the backend. An error yielded
    /// by the returned stream is unrecoverable for the consumer reading it.
    async fn pull(
        &self,
        stream: &str,
        options: &PullOptions,
    ) -> Result<BoxStream<'static, Result<Self::Message, Self::Error>>, Self::Error>;

    /// Gracefully closes the connection.
    async fn close(&self) -> Result<(), Self::Error>;

    /// Resolves once the connection has been closed, whoever initiated it.
    async fn closed(&self);
}

/// A message received from a pull source.
#[async_trait]
pub trait BrokerMessage
where
    Self: Debug + Send + Sync + 'static,
{
    /// The subject the message was published on.
    fn subject(&self) -> &str;

    /// The raw payload.
    fn payload(&self) -> &Bytes;

    /// The stream sequence, if the backend exposes one.
    fn sequence(&self) -> Option<u64>;

    /// Acknowledges the message to the broker.
    async fn ack(&self) -> Result<(), BoxError>;
}
