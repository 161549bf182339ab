//! Durable, stream-backed publish/subscribe on top of a pull-consume broker.
//!
//! A [`Connection`] owns one broker connection and hands out [`Publisher`]s and
//! [`Consumer`]s bound to named streams. Consumers run a background pull loop
//! that decodes each message, dispatches it to registered observers and
//! acknowledges it according to the configured policy.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Traits implemented by broker backends.
pub mod broker;

/// Composite cancellation across connection, consumer and call scopes.
pub mod cancellation;

/// Connection configuration and its resolution.
pub mod config;

/// The connection manager.
pub mod connection;

/// Consumers run the pull-dispatch-ack loop.
pub mod consumer;

/// Decoded messages handed to observers.
pub mod envelope;

/// Adapters that turn closures into message handlers.
pub mod handler;

/// Publishers send messages to a stream.
pub mod publisher;

/// Process-level shutdown hooks.
pub mod shutdown;

mod error;
mod observers;

pub use broker::{
    BoxError, Broker, BrokerConnection, BrokerError, BrokerMessage, PullOptions, RawMessage,
};
pub use cancellation::CompositeCancellation;
pub use config::{ConfigSource, ConnectionConfig};
pub use connection::{Connection, ConnectionOptions, Liveness};
pub use consumer::{Consumer, ConsumerOptions, ConsumerState, Subscription};
pub use envelope::MessageEnvelope;
pub use error::{Error, ErrorKind, MessageHandlingFault, Result};
pub use handler::MessageHandler;
pub use publisher::Publisher;
pub use shutdown::ShutdownHooks;
