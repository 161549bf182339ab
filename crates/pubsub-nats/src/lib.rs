//! NATS `JetStream` backend for the pub/sub crate.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod connection;
mod error;
mod message;

pub use connection::NatsConnection;
pub use error::Error;
pub use message::NatsMessage;

use std::time::Duration;

use async_nats::{ConnectOptions, Event};
use async_trait::async_trait;
use proven_pubsub::{Broker, ConnectionConfig};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Options for the NATS broker.
#[derive(Clone, Debug)]
pub struct NatsBrokerOptions {
    /// How long a single connection attempt may take.
    pub connection_timeout: Duration,
}

impl Default for NatsBrokerOptions {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(5),
        }
    }
}

/// Opens NATS connections.
#[derive(Clone, Debug, Default)]
pub struct NatsBroker {
    options: NatsBrokerOptions,
}

impl NatsBroker {
    /// Creates a new NATS broker.
    #[must_use]
    pub const fn new(options: NatsBrokerOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Broker for NatsBroker {
    type Error = Error;
    type Connection = NatsConnection;

    async fn connect(&self, config: &ConnectionConfig) -> Result<NatsConnection, Error> {
        let closed = CancellationToken::new();
        let event_closed = closed.clone();

        let mut connect_options = ConnectOptions::new()
            .name(&config.name)
            .connection_timeout(self.options.connection_timeout)
            .event_callback(move |event| {
                let closed = event_closed.clone();
                async move {
                    match event {
                        Event::Closed => {
                            info!("nats connection closed");
                            closed.cancel();
                        }
                        Event::Disconnected => warn!("nats connection lost, reconnecting"),
                        other => debug!(event = ?other, "nats connection event"),
                    }
                }
            });

        if let (Some(user), Some(password)) = (&config.user, &config.password) {
            connect_options = connect_options.user_and_password(user.clone(), password.clone());
        }

        let servers = config.servers.join(",");
        let client = connect_options
            .connect(servers.as_str())
            .await
            .map_err(|e| Error::Connect(e.kind()))?;

        Ok(NatsConnection::new(client, closed))
    }
}
