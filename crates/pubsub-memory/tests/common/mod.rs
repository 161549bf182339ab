#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use proven_pubsub::{
    ConfigSource, Connection, ConnectionConfig, ConnectionOptions, Consumer, Error, ErrorKind,
};
use proven_pubsub_memory::MemoryBroker;
use serde::{Deserialize, Serialize};

pub const STREAM: &str = "orders";

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct Order {
    pub bar: u32,
}

/// What an error observer saw.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Seen {
    pub annotation: Option<String>,
    pub kind: ErrorKind,
    pub sequence: Option<u64>,
}

pub fn config() -> ConnectionConfig {
    ConnectionConfig {
        name: "orders-service".to_string(),
        password: None,
        servers: vec!["memory://local".to_string()],
        user: None,
    }
}

pub fn connection(broker: &MemoryBroker, mock: bool) -> Connection<MemoryBroker> {
    Connection::new(ConnectionOptions {
        broker: broker.clone(),
        config: ConfigSource::from(config()),
        mock,
    })
}

pub async fn connected(broker: &MemoryBroker) -> Connection<MemoryBroker> {
    let connection = connection(broker, false);
    connection.connect().await.expect("Failed to connect");
    connection
        .ensure_stream(STREAM)
        .await
        .expect("Failed to ensure stream");
    connection
}

pub async fn within<F>(future: F) -> F::Output
where
    F: Future,
{
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("Timed out")
}

pub fn record(error: &Error) -> Seen {
    let fault = error.as_message_fault();

    Seen {
        annotation: fault.and_then(|f| f.annotation().map(ToString::to_string)),
        kind: error.kind(),
        sequence: fault.and_then(|f| f.message().sequence()),
    }
}

pub fn collect_errors(consumer: &Consumer<MemoryBroker, Order>) -> Arc<Mutex<Vec<Seen>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    consumer.on_error(move |error| sink.lock().push(record(error)));
    seen
}
