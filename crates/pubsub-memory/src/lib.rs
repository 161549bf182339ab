//! In-memory broker for the pub/sub crate.
//!
//! Streams live in process memory and are shared by every connection opened
//! from the same [`MemoryBroker`]. The broker also exposes hooks to inject
//! faults, which makes it the backend of choice for tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod connection;
mod error;
mod message;

pub use connection::MemoryConnection;
pub use error::Error;
pub use message::MemoryMessage;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use proven_pubsub::{Broker, ConnectionConfig};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug)]
pub(crate) struct Record {
    pub(crate) acks: AtomicUsize,
    pub(crate) payload: Bytes,
    pub(crate) seq: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StreamLog {
    pub(crate) pull_fault: Option<String>,
    pub(crate) records: Vec<Arc<Record>>,
    pub(crate) terminated: bool,
}

#[derive(Debug, Default)]
pub(crate) struct BrokerState {
    pub(crate) connection_names: Vec<String>,
    pub(crate) connections: Vec<CancellationToken>,
    pub(crate) durable_cursors: HashMap<(String, String), usize>,
    pub(crate) publish_fault: Option<String>,
    pub(crate) reject_connect: Option<String>,
    pub(crate) streams: HashMap<String, StreamLog>,
}

#[derive(Debug, Default)]
pub(crate) struct Shared {
    pub(crate) notify: Notify,
    pub(crate) state: Mutex<BrokerState>,
}

impl Shared {
    /// Wakes every pull source so it re-checks its stream.
    pub(crate) fn wake(&self) {
        self.notify.notify_waiters();
    }
}

/// An in-memory broker.
#[derive(Clone, Debug, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    /// Creates a new, empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent connects fail with the given reason, or succeed again
    /// with `None`.
    pub fn reject_connections(&self, reason: Option<&str>) {
        self.shared.state.lock().reject_connect = reason.map(ToString::to_string);
    }

    /// Makes subsequent publishes fail with the given reason, or succeed again
    /// with `None`.
    pub fn reject_publishes(&self, reason: Option<&str>) {
        self.shared.state.lock().publish_fault = reason.map(ToString::to_string);
    }

    /// Makes every pull source on the stream yield an error and end once it
    /// has delivered what is already stored.
    pub fn fail_pulls(&self, stream: &str, reason: &str) {
        self.shared
            .state
            .lock()
            .streams
            .entry(stream.to_string())
            .or_default()
            .pull_fault = Some(reason.to_string());
        self.shared.wake();
    }

    /// Ends every pull source on the stream once it has delivered what is
    /// already stored.
    pub fn terminate_stream(&self, stream: &str) {
        self.shared
            .state
            .lock()
            .streams
            .entry(stream.to_string())
            .or_default()
            .terminated = true;
        self.shared.wake();
    }

    /// Closes every open connection as if the broker went away.
    pub fn close_connections(&self) {
        let connections = std::mem::take(&mut self.shared.state.lock().connections);
        debug!(count = connections.len(), "closing connections from broker");

        for closed in connections {
            closed.cancel();
        }
        self.shared.wake();
    }

    /// Appends a raw payload, bypassing serialization. Creates the stream if
    /// needed.
    pub fn publish_raw(&self, stream: &str, payload: impl Into<Bytes>) -> u64 {
        let seq = {
            let mut state = self.shared.state.lock();
            let log = state.streams.entry(stream.to_string()).or_default();
            append(log, payload.into())
        };
        self.shared.wake();

        seq
    }

    /// Payloads stored on the stream, in order.
    #[must_use]
    pub fn published(&self, stream: &str) -> Vec<Bytes> {
        self.shared
            .state
            .lock()
            .streams
            .get(stream)
            .map(|log| log.records.iter().map(|record| record.payload.clone()).collect())
            .unwrap_or_default()
    }

    /// How often the message with the given sequence has been acknowledged.
    #[must_use]
    pub fn ack_count(&self, stream: &str, seq: u64) -> usize {
        self.shared
            .state
            .lock()
            .streams
            .get(stream)
            .and_then(|log| log.records.iter().find(|record| record.seq == seq))
            .map_or(0, |record| record.acks.load(Ordering::SeqCst))
    }

    /// Names of all connections opened so far.
    #[must_use]
    pub fn connection_names(&self) -> Vec<String> {
        self.shared.state.lock().connection_names.clone()
    }
}

pub(crate) fn append(log: &mut StreamLog, payload: Bytes) -> u64 {
    let seq = log.records.len() as u64 + 1;
    log.records.push(Arc::new(Record {
        acks: AtomicUsize::new(0),
        payload,
        seq,
    }));

    seq
}

#[async_trait]
impl Broker for MemoryBroker {
    type Error = Error;
    type Connection = MemoryConnection;

    async fn connect(&self, config: &ConnectionConfig) -> Result<MemoryConnection, Error> {
        let closed = CancellationToken::new();

        {
            let mut state = self.shared.state.lock();
            if let Some(reason) = &state.reject_connect {
                return Err(Error::Connect(reason.clone()));
            }
            state.connections.retain(|token| !token.is_cancelled());
            state.connection_names.push(config.name.clone());
            state.connections.push(closed.clone());
        }

        debug!(name = %config.name, "memory connection opened");

        Ok(MemoryConnection::new(self.shared.clone(), closed))
    }
}
