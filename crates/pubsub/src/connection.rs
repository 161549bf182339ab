use crate::broker::{Broker, BrokerConnection};
use crate::config::ConfigSource;
use crate::consumer::{Consumer, ConsumerOptions};
use crate::error::{Error, Result};
use crate::publisher::Publisher;

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MOCK_CONNECTION_NAME: &str = "mock";

/// Liveness of the broker connection behind a [`Connection`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Liveness {
    /// Never connected.
    Disconnected,

    /// Connected and usable.
    Connected,

    /// A local close is in progress.
    Closing,

    /// Closed locally or by the broker.
    Closed,
}

struct HandleState<C> {
    connection: Option<C>,
    generation: u64,
    liveness: Liveness,
    name: Option<String>,
    terminated: CancellationToken,
}

/// Shared view of the live connection. Publishers and consumers hold this by
/// reference and never decide mock mode themselves.
pub(crate) struct ConnectionHandle<C> {
    connected: Notify,
    mock: bool,
    state: RwLock<HandleState<C>>,
}

impl<C> ConnectionHandle<C>
where
    C: BrokerConnection,
{
    fn new(mock: bool) -> Self {
        Self {
            connected: Notify::new(),
            mock,
            state: RwLock::new(HandleState {
                connection: None,
                generation: 0,
                liveness: Liveness::Disconnected,
                name: None,
                terminated: CancellationToken::new(),
            }),
        }
    }

    pub(crate) const fn is_mock(&self) -> bool {
        self.mock
    }

    pub(crate) fn liveness(&self) -> Liveness {
        self.state.read().liveness
    }

    /// The open connection, if any.
    pub(crate) fn connection(&self) -> Option<C> {
        let state = self.state.read();
        match state.liveness {
            Liveness::Connected => state.connection.clone(),
            _ => None,
        }
    }

    fn set_connected(&self, connection: Option<C>, name: String) -> u64 {
        let mut state = self.state.write();
        state.connection = connection;
        state.generation += 1;
        state.liveness = Liveness::Connected;
        state.name = Some(name);
        state.terminated = CancellationToken::new();
        let generation = state.generation;
        drop(state);

        self.connected.notify_waiters();
        generation
    }

    /// Marks the connection closed if it is still the given generation and no
    /// local close has started.
    fn mark_terminated(&self, generation: u64) -> bool {
        let mut state = self.state.write();
        if state.generation != generation || state.liveness != Liveness::Connected {
            return false;
        }
        state.connection = None;
        state.liveness = Liveness::Closed;
        state.terminated.cancel();
        true
    }

    /// Resolves when the broker terminates the current generation. A newer
    /// generation replaces the one being watched.
    async fn terminated(&self) {
        loop {
            let reconnected = self.connected.notified();
            let terminated = self.state.read().terminated.clone();

            tokio::select! {
                () = terminated.cancelled() => return,
                () = reconnected => {}
            }
        }
    }
}

/// A named stream bound to a connection handle.
pub(crate) struct StreamBinding<C> {
    pub(crate) handle: Arc<ConnectionHandle<C>>,
    pub(crate) stream: String,
}

impl<C> Clone for StreamBinding<C> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            stream: self.stream.clone(),
        }
    }
}

/// Options for a [`Connection`].
#[derive(Clone, Debug)]
pub struct ConnectionOptions<B>
where
    B: Broker,
{
    /// The broker backend.
    pub broker: B,

    /// Where to resolve connection configuration from on connect.
    pub config: ConfigSource,

    /// Bypass all network operations.
    pub mock: bool,
}

/// Owns a single broker connection and builds publishers and consumers on it.
pub struct Connection<B>
where
    B: Broker,
{
    broker: B,
    config: ConfigSource,
    handle: Arc<ConnectionHandle<B::Connection>>,
    lifecycle: Arc<Mutex<()>>,
    shutdown_token: CancellationToken,
}

impl<B> Clone for Connection<B>
where
    B: Broker,
{
    fn clone(&self) -> Self {
        Self {
            broker: self.broker.clone(),
            config: self.config.clone(),
            handle: self.handle.clone(),
            lifecycle: self.lifecycle.clone(),
            shutdown_token: self.shutdown_token.clone(),
        }
    }
}

impl<B> fmt::Debug for Connection<B>
where
    B: Broker,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("broker", &self.broker)
            .field("config", &self.config)
            .field("liveness", &self.liveness())
            .field("mock", &self.handle.is_mock())
            .finish_non_exhaustive()
    }
}

impl<B> Connection<B>
where
    B: Broker,
{
    /// Creates a new, not yet connected, connection manager.
    #[must_use]
    pub fn new(
        ConnectionOptions {
            broker,
            config,
            mock,
        }: ConnectionOptions<B>,
    ) -> Self {
        Self {
            broker,
            config,
            handle: Arc::new(ConnectionHandle::new(mock)),
            lifecycle: Arc::new(Mutex::new(())),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Opens the broker connection.
    ///
    /// In mock mode no configuration is resolved and nothing touches the
    /// network.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyConnected`] if the connection is already enabled.
    /// - [`Error::Configuration`] if configuration resolution fails.
    /// - [`Error::Connect`] if the broker rejects the handshake.
    pub async fn connect(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        if self.is_enabled() {
            return Err(Error::AlreadyConnected);
        }

        if self.handle.is_mock() {
            self.handle
                .set_connected(None, MOCK_CONNECTION_NAME.to_string());
            info!("connected in mock mode");
            return Ok(());
        }

        let config = self.config.resolve().await?;

        let connection = self
            .broker
            .connect(&config)
            .await
            .map_err(|e| Error::Connect(Box::new(e)))?;

        info!(name = %config.name, servers = ?config.servers, "connected to broker");

        let generation = self
            .handle
            .set_connected(Some(connection.clone()), config.name);
        self.watch_termination(connection, generation);

        Ok(())
    }

    fn watch_termination(&self, connection: B::Connection, generation: u64) {
        let handle: Weak<ConnectionHandle<B::Connection>> = Arc::downgrade(&self.handle);

        tokio::spawn(async move {
            connection.closed().await;

            if let Some(handle) = handle.upgrade() {
                if handle.mark_terminated(generation) {
                    warn!("broker closed the connection");
                }
            }
        });
    }

    /// Gracefully closes the connection if it is open.
    ///
    /// Returns whether a close actually happened.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Close`] if the broker fails while closing an open
    /// connection. The connection is considered closed either way.
    pub async fn close(&self) -> Result<bool> {
        let _lifecycle = self.lifecycle.lock().await;

        let connection = {
            let mut state = self.handle.state.write();
            if state.liveness != Liveness::Connected {
                return Ok(false);
            }
            state.liveness = Liveness::Closing;
            state.connection.take()
        };

        let result = match connection {
            Some(connection) => connection.close().await,
            None => Ok(()),
        };

        self.handle.state.write().liveness = Liveness::Closed;
        result.map_err(|e| Error::Close(Box::new(e)))?;

        info!("connection closed");

        Ok(true)
    }

    /// Closes the connection, logging instead of returning failures.
    pub(crate) async fn close_quietly(&self) {
        match self.close().await {
            Ok(true) => debug!("best-effort close completed"),
            Ok(false) => debug!("best-effort close skipped, connection not open"),
            Err(e) => warn!(error = %e, "best-effort close failed"),
        }
    }

    /// Resolves when the broker terminates the connection on its own.
    pub(crate) async fn terminated(&self) {
        self.handle.terminated().await;
    }

    /// Whether a connection exists and is not closed.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.handle.liveness() == Liveness::Connected
    }

    /// Whether network operations are bypassed.
    #[must_use]
    pub fn is_mock(&self) -> bool {
        self.handle.is_mock()
    }

    /// Current liveness of the connection.
    #[must_use]
    pub fn liveness(&self) -> Liveness {
        self.handle.liveness()
    }

    /// Logical client name of the current or last connection.
    #[must_use]
    pub fn name(&self) -> Option<String> {
        self.handle.state.read().name.clone()
    }

    /// The connection-level cancellation scope shared by every consumer built
    /// from this connection (unless overridden per consumer).
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Signals the connection-level cancellation scope.
    pub fn cancel(&self) {
        self.shutdown_token.cancel();
    }

    /// Creates the stream on the broker if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid name, [`Error::NoConnection`]
    /// without an open connection, or [`Error::Stream`] if the broker fails.
    pub async fn ensure_stream(&self, stream: &str) -> Result<()> {
        validate_name("stream", stream)?;

        if self.is_mock() {
            return Ok(());
        }

        let connection = self.handle.connection().ok_or(Error::NoConnection)?;

        connection
            .ensure_stream(stream)
            .await
            .map_err(|e| Error::Stream {
                stream: stream.to_string(),
                source: Box::new(e),
            })?;

        debug!(stream, "stream ensured");

        Ok(())
    }

    /// Creates a publisher bound to the named stream.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the stream name is invalid.
    pub fn create_publisher<T>(&self, stream: impl Into<String>) -> Result<Publisher<B, T>>
    where
        T: Serialize + Send + Sync,
    {
        let stream = stream.into();
        validate_name("stream", &stream)?;

        Ok(Publisher::new(self.bind(stream)))
    }

    /// Creates a consumer bound to the named stream.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the stream name or durable name is
    /// invalid.
    pub fn create_consumer<T>(
        &self,
        stream: impl Into<String>,
        options: ConsumerOptions,
    ) -> Result<Consumer<B, T>>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let stream = stream.into();
        validate_name("stream", &stream)?;
        if let Some(durable_name) = &options.durable_name {
            validate_name("durable", durable_name)?;
        }

        Ok(Consumer::new(
            self.bind(stream),
            options,
            self.shutdown_token.clone(),
        ))
    }

    fn bind(&self, stream: String) -> StreamBinding<B::Connection> {
        StreamBinding {
            handle: self.handle.clone(),
            stream,
        }
    }
}

/// Stream and durable names become subject tokens, so they cannot contain
/// whitespace, wildcards, token separators or path separators.
fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Configuration(format!("{kind} name must not be empty")));
    }

    if let Some(invalid) = name
        .chars()
        .find(|c| c.is_whitespace() || matches!(c, '.' | '*' | '>' | '/' | '\\'))
    {
        return Err(Error::Configuration(format!(
            "{kind} name {name:?} contains invalid character {invalid:?}"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerError, PullOptions};
    use crate::envelope::tests::CountingMessage;

    use std::time::Duration;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::StreamExt;
    use futures::stream::BoxStream;
    use tokio::time::timeout;

    #[derive(Debug, thiserror::Error)]
    #[error("idle connection")]
    struct IdleError;

    impl BrokerError for IdleError {}

    /// A connection that never closes on its own.
    #[derive(Clone, Debug)]
    struct IdleConnection;

    #[async_trait]
    impl BrokerConnection for IdleConnection {
        type Error = IdleError;
        type Message = CountingMessage;

        async fn ensure_stream(&self, _stream: &str) -> Result<(), IdleError> {
            Ok(())
        }

        async fn publish(&self, _stream: &str, _payload: Bytes) -> Result<u64, IdleError> {
            Ok(1)
        }

        async fn pull(
            &self,
            _stream: &str,
            _options: &PullOptions,
        ) -> Result<BoxStream<'static, Result<CountingMessage, IdleError>>, IdleError> {
            Ok(futures::stream::empty().boxed())
        }

        async fn close(&self) -> Result<(), IdleError> {
            Ok(())
        }

        async fn closed(&self) {
            futures::future::pending::<()>().await;
        }
    }

    #[tokio::test]
    async fn test_termination_follows_current_generation() {
        let handle = ConnectionHandle::<IdleConnection>::new(false);

        let first = handle.set_connected(Some(IdleConnection), "first".to_string());
        assert!(handle.mark_terminated(first));
        timeout(Duration::from_secs(1), handle.terminated())
            .await
            .expect("first generation should be terminated");

        let second = handle.set_connected(Some(IdleConnection), "second".to_string());
        assert!(
            timeout(Duration::from_millis(50), handle.terminated())
                .await
                .is_err()
        );
        assert!(!handle.mark_terminated(first));

        let watcher = async {
            timeout(Duration::from_secs(1), handle.terminated())
                .await
                .expect("second generation should be terminated");
        };
        let terminate = async {
            tokio::task::yield_now().await;
            assert!(handle.mark_terminated(second));
        };
        tokio::join!(watcher, terminate);
    }

    #[tokio::test]
    async fn test_termination_watch_survives_reconnect() {
        let handle = Arc::new(ConnectionHandle::<IdleConnection>::new(false));
        handle.set_connected(Some(IdleConnection), "first".to_string());

        let watcher = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.terminated().await })
        };
        tokio::task::yield_now().await;

        // Local close and reconnect: the watcher moves on to the new generation.
        handle.state.write().liveness = Liveness::Closed;
        let second = handle.set_connected(Some(IdleConnection), "second".to_string());
        tokio::task::yield_now().await;
        assert!(!watcher.is_finished());

        assert!(handle.mark_terminated(second));
        timeout(Duration::from_secs(1), watcher)
            .await
            .expect("watcher should resolve")
            .expect("watcher task failed");
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("stream", "ORDERS_v2-eu").is_ok());
        assert_matches!(validate_name("stream", ""), Err(Error::Configuration(_)));
        assert_matches!(
            validate_name("stream", "orders.created"),
            Err(Error::Configuration(message)) => assert!(message.contains("'.'"))
        );
        assert_matches!(validate_name("durable", "a b"), Err(Error::Configuration(_)));
        assert_matches!(validate_name("stream", "orders>"), Err(Error::Configuration(_)));
    }
}
