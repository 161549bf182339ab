use crate::broker::{Broker, BrokerConnection, PullOptions, RawMessage};
use crate::cancellation::CompositeCancellation;
use crate::connection::StreamBinding;
use crate::envelope::MessageEnvelope;
use crate::error::{Error, MessageHandlingFault, Result};
use crate::handler::{Acknowledging, MessageHandler};
use crate::observers::{ErrorObserver, Observers};

use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

/// Options for a [`Consumer`].
#[derive(Clone, Debug, Default)]
pub struct ConsumerOptions {
    /// Replaces the connection-level cancellation scope for this consumer.
    pub cancellation: Option<CancellationToken>,

    /// Durable consumer name. `None` creates an ephemeral consumer.
    pub durable_name: Option<String>,

    /// Leave acknowledgment to message observers.
    pub no_ack: bool,
}

/// Lifecycle of a [`Consumer`]'s pull loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumerState {
    /// Not subscribed yet.
    Idle,

    /// Pulling and dispatching messages.
    Running,

    /// Cancellation requested; the in-flight dispatch is finishing.
    Draining,

    /// The loop has exited.
    Stopped,
}

struct ConsumerInner<C, T>
where
    C: BrokerConnection,
    T: DeserializeOwned + Send + Sync + 'static,
{
    binding: StreamBinding<C>,
    errors: Observers<ErrorObserver>,
    messages: Observers<dyn MessageHandler<T>>,
    no_ack: bool,
    own_scope: CancellationToken,
    parent_scope: CancellationToken,
    pull_options: PullOptions,
    scope: Mutex<Option<CompositeCancellation>>,
    state: Mutex<ConsumerState>,
    task_tracker: TaskTracker,
}

/// Pulls typed messages from a stream and dispatches them to observers.
pub struct Consumer<B, T>
where
    B: Broker,
    T: DeserializeOwned + Send + Sync + 'static,
{
    inner: Arc<ConsumerInner<B::Connection, T>>,
}

impl<B, T> Clone for Consumer<B, T>
where
    B: Broker,
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B, T> fmt::Debug for Consumer<B, T>
where
    B: Broker,
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("stream", &self.inner.binding.stream)
            .field("no_ack", &self.inner.no_ack)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<B, T> Consumer<B, T>
where
    B: Broker,
    T: DeserializeOwned + Send + Sync + 'static,
{
    pub(crate) fn new(
        binding: StreamBinding<B::Connection>,
        ConsumerOptions {
            cancellation,
            durable_name,
            no_ack,
        }: ConsumerOptions,
        connection_scope: CancellationToken,
    ) -> Self {
        let task_tracker = TaskTracker::new();
        task_tracker.close();

        Self {
            inner: Arc::new(ConsumerInner {
                binding,
                errors: Observers::default(),
                messages: Observers::default(),
                no_ack,
                own_scope: CancellationToken::new(),
                parent_scope: cancellation.unwrap_or(connection_scope),
                pull_options: PullOptions { durable_name },
                scope: Mutex::new(None),
                state: Mutex::new(ConsumerState::Idle),
                task_tracker,
            }),
        }
    }

    /// The stream this consumer pulls from.
    #[must_use]
    pub fn stream(&self) -> &str {
        &self.inner.binding.stream
    }

    /// Whether acknowledgment is left to message observers.
    #[must_use]
    pub fn no_ack(&self) -> bool {
        self.inner.no_ack
    }

    /// Current state of the pull loop.
    #[must_use]
    pub fn state(&self) -> ConsumerState {
        let state = *self.inner.state.lock();

        let draining = state == ConsumerState::Running
            && self
                .inner
                .scope
                .lock()
                .as_ref()
                .is_some_and(CompositeCancellation::is_cancelled);

        if draining {
            ConsumerState::Draining
        } else {
            state
        }
    }

    /// Registers a message observer.
    ///
    /// Unless the consumer was built with `no_ack`, every message is
    /// acknowledged after this observer settles, whether it succeeded or not.
    pub fn on_message<H>(&self, handler: H) -> &Self
    where
        H: MessageHandler<T>,
    {
        self.register(Arc::new(handler), false)
    }

    /// Registers a message observer for the next dispatched message only.
    pub fn once_message<H>(&self, handler: H) -> &Self
    where
        H: MessageHandler<T>,
    {
        self.register(Arc::new(handler), true)
    }

    fn register(&self, handler: Arc<dyn MessageHandler<T>>, once: bool) -> &Self {
        let handler: Arc<dyn MessageHandler<T>> =
            Arc::new(Acknowledging::new(handler, self.inner.no_ack));
        self.inner.messages.add(handler, once);
        self
    }

    /// Registers an observer for decode, observer and pull faults.
    pub fn on_error<F>(&self, observer: F) -> &Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.inner.errors.add(Arc::new(observer), false);
        self
    }

    /// Registers an observer for the next fault only.
    pub fn once_error<F>(&self, observer: F) -> &Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.inner.errors.add(Arc::new(observer), true);
        self
    }

    /// Starts the pull loop in the background.
    ///
    /// The loop stops when the connection scope, the consumer's own scope or
    /// the given call scope is cancelled. A message already being dispatched
    /// when that happens still runs to completion. In mock mode no loop is
    /// started and no observer is ever invoked.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadySubscribed`] if this consumer was subscribed before.
    /// - [`Error::NoConnection`] if no connection is open.
    pub fn subscribe(&self, scope: Option<CancellationToken>) -> Result<Subscription> {
        let inner = &self.inner;

        {
            let mut state = inner.state.lock();

            if *state != ConsumerState::Idle {
                return Err(Error::AlreadySubscribed(inner.binding.stream.clone()));
            }

            if inner.binding.handle.is_mock() {
                debug!(stream = %inner.binding.stream, "mock subscription, not pulling");
                *state = ConsumerState::Stopped;
                return Ok(self.subscription());
            }

            let connection = inner
                .binding
                .handle
                .connection()
                .ok_or(Error::NoConnection)?;

            let composite = CompositeCancellation::new()
                .with(inner.parent_scope.clone())
                .with(inner.own_scope.clone())
                .with_optional(scope);

            if inner.messages.is_empty() {
                debug!(stream = %inner.binding.stream, "subscribed without message observers");
            }

            *inner.scope.lock() = Some(composite.clone());
            *state = ConsumerState::Running;

            inner
                .task_tracker
                .spawn(Self::process_messages(inner.clone(), connection, composite));
        }

        Ok(self.subscription())
    }

    /// Resolves once the pull loop has exited. Resolves immediately if the
    /// consumer never started one.
    pub async fn stopped(&self) {
        self.inner.task_tracker.wait().await;
    }

    fn subscription(&self) -> Subscription {
        Subscription {
            scope: self.inner.own_scope.clone(),
            task_tracker: self.inner.task_tracker.clone(),
        }
    }

    async fn process_messages(
        inner: Arc<ConsumerInner<B::Connection, T>>,
        connection: B::Connection,
        scope: CompositeCancellation,
    ) {
        let stream = inner.binding.stream.clone();
        debug!(%stream, "consumer loop started");

        match connection.pull(&stream, &inner.pull_options).await {
            Ok(mut messages) => loop {
                if scope.is_cancelled() {
                    debug!(%stream, "cancellation requested, stopping consumer loop");
                    break;
                }

                let next = tokio::select! {
                    biased;
                    () = scope.cancelled() => {
                        debug!(%stream, "cancellation requested, stopping consumer loop");
                        break;
                    }
                    next = messages.next() => next,
                };

                match next {
                    Some(Ok(message)) => inner.process(Arc::new(message)).await,
                    Some(Err(e)) => {
                        inner.errors.emit(&Error::Pull {
                            stream: stream.clone(),
                            source: Box::new(e),
                        });
                        break;
                    }
                    None => {
                        debug!(%stream, "pull source exhausted");
                        break;
                    }
                }
            },
            Err(e) => inner.errors.emit(&Error::Pull {
                stream: stream.clone(),
                source: Box::new(e),
            }),
        }

        *inner.state.lock() = ConsumerState::Stopped;
        debug!(%stream, "consumer loop stopped");
    }
}

impl<C, T> ConsumerInner<C, T>
where
    C: BrokerConnection,
    T: DeserializeOwned + Send + Sync + 'static,
{
    /// Decodes one message and dispatches it to every observer in turn.
    async fn process(&self, raw: RawMessage) {
        trace!(subject = raw.subject(), sequence = ?raw.sequence(), "received message");

        let data = match serde_json::from_slice::<T>(raw.payload()) {
            Ok(data) => data,
            Err(e) => {
                let fault = MessageHandlingFault::new(e, raw)
                    .with_annotation("failed to decode message payload");
                self.errors.emit(&Error::from(fault));
                return;
            }
        };

        let handlers = self.messages.take_snapshot();
        if handlers.is_empty() {
            debug!(subject = raw.subject(), "no message observers, leaving message unacknowledged");
            return;
        }

        let envelope = MessageEnvelope::new(data, raw.clone(), self.no_ack);

        for handler in handlers {
            if let Err(cause) = handler.handle(envelope.clone()).await {
                let fault = MessageHandlingFault::new(cause, raw.clone())
                    .with_annotation("message observer failed");
                self.errors.emit(&Error::from(fault));
            }
        }
    }
}

/// Handle to a running subscription.
#[derive(Clone, Debug)]
pub struct Subscription {
    scope: CancellationToken,
    task_tracker: TaskTracker,
}

impl Subscription {
    /// Stops the pull loop. Safe to call more than once.
    pub fn dispose(&self) {
        if !self.scope.is_cancelled() {
            debug!("disposing subscription");
        }
        self.scope.cancel();
    }

    /// Whether [`dispose`](Self::dispose) has been called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.scope.is_cancelled()
    }

    /// Resolves once the pull loop has exited.
    pub async fn stopped(&self) {
        self.task_tracker.wait().await;
    }
}
