use crate::broker::BoxError;
use crate::envelope::MessageEnvelope;

use std::any::Any;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::warn;

tokio::task_local! {
    static OBSERVER_DISPATCH: ();
}

/// Whether the current task is inside an observer call whose panics are
/// caught and reported on the error channel.
pub(crate) fn in_observer_dispatch() -> bool {
    OBSERVER_DISPATCH.try_with(|_| ()).is_ok()
}

/// Observer of decoded messages.
///
/// Synchronous and asynchronous closures are adapted to this trait with
/// [`from_fn`] and [`from_async_fn`].
#[async_trait]
pub trait MessageHandler<T>
where
    Self: Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    /// Handles one message.
    async fn handle(&self, envelope: MessageEnvelope<T>) -> Result<(), BoxError>;
}

/// Handler backed by a synchronous closure.
pub struct FnHandler<F, T> {
    f: F,
    _marker: PhantomData<fn(T)>,
}

/// Handler backed by a closure returning a future.
pub struct AsyncFnHandler<F, T> {
    f: F,
    _marker: PhantomData<fn(T)>,
}

/// Adapts a synchronous closure into a [`MessageHandler`].
pub const fn from_fn<F, T>(f: F) -> FnHandler<F, T>
where
    F: Fn(MessageEnvelope<T>) -> Result<(), BoxError> + Send + Sync + 'static,
{
    FnHandler {
        f,
        _marker: PhantomData,
    }
}

/// Adapts a closure returning a future into a [`MessageHandler`].
pub const fn from_async_fn<F, Fut, T>(f: F) -> AsyncFnHandler<F, T>
where
    F: Fn(MessageEnvelope<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    AsyncFnHandler {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, T> MessageHandler<T> for FnHandler<F, T>
where
    F: Fn(MessageEnvelope<T>) -> Result<(), BoxError> + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    async fn handle(&self, envelope: MessageEnvelope<T>) -> Result<(), BoxError> {
        (self.f)(envelope)
    }
}

#[async_trait]
impl<F, Fut, T> MessageHandler<T> for AsyncFnHandler<F, T>
where
    F: Fn(MessageEnvelope<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    T: Send + Sync + 'static,
{
    async fn handle(&self, envelope: MessageEnvelope<T>) -> Result<(), BoxError> {
        (self.f)(envelope).await
    }
}

/// Applies the consumer's acknowledgment policy around a message handler.
///
/// The wrapped handler always settles before the ack is attempted. A panic
/// counts as a failed settle.
pub(crate) struct Acknowledging<T> {
    inner: Arc<dyn MessageHandler<T>>,
    no_ack: bool,
}

impl<T> Acknowledging<T>
where
    T: Send + Sync + 'static,
{
    pub(crate) fn new(inner: Arc<dyn MessageHandler<T>>, no_ack: bool) -> Self {
        Self { inner, no_ack }
    }
}

#[async_trait]
impl<T> MessageHandler<T> for Acknowledging<T>
where
    T: Send + Sync + 'static,
{
    async fn handle(&self, envelope: MessageEnvelope<T>) -> Result<(), BoxError> {
        let settle = AssertUnwindSafe(self.inner.handle(envelope.clone())).catch_unwind();
        let outcome = OBSERVER_DISPATCH
            .scope((), settle)
            .await
            .unwrap_or_else(|panic| Err(panic_message(panic.as_ref()).into()));

        if self.no_ack {
            return outcome;
        }

        match (outcome, envelope.ack().await) {
            (outcome, Ok(())) => outcome,
            (Ok(()), Err(e)) => Err(e),
            (Err(e), Err(ack_error)) => {
                warn!(error = %ack_error, "failed to acknowledge message after observer fault");
                Err(e)
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .map_or_else(
            || "message observer panicked".to_string(),
            |message| format!("message observer panicked: {message}"),
        )
}
