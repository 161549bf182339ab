use crate::broker::{Broker, BrokerConnection};
use crate::connection::StreamBinding;
use crate::error::{Error, Result};
use crate::observers::{ErrorObserver, Observers};

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tracing::debug;

/// Serializes typed messages and appends them to a stream.
pub struct Publisher<B, T>
where
    B: Broker,
{
    binding: StreamBinding<B::Connection>,
    errors: Arc<Observers<ErrorObserver>>,
    _marker: PhantomData<fn(&T)>,
}

impl<B, T> Clone for Publisher<B, T>
where
    B: Broker,
{
    fn clone(&self) -> Self {
        Self {
            binding: self.binding.clone(),
            errors: self.errors.clone(),
            _marker: PhantomData,
        }
    }
}

impl<B, T> fmt::Debug for Publisher<B, T>
where
    B: Broker,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("stream", &self.binding.stream)
            .finish_non_exhaustive()
    }
}

impl<B, T> Publisher<B, T>
where
    B: Broker,
    T: Serialize + Send + Sync,
{
    pub(crate) fn new(binding: StreamBinding<B::Connection>) -> Self {
        Self {
            binding,
            errors: Arc::new(Observers::default()),
            _marker: PhantomData,
        }
    }

    /// The stream this publisher appends to.
    #[must_use]
    pub fn stream(&self) -> &str {
        &self.binding.stream
    }

    /// Registers an observer for publish failures.
    pub fn on_error<F>(&self, observer: F) -> &Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.errors.add(Arc::new(observer), false);
        self
    }

    /// Registers an observer for the next publish failure only.
    pub fn once_error<F>(&self, observer: F) -> &Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.errors.add(Arc::new(observer), true);
        self
    }

    /// Publishes one message.
    ///
    /// Returns `Ok(true)` once the broker has persisted the message. Encoding
    /// and broker failures are reported to the error observers and yield
    /// `Ok(false)`. In mock mode nothing is encoded or sent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoConnection`] if no connection is open.
    pub async fn publish(&self, message: &T) -> Result<bool> {
        if self.binding.handle.is_mock() {
            return Ok(true);
        }

        let connection = self
            .binding
            .handle
            .connection()
            .ok_or(Error::NoConnection)?;

        let payload = match serde_json::to_vec(message) {
            Ok(payload) => Bytes::from(payload),
            Err(source) => {
                self.errors.emit(&Error::Encode {
                    stream: self.binding.stream.clone(),
                    source,
                });
                return Ok(false);
            }
        };

        match connection.publish(&self.binding.stream, payload).await {
            Ok(sequence) => {
                debug!(stream = %self.binding.stream, sequence, "published message");
                Ok(true)
            }
            Err(e) => {
                self.errors.emit(&Error::Publish {
                    stream: self.binding.stream.clone(),
                    source: Box::new(e),
                });
                Ok(false)
            }
        }
    }
}
