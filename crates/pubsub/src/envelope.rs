use crate::broker::{BoxError, RawMessage};

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A decoded message together with a handle back to the broker message.
///
/// Cloning is cheap; every observer of one dispatch receives a clone sharing
/// the same acknowledgment state, so [`ack`](Self::ack) reaches the broker at
/// most once per message.
pub struct MessageEnvelope<T> {
    acked: Arc<AtomicBool>,
    data: Arc<T>,
    no_ack: bool,
    raw: RawMessage,
}

impl<T> Clone for MessageEnvelope<T> {
    fn clone(&self) -> Self {
        Self {
            acked: self.acked.clone(),
            data: self.data.clone(),
            no_ack: self.no_ack,
            raw: self.raw.clone(),
        }
    }
}

impl<T> MessageEnvelope<T> {
    pub(crate) fn new(data: T, raw: RawMessage, no_ack: bool) -> Self {
        Self {
            acked: Arc::new(AtomicBool::new(false)),
            data: Arc::new(data),
            no_ack,
            raw,
        }
    }

    /// The decoded payload.
    #[must_use]
    pub fn data(&self) -> &T {
        &self.data
    }

    /// The raw broker message.
    #[must_use]
    pub const fn raw(&self) -> &RawMessage {
        &self.raw
    }

    /// Whether the consumer leaves acknowledgment to the observer.
    #[must_use]
    pub const fn no_ack(&self) -> bool {
        self.no_ack
    }

    /// Whether the message has been acknowledged.
    #[must_use]
    pub fn is_acked(&self) -> bool {
        self.acked.load(Ordering::SeqCst)
    }

    /// Acknowledges the message. Calls after the first successful one are
    /// no-ops.
    ///
    /// # Errors
    ///
    /// Returns the broker's error if the acknowledgment fails; the message can
    /// then be acknowledged again.
    pub async fn ack(&self) -> Result<(), BoxError> {
        if self.acked.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = self.raw.ack().await {
            self.acked.store(false, Ordering::SeqCst);
            return Err(e);
        }

        Ok(())
    }
}

impl<T: fmt::Debug> fmt::Debug for MessageEnvelope<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageEnvelope")
            .field("data", &self.data)
            .field("no_ack", &self.no_ack)
            .field("acked", &self.is_acked())
            .field("raw", &self.raw)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::broker::BrokerMessage;

    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use bytes::Bytes;

    /// Broker message that counts acknowledgments.
    #[derive(Debug, Default)]
    pub(crate) struct CountingMessage {
        pub(crate) acks: AtomicUsize,
        pub(crate) fail_acks: AtomicBool,
        pub(crate) payload: Bytes,
    }

    #[async_trait]
    impl BrokerMessage for CountingMessage {
        fn subject(&self) -> &str {
            "test"
        }

        fn payload(&self) -> &Bytes {
            &self.payload
        }

        fn sequence(&self) -> Option<u64> {
            Some(1)
        }

        async fn ack(&self) -> Result<(), BoxError> {
            if self.fail_acks.load(Ordering::SeqCst) {
                return Err("ack rejected".into());
            }
            self.acks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_ack_is_idempotent() {
        let message = Arc::new(CountingMessage::default());
        let envelope = MessageEnvelope::new(42_u32, message.clone(), false);
        let other = envelope.clone();

        envelope.ack().await.expect("first ack");
        envelope.ack().await.expect("second ack");
        other.ack().await.expect("ack from clone");

        assert!(envelope.is_acked());
        assert_eq!(message.acks.load(Ordering::SeqCst), 1);
        assert_eq!(*other.data(), 42);
    }

    #[tokio::test]
    async fn test_failed_ack_can_be_retried() {
        let message = Arc::new(CountingMessage::default());
        message.fail_acks.store(true, Ordering::SeqCst);
        let envelope = MessageEnvelope::new((), message.clone(), true);

        assert!(envelope.ack().await.is_err());
        assert!(!envelope.is_acked());

        message.fail_acks.store(false, Ordering::SeqCst);
        envelope.ack().await.expect("retry should succeed");
        assert_eq!(message.acks.load(Ordering::SeqCst), 1);
        assert!(envelope.no_ack());
    }
}
