use crate::Record;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use bytes::Bytes;
use proven_pubsub::{BoxError, BrokerMessage};

/// A message delivered by a [`MemoryConnection`](crate::MemoryConnection).
#[derive(Clone, Debug)]
pub struct MemoryMessage {
    record: Arc<Record>,
    subject: String,
}

impl MemoryMessage {
    pub(crate) const fn new(subject: String, record: Arc<Record>) -> Self {
        Self { record, subject }
    }
}

#[async_trait]
impl BrokerMessage for MemoryMessage {
    fn subject(&self) -> &str {
        &self.subject
    }

    fn payload(&self) -> &Bytes {
        &self.record.payload
    }

    fn sequence(&self) -> Option<u64> {
        Some(self.record.seq)
    }

    async fn ack(&self) -> Result<(), BoxError> {
        self.record.acks.fetch_add(1, Ordering::SeqCst);

        Ok(())
    }
}
