use crate::error::Error;

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;

/// Callback invoked for every fault reported on an error channel.
pub type ErrorObserver = dyn Fn(&Error) + Send + Sync;

struct Entry<H: ?Sized> {
    handler: Arc<H>,
    once: bool,
}

/// Ordered list of observers for one event kind.
pub struct Observers<H: ?Sized> {
    entries: Mutex<Vec<Entry<H>>>,
}

impl<H: ?Sized> Default for Observers<H> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<H: ?Sized> Observers<H> {
    pub fn add(&self, handler: Arc<H>, once: bool) {
        self.entries.lock().push(Entry { handler, once });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Handlers to invoke for one event, in registration order. `once`
    /// handlers are removed as they are handed out.
    pub fn take_snapshot(&self) -> Vec<Arc<H>> {
        let mut entries = self.entries.lock();
        let snapshot = entries.iter().map(|entry| entry.handler.clone()).collect();
        entries.retain(|entry| !entry.once);
        snapshot
    }
}

impl Observers<ErrorObserver> {
    /// Reports a fault to every error observer, or logs it if there are none.
    pub fn emit(&self, fault: &Error) {
        let observers = self.take_snapshot();

        if observers.is_empty() {
            error!(error = %fault, kind = ?fault.kind(), "unobserved fault");
            return;
        }

        for observer in observers {
            observer(fault);
        }
    }
}
