use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::RemoteError;

/// The one place background failures land.
///
/// Holds the latest passive error message (the UI's banner text). Observers
/// can read it or subscribe to changes. Cloning shares the same sink.
#[derive(Clone)]
pub struct ErrorSink {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl ErrorSink {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Record a swallowed remote failure. Unreportable errors are only logged.
    pub fn record(&self, context: &str, err: &RemoteError) {
        if !err.is_reportable() {
            debug!(context, "remote skipped: {err}");
            return;
        }
        warn!(context, "remote failure: {err}");
        self.tx.send_replace(Some(format!("{context}: {err}")));
    }

    pub fn record_message(&self, message: impl Into<String>) {
        let message = message.into();
        warn!("{message}");
        self.tx.send_replace(Some(message));
    }

    #[must_use]
    pub fn current(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.tx.subscribe()
    }

    pub fn clear(&self) {
        self.tx.send_replace(None);
    }
}

impl Default for ErrorSink {
    fn default() -> Self {
        Self::new()
    }
}
