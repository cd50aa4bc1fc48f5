//! Fan-out of stream increments to whoever is rendering them.

use tokio::sync::broadcast;
use tracing::debug;

use pal_core::ids::RequestId;
use pal_core::stream::StreamIncrement;

const DEFAULT_CAPACITY: usize = 1024;

/// Fire-and-forget publisher. Having nobody listening is normal.
#[derive(Clone, Debug)]
pub struct IncrementBroadcaster {
    tx: broadcast::Sender<StreamIncrement>,
}

impl Default for IncrementBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl IncrementBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, increment: StreamIncrement) {
        let request_id = increment.request_id.clone();
        let done = increment.done;
        if self.tx.send(increment).is_err() {
            debug!(%request_id, done, "no receivers for stream increment");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamIncrement> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Consumer-side filter: only increments for the request currently on screen
/// get through. Late increments from a superseded or cancelled request are
/// dropped here.
#[derive(Clone, Debug, Default)]
pub struct StreamView {
    current: Option<RequestId>,
}

impl StreamView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start rendering `request_id`, abandoning whatever was shown before.
    pub fn track(&mut self, request_id: RequestId) {
        self.current = Some(request_id);
    }

    pub fn current(&self) -> Option<&RequestId> {
        self.current.as_ref()
    }

    pub fn clear(&mut self) {
        self.current = None;
    }

    /// `Some` if the increment belongs to the tracked request. A terminal
    /// increment stops tracking.
    pub fn accept(&mut self, increment: StreamIncrement) -> Option<StreamIncrement> {
        if self.current.as_ref() != Some(&increment.request_id) {
            return None;
        }
        if increment.done {
            self.current = None;
        }
        Some(increment)
    }
}
