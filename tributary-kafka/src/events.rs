//! Pool events for host observers.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::trace;

use crate::reporting::ConsumeErrorRecord;

/// Capacity of the event channel. Slow receivers lose the oldest events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events published by the pool.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// Every configured cluster is connected; subscriptions may be made.
    TopicsReady {
        /// Number of registered clusters.
        clusters: usize,
    },
    /// A callback failed while handling a message.
    ConsumeError(Arc<ConsumeErrorRecord>),
}

/// Broadcast channel for [`PoolEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PoolEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates a bus with no receivers.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publishes an event. Events with no receiver are dropped.
    pub fn emit(&self, event: PoolEvent) {
        if let Err(broadcast::error::SendError(event)) = self.sender.send(event) {
            trace!(?event, "no event receivers");
        }
    }

    /// Registers a receiver for events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.sender.subscribe()
    }

    /// Number of live receivers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
