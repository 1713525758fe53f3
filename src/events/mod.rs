//! Event bus for pipeline state notifications
//!
//! Components publish [`SystemEvent`]s; the binary (or an embedding
//! application) subscribes to surface them.

pub mod types;

pub use types::SystemEvent;

use tokio::sync::broadcast;
use tracing::trace;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Broadcast event bus
///
/// Cloning yields another handle onto the same channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SystemEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    ///
    /// Events published with no subscriber are dropped.
    pub fn publish(&self, event: SystemEvent) {
        trace!("event {}", event.event_name());
        let _ = self.tx.send(event);
    }

    /// Subscribe to all future events
    ///
    /// A subscriber that falls more than the channel capacity behind gets
    /// `Lagged` and misses events.
    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.tx.subscribe()
    }

    /// Subscribe to events matching `topic` (see [`SystemEvent::matches_topic`])
    pub fn subscribe_topic(&self, topic: impl Into<String>) -> TopicReceiver {
        TopicReceiver {
            rx: self.tx.subscribe(),
            topic: topic.into(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver that skips events outside its topic
pub struct TopicReceiver {
    rx: broadcast::Receiver<SystemEvent>,
    topic: String,
}

impl TopicReceiver {
    /// Next matching event; `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<SystemEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.matches_topic(&self.topic) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    trace!("topic {} lagged by {} events", self.topic, n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
