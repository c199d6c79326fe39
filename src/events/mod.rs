//! Session event bus
//!
//! The session task publishes every state, peer, consumer and producer change
//! here. Subscribers either take the whole stream or narrow it to a dotted
//! topic such as `consumer.*` (see [`SessionEvent::matches_topic`]).

pub mod types;

pub use types::SessionEvent;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Events buffered per subscriber before it starts lagging
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Broadcast bus shared by a session and its observers
///
/// # Example
///
/// ```no_run
/// use liveclass::events::EventBus;
///
/// # async fn watch(bus: EventBus) {
/// let mut consumers = bus.subscribe_topic("consumer.*");
/// while let Ok(event) = consumers.recv().await {
///     println!("{}: {:?}", event.event_name(), event);
/// }
/// # }
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Events published with no subscribers are dropped
    pub fn publish(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to every event
    ///
    /// A subscriber that falls more than the channel capacity behind
    /// receives `Lagged` and misses the overwritten events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Subscribe to the events matching `topic`
    pub fn subscribe_topic(&self, topic: impl Into<String>) -> TopicSubscriber {
        TopicSubscriber {
            topic: topic.into(),
            rx: self.tx.subscribe(),
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
pub struct TopicSubscriber {
    topic: String,
    rx: broadcast::Receiver<SessionEvent>,
}

impl TopicSubscriber {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next matching event; lag is reported like a plain receiver
    pub async fn recv(&mut self) -> Result<SessionEvent, RecvError> {
        loop {
            let event = self.rx.recv().await?;
            if event.matches_topic(&self.topic) {
                return Ok(event);
            }
        }
    }
}
