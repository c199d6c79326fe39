//! Session event types
//!
//! Defines all event types that can be broadcast through the event bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorClass;
use crate::media::MediaKind;
use crate::session::SessionState;

/// Session event
///
/// # Serialization
///
/// ```json
/// {
///   "event": "consumer.new",
///   "data": { "peer_id": "p-42", "consumer_id": "c-1", "producer_id": "prod-9", "kind": "video" }
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SessionEvent {
    // ============================================================================
    // Session lifecycle
    // ============================================================================
    /// Orchestrator state changed
    #[serde(rename = "session.state_changed")]
    StateChanged {
        from: SessionState,
        to: SessionState,
    },

    /// Session continues without signaling; peers shown are placeholders
    #[serde(rename = "session.degraded")]
    Degraded {
        /// User-facing warning
        warning: String,
    },

    /// A session-level error was reported
    #[serde(rename = "session.error")]
    Error { class: ErrorClass, message: String },

    // ============================================================================
    // Peers and consumers
    // ============================================================================
    #[serde(rename = "peer.joined")]
    PeerJoined {
        peer_id: String,
        name: String,
        role: String,
    },

    #[serde(rename = "peer.left")]
    PeerLeft { peer_id: String },

    /// A consumer became visible under its peer
    #[serde(rename = "consumer.new")]
    NewConsumer {
        peer_id: String,
        consumer_id: String,
        producer_id: String,
        kind: MediaKind,
    },

    #[serde(rename = "consumer.closed")]
    ConsumerClosed {
        peer_id: String,
        consumer_id: String,
    },

    /// Remote producer paused
    #[serde(rename = "consumer.paused")]
    ConsumerPaused {
        peer_id: String,
        consumer_id: String,
    },

    #[serde(rename = "consumer.resumed")]
    ConsumerResumed {
        peer_id: String,
        consumer_id: String,
    },

    // ============================================================================
    // Local producers
    // ============================================================================
    #[serde(rename = "producer.created")]
    ProducerCreated { producer_id: String, kind: MediaKind },

    #[serde(rename = "producer.closed")]
    ProducerClosed { producer_id: String, kind: MediaKind },

    #[serde(rename = "producer.paused")]
    ProducerPaused { kind: MediaKind },

    #[serde(rename = "producer.resumed")]
    ProducerResumed { kind: MediaKind },

    /// Camera/microphone/screen could not be opened; not retried
    #[serde(rename = "media.device_error")]
    MediaDeviceError { kind: MediaKind, message: String },

    // ============================================================================
    // Misc
    // ============================================================================
    #[serde(rename = "chat.message")]
    ChatMessage {
        peer_id: Option<String>,
        sender: String,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Signaling connection lost, retrying
    #[serde(rename = "signaling.reconnecting")]
    SignalingReconnecting { attempt: u32, max_attempts: u32 },
}

impl SessionEvent {
    /// Get the event name (for filtering/routing)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "session.state_changed",
            Self::Degraded { .. } => "session.degraded",
            Self::Error { .. } => "session.error",
            Self::PeerJoined { .. } => "peer.joined",
            Self::PeerLeft { .. } => "peer.left",
            Self::NewConsumer { .. } => "consumer.new",
            Self::ConsumerClosed { .. } => "consumer.closed",
            Self::ConsumerPaused { .. } => "consumer.paused",
            Self::ConsumerResumed { .. } => "consumer.resumed",
            Self::ProducerCreated { .. } => "producer.created",
            Self::ProducerClosed { .. } => "producer.closed",
            Self::ProducerPaused { .. } => "producer.paused",
            Self::ProducerResumed { .. } => "producer.resumed",
            Self::MediaDeviceError { .. } => "media.device_error",
            Self::ChatMessage { .. } => "chat.message",
            Self::SignalingReconnecting { .. } => "signaling.reconnecting",
        }
    }

    /// Check if event name matches a topic pattern
    ///
    /// Supports wildcards:
    /// - `*` matches all events
    /// - `consumer.*` matches all consumer events
    /// - `consumer.new` matches exact event
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic == "*" {
            return true;
        }

        let event_name = self.event_name();

        if topic.ends_with(".*") {
            let prefix = topic.trim_end_matches(".*");
            event_name
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.'))
        } else {
            event_name == topic
        }
    }
}
