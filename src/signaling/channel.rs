//! Signaling channel abstraction

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use super::protocol::{ConnectionAck, Notification, Request, ServerEvent};
use crate::error::Result;

/// Identity presented when opening the channel
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// Bearer token for the signaling server
    pub token: Option<String>,
    pub peer_id: String,
    pub display_name: String,
    pub role: String,
}

/// Everything the channel reports besides request responses
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Server push
    Server(ServerEvent),
    /// Connection lost, retrying
    Reconnecting { attempt: u32, max: u32 },
    /// Connection restored after a loss
    Reconnected,
    /// Connection lost for good
    Closed { reason: String },
}

/// Channel connection state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "attempt", rename_all = "snake_case")]
pub enum ChannelState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting(u32),
    Failed,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelState::Disconnected => write!(f, "disconnected"),
            ChannelState::Connecting => write!(f, "connecting"),
            ChannelState::Connected => write!(f, "connected"),
            ChannelState::Reconnecting(attempt) => write!(f, "reconnecting (attempt {})", attempt),
            ChannelState::Failed => write!(f, "failed"),
        }
    }
}

/// An established connection
#[derive(Debug)]
pub struct Connection {
    /// Server acknowledgement of the `connect` handshake
    pub ack: ConnectionAck,
    /// Pushed events, in arrival order; ends when the channel is disconnected
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// Request/response transport to the signaling server
///
/// Every `request` resolves exactly once: with the server's response, a
/// rejection, a timeout, or a connection error when the link drops while
/// the call is in flight. Events are delivered independently of requests.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Open the connection and complete the `connect` handshake
    async fn connect(&self, credentials: &Credentials) -> Result<Connection>;

    /// Send a correlated request and wait for its response
    async fn request(&self, request: Request) -> Result<serde_json::Value>;

    /// Send a fire-and-forget message
    async fn notify(&self, notification: Notification) -> Result<()>;

    /// Close the connection; idempotent
    async fn disconnect(&self);

    fn state(&self) -> ChannelState;

    fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }
}
