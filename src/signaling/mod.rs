//! Signaling with the SFU server
//!
//! [`protocol`] defines the closed set of wire messages, [`SignalingChannel`]
//! the request/response + push-event seam the session talks to, and
//! [`WsSignalingChannel`] its WebSocket implementation.

pub mod channel;
#[cfg(test)]
pub mod fake;
pub mod protocol;
pub mod websocket;

use serde::de::DeserializeOwned;

pub use channel::{ChannelEvent, ChannelState, Connection, Credentials, SignalingChannel};
pub use protocol::{Notification, Request, ServerEvent};
pub use websocket::WsSignalingChannel;

use crate::error::{AppError, Result};

/// Send a request and decode its response
pub async fn call<T: DeserializeOwned>(
    channel: &dyn SignalingChannel,
    request: Request,
) -> Result<T> {
    let method = request.method();
    let value = channel.request(request).await?;
    serde_json::from_value(value)
        .map_err(|e| AppError::Protocol(format!("Malformed '{}' response: {}", method, e)))
}
