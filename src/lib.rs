//! liveclass - live classroom media session client
//!
//! Joins a room on an SFU-style signaling server, negotiates capabilities,
//! publishes local camera/microphone/screen sources and consumes the media of
//! the other participants. When signaling is unreachable the session keeps
//! running in a degraded mode with placeholder participants.

pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod rtc;
pub mod session;
pub mod signaling;

pub use error::{AppError, Result};
