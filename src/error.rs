use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::media::MediaKind;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Signaling connection error: {0}")]
    Connection(String),

    #[error("Signaling request '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("Signaling server rejected '{method}': {reason}")]
    Rejected { method: String, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Router capabilities already loaded")]
    AlreadyLoaded,

    #[error("Transport error [{direction}]: {reason}")]
    Transport { direction: String, reason: String },

    #[error("Media device error [{kind}]: {reason}")]
    MediaDevice { kind: MediaKind, reason: String },

    #[error("Cannot produce {0}: no common codec with the router")]
    CannotProduce(MediaKind),

    #[error("Cannot consume producer {producer_id}: {reason}")]
    CannotConsume { producer_id: String, reason: String },

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Session cancelled")]
    Cancelled,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// How an error is handled by the session orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Signaling unreachable or timed out: enter fallback mode
    Connection,
    /// Capability or transport negotiation failed: fatal to the session
    Negotiation,
    /// A single produce/consume/pause/resume call failed
    Operation,
    /// Camera/microphone unavailable
    MediaDevice,
    /// Target already gone; callers treat this as a no-op
    NotFound,
}

impl AppError {
    /// Classify the error for propagation decisions
    pub fn class(&self) -> ErrorClass {
        match self {
            AppError::Connection(_) | AppError::Timeout { .. } => ErrorClass::Connection,
            AppError::Negotiation(_) | AppError::AlreadyLoaded | AppError::Transport { .. } => {
                ErrorClass::Negotiation
            }
            AppError::MediaDevice { .. } => ErrorClass::MediaDevice,
            AppError::NotFound(_) => ErrorClass::NotFound,
            _ => ErrorClass::Operation,
        }
    }

    pub fn transport(direction: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        AppError::Transport {
            direction: direction.to_string(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Connection => write!(f, "connection"),
            ErrorClass::Negotiation => write!(f, "negotiation"),
            ErrorClass::Operation => write!(f, "operation"),
            ErrorClass::MediaDevice => write!(f, "media_device"),
            ErrorClass::NotFound => write!(f, "not_found"),
        }
    }
}

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(
            AppError::Connection("refused".into()).class(),
            ErrorClass::Connection
        );
        assert_eq!(
            AppError::Timeout {
                method: "joinRoom".into(),
                timeout_ms: 10
            }
            .class(),
            ErrorClass::Connection
        );
        assert_eq!(AppError::AlreadyLoaded.class(), ErrorClass::Negotiation);
        assert_eq!(
            AppError::transport("send", "dtls failed").class(),
            ErrorClass::Negotiation
        );
        assert_eq!(
            AppError::MediaDevice {
                kind: MediaKind::Video,
                reason: "denied".into()
            }
            .class(),
            ErrorClass::MediaDevice
        );
        assert_eq!(
            AppError::Rejected {
                method: "produce".into(),
                reason: "no".into()
            }
            .class(),
            ErrorClass::Operation
        );
        assert_eq!(
            AppError::CannotProduce(MediaKind::Screen).class(),
            ErrorClass::Operation
        );
        assert_eq!(AppError::NotFound("x".into()).class(), ErrorClass::NotFound);
    }
}
