//! Session state machine
//!
//! ```text
//! idle ─> connecting ─> negotiating ─> joining ─> active ─> leaving ─> idle
//!            │              │             │          │          ^
//!            ├──────────────┴─> degraded <┼──────────┘          │
//!            │                     └──────┼─────────────────────┤
//!            └──────────────────────> failed ───────────────────┘
//! ```
//!
//! `degraded` is reached when signaling is unreachable (fallback mode) and
//! `failed` after a fatal negotiation or transport error. Both require a
//! leave (or a new join from `failed`) to continue. `active` goes back to
//! `connecting` when a restored signaling connection forces a rejoin.

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Orchestrator state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    NegotiatingCapabilities,
    JoiningRoom,
    Active,
    Leaving,
    /// Running without signaling, placeholder peers only
    Degraded,
    /// Torn down after a fatal error
    Failed,
}

impl SessionState {
    /// Allowed transitions
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Failed, Connecting)
                | (Connecting, NegotiatingCapabilities)
                | (Connecting, Degraded)
                | (Connecting, Leaving)
                | (Connecting, Failed)
                | (NegotiatingCapabilities, JoiningRoom)
                | (NegotiatingCapabilities, Degraded)
                | (NegotiatingCapabilities, Leaving)
                | (NegotiatingCapabilities, Failed)
                | (JoiningRoom, Active)
                | (JoiningRoom, Leaving)
                | (JoiningRoom, Failed)
                | (Active, Leaving)
                | (Active, Failed)
                | (Active, Degraded)
                | (Active, Connecting)
                | (Degraded, Leaving)
                | (Failed, Leaving)
                | (Leaving, Idle)
        )
    }

    /// Validate a transition
    pub fn transition(self, next: SessionState) -> Result<SessionState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(AppError::InvalidState(format!(
                "cannot go from {} to {}",
                self, next
            )))
        }
    }

    /// Whether a new join may start from here
    pub fn can_join(self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Failed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::NegotiatingCapabilities => write!(f, "negotiating-capabilities"),
            SessionState::JoiningRoom => write!(f, "joining-room"),
            SessionState::Active => write!(f, "active"),
            SessionState::Leaving => write!(f, "leaving"),
            SessionState::Degraded => write!(f, "degraded"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}
