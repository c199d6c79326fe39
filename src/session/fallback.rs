//! Fallback mode
//!
//! When the signaling server cannot be reached the session still presents a
//! room: a few media-less placeholder participants and a warning that stays
//! visible until the user leaves.

use crate::error::AppError;
use crate::rtc::Peer;

const PLACEHOLDER_ROLE: &str = "student";

/// Warning shown while degraded
pub fn degraded_warning(cause: &AppError) -> String {
    format!(
        "Signaling server unavailable ({}); showing offline placeholders, no audio or video",
        cause
    )
}

/// Media-less stand-ins for the room roster
pub fn placeholder_peers(count: u32) -> Vec<Peer> {
    (1..=count.max(1))
        .map(|n| {
            Peer::placeholder(
                format!("placeholder-{}", n),
                format!("Participant {}", n),
                PLACEHOLDER_ROLE,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders_have_no_media() {
        let peers = placeholder_peers(3);
        assert_eq!(peers.len(), 3);
        assert_eq!(peers[0].id(), "placeholder-1");
        assert_eq!(peers[2].name(), "Participant 3");
        assert!(peers.iter().all(|p| p.is_placeholder() && p.consumers().is_empty()));
    }

    #[test]
    fn test_at_least_one_placeholder() {
        assert_eq!(placeholder_peers(0).len(), 1);
    }

    #[test]
    fn test_warning_names_cause() {
        let warning = degraded_warning(&AppError::Connection("refused".into()));
        assert!(warning.contains("refused"));
    }
}
