use serde::{Deserialize, Serialize};
use typeshare::typeshare;

use crate::error::{AppError, Result};
use crate::rtc::IceServer;

/// Main client configuration
#[typeshare]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Who joins the room
    pub identity: IdentityConfig,
    /// Signaling server connection
    pub signaling: SignalingConfig,
    /// STUN/TURN servers
    pub ice: IceConfig,
    /// Local media published on join
    pub media: MediaConfig,
    /// Behaviour when the signaling server is unreachable
    pub fallback: FallbackConfig,
}

impl AppConfig {
    /// Check values the session relies on
    pub fn validate(&self) -> Result<()> {
        let url = self.signaling.url.trim();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(AppError::Config(format!(
                "signaling.url must be a ws:// or wss:// URL, got '{}'",
                self.signaling.url
            )));
        }
        if self.signaling.connect_timeout_ms == 0 || self.signaling.request_timeout_ms == 0 {
            return Err(AppError::Config("signaling timeouts must be positive".into()));
        }
        if self.ice.request_timeout_ms == 0 {
            return Err(AppError::Config("ice.request_timeout_ms must be positive".into()));
        }
        if self.identity.display_name.trim().is_empty() {
            return Err(AppError::Config("identity.display_name must not be empty".into()));
        }
        if self.fallback.enabled && self.fallback.placeholder_peers == 0 {
            return Err(AppError::Config(
                "fallback.placeholder_peers must be at least 1 when fallback is enabled".into(),
            ));
        }
        Ok(())
    }
}

/// Local participant identity
#[typeshare]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Preassigned peer id; a random one is generated when unset
    pub peer_id: Option<String>,
    /// Name shown to other participants
    pub display_name: String,
    /// Room role (teacher, student, ...)
    pub role: String,
    /// Bearer token for signaling and TURN credentials
    pub token: Option<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            peer_id: None,
            display_name: "Guest".to_string(),
            role: "student".to_string(),
            token: None,
        }
    }
}

/// Signaling connection settings
#[typeshare]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// WebSocket URL of the signaling server
    pub url: String,
    /// Socket open and handshake timeout
    pub connect_timeout_ms: u32,
    /// Per-request response timeout
    pub request_timeout_ms: u32,
    /// Reconnect attempts after a lost connection
    pub reconnect_attempts: u32,
    /// Fixed delay between reconnect attempts
    pub reconnect_delay_ms: u32,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3016/signaling".to_string(),
            connect_timeout_ms: 5000,
            request_timeout_ms: 10000,
            reconnect_attempts: 5,
            reconnect_delay_ms: 2000,
        }
    }
}

/// ICE server configuration
#[typeshare]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    /// REST endpoint issuing TURN credentials for the bearer token
    pub credentials_url: Option<String>,
    /// Credential request timeout
    pub request_timeout_ms: u32,
    /// STUN servers used when no credentials endpoint answers
    pub stun_servers: Vec<String>,
    /// Static TURN servers used when no credentials endpoint answers
    #[typeshare(skip)]
    pub turn_servers: Vec<IceServer>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            credentials_url: None,
            request_timeout_ms: 5000,
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
        }
    }
}

/// Media published automatically after joining
#[typeshare]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Publish the microphone
    pub publish_audio: bool,
    /// Publish the camera
    pub publish_video: bool,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            publish_audio: true,
            publish_video: true,
        }
    }
}

/// Fallback mode settings
#[typeshare]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Enter a degraded session instead of failing when signaling is unreachable
    pub enabled: bool,
    /// Number of media-less placeholder participants shown in degraded mode
    pub placeholder_peers: u32,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            placeholder_peers: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [identity]
            display_name = "Ms. Rivera"
            role = "teacher"

            [signaling]
            url = "wss://sfu.example.com/ws"

            [[ice.turn_servers]]
            urls = "turn:turn.example.com:3478"
            username = "u"
            credential = "c"
            "#,
        )
        .unwrap();
        assert_eq!(config.identity.role, "teacher");
        assert_eq!(config.signaling.request_timeout_ms, 10000);
        assert_eq!(config.ice.turn_servers.len(), 1);
        assert!(config.ice.turn_servers[0].is_turn());
        assert!(config.media.publish_video);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.signaling.url = "http://example.com".into();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.signaling.request_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.fallback.placeholder_peers = 0;
        assert!(config.validate().is_err());
        config.fallback.enabled = false;
        config.validate().unwrap();
    }
}
