//! ICE server resolution
//!
//! TURN credentials are issued by an external REST endpoint for the user's
//! bearer token. When the endpoint is not configured or fails, the static
//! STUN/TURN list from the configuration is used instead.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

use crate::config::IceConfig;
use crate::error::{AppError, Result};

/// STUN or TURN server entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs (e.g. ["turn:turn.example.com:3478?transport=udp", "turn:turn.example.com:3478?transport=tcp"])
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn is_turn(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IceServersResponse {
    #[serde(default)]
    ice_servers: Vec<IceServer>,
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

/// Client for the TURN credential endpoint
pub struct IceServerClient {
    client: reqwest::Client,
    credentials_url: Option<String>,
    fallback: Vec<IceServer>,
}

impl IceServerClient {
    pub fn new(config: &IceConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms as u64))
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build ICE credential client, using defaults: {}", e);
                reqwest::Client::new()
            });

        let mut fallback: Vec<IceServer> = config
            .stun_servers
            .iter()
            .map(|url| IceServer::stun(url.clone()))
            .collect();
        fallback.extend(config.turn_servers.iter().cloned());

        Self {
            client,
            credentials_url: config
                .credentials_url
                .clone()
                .filter(|url| !url.trim().is_empty()),
            fallback,
        }
    }

    /// Fetch ICE servers from the credential endpoint
    pub async fn fetch(&self, token: Option<&str>) -> Result<Vec<IceServer>> {
        let url = self
            .credentials_url
            .as_deref()
            .ok_or_else(|| AppError::Config("ICE credentials endpoint not configured".into()))?;

        let mut request = self.client.get(url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?.error_for_status()?;
        let body: IceServersResponse = response.json().await?;
        debug!(
            "Fetched {} ICE servers ({} TURN)",
            body.ice_servers.len(),
            body.ice_servers.iter().filter(|s| s.is_turn()).count()
        );
        Ok(body.ice_servers)
    }

    /// Fetched servers, or the configured list when fetching is not possible
    pub async fn resolve(&self, token: Option<&str>) -> Vec<IceServer> {
        if self.credentials_url.is_none() {
            return self.fallback.clone();
        }
        match self.fetch(token).await {
            Ok(servers) if !servers.is_empty() => servers,
            Ok(_) => {
                warn!("ICE credential endpoint returned no servers, using configured list");
                self.fallback.clone()
            }
            Err(e) => {
                warn!("Failed to fetch ICE servers, using configured list: {}", e);
                self.fallback.clone()
            }
        }
    }
}
