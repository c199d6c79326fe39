//! Media stack without real media
//!
//! Produces well-formed negotiation parameters and silent tracks. Used by the
//! headless CLI, by fallback mode and by tests, which can also inject
//! device denials and transport failures.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::watch;
use tracing::debug;

use super::{
    LinkState, LocalTrack, MediaBackend, MediaDevices, MediaKind, RemoteTrack, TransportLink,
    TransportOptions, WireKind,
};
use crate::error::{AppError, Result};
use crate::signaling::protocol::{
    DtlsFingerprint, DtlsParameters, RtpCapabilities, RtpCodecCapability, RtpParameters,
};

/// Synthetic media devices and backend
#[derive(Default)]
pub struct SyntheticMedia {
    denied: Mutex<HashSet<MediaKind>>,
    links: Mutex<HashMap<String, watch::Sender<LinkState>>>,
    opened: Mutex<Vec<LocalTrack>>,
    sending: Mutex<HashMap<String, String>>,
    received: Mutex<Vec<RemoteTrack>>,
}

impl SyntheticMedia {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `open` for `kind` fail like a denied permission
    pub fn deny(&self, kind: MediaKind) {
        self.denied.lock().insert(kind);
    }

    /// Most recently opened track of a kind
    pub fn last_track(&self, kind: MediaKind) -> Option<LocalTrack> {
        self.opened
            .lock()
            .iter()
            .rev()
            .find(|t| t.kind() == kind)
            .cloned()
    }

    /// Report a connectivity failure on a transport
    pub fn fail_transport(&self, transport_id: &str) -> bool {
        match self.links.lock().get(transport_id) {
            Some(tx) => {
                tx.send_replace(LinkState::Failed);
                true
            }
            None => false,
        }
    }

    /// Received tracks not yet closed by their consumer
    pub fn live_remote_tracks(&self) -> usize {
        self.received.lock().iter().filter(|t| !t.is_closed()).count()
    }

    /// Number of tracks currently attached to send transports
    pub fn sending_count(&self) -> usize {
        self.sending.lock().len()
    }

    fn codec_for(kind: MediaKind) -> serde_json::Value {
        match kind.wire_kind() {
            WireKind::Audio => json!({
                "mimeType": "audio/opus",
                "payloadType": 100,
                "clockRate": 48000,
                "channels": 2
            }),
            WireKind::Video => json!({
                "mimeType": "video/VP8",
                "payloadType": 101,
                "clockRate": 90000
            }),
        }
    }
}

#[async_trait]
impl MediaDevices for SyntheticMedia {
    async fn open(&self, kind: MediaKind) -> Result<LocalTrack> {
        if self.denied.lock().contains(&kind) {
            return Err(AppError::MediaDevice {
                kind,
                reason: "permission denied".into(),
            });
        }
        let label = match kind {
            MediaKind::Audio => "synthetic microphone",
            MediaKind::Video => "synthetic camera",
            MediaKind::Screen => "synthetic screen",
        };
        let track = LocalTrack::new(kind, label);
        self.opened.lock().push(track.clone());
        Ok(track)
    }
}

#[async_trait]
impl MediaBackend for SyntheticMedia {
    fn native_capabilities(&self) -> RtpCapabilities {
        RtpCapabilities {
            codecs: vec![
                RtpCodecCapability::new(WireKind::Audio, "audio/opus", 48000).with_channels(2),
                RtpCodecCapability::new(WireKind::Video, "video/VP8", 90000),
                RtpCodecCapability::new(WireKind::Video, "video/H264", 90000),
            ],
            header_extensions: Vec::new(),
        }
    }

    async fn open_transport(&self, options: TransportOptions) -> Result<TransportLink> {
        let (tx, rx) = watch::channel(LinkState::Connected);
        self.links.lock().insert(options.id.clone(), tx);
        debug!(
            "Synthetic {} transport {} opened ({} ICE servers)",
            options.direction,
            options.id,
            options.ice_servers.len()
        );
        Ok(TransportLink {
            local_dtls: DtlsParameters {
                role: Some("auto".into()),
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".into(),
                    value: uuid::Uuid::new_v4().simple().to_string().to_uppercase(),
                }],
            },
            state: rx,
        })
    }

    async fn send_track(&self, transport_id: &str, track: &LocalTrack) -> Result<RtpParameters> {
        if !self.links.lock().contains_key(transport_id) {
            return Err(AppError::transport("send", format!("unknown transport {}", transport_id)));
        }
        self.sending
            .lock()
            .insert(track.id().to_string(), transport_id.to_string());
        Ok(RtpParameters(json!({
            "mid": track.id(),
            "codecs": [Self::codec_for(track.kind())],
            "encodings": [{ "ssrc": derive_ssrc(track.id()) }]
        })))
    }

    async fn stop_sending(&self, _transport_id: &str, track_id: &str) {
        self.sending.lock().remove(track_id);
    }

    async fn receive_track(
        &self,
        transport_id: &str,
        consumer_id: &str,
        kind: MediaKind,
        _rtp_parameters: &RtpParameters,
    ) -> Result<RemoteTrack> {
        if !self.links.lock().contains_key(transport_id) {
            return Err(AppError::transport("recv", format!("unknown transport {}", transport_id)));
        }
        let track = RemoteTrack::new(consumer_id, kind);
        self.received.lock().push(track.clone());
        Ok(track)
    }

    async fn close_transport(&self, transport_id: &str) {
        if let Some(tx) = self.links.lock().remove(transport_id) {
            tx.send_replace(LinkState::Closed);
        }
        let mut sending = self.sending.lock();
        sending.retain(|_, t| t != transport_id);
    }
}

/// Stable pseudo SSRC derived from the track id
fn derive_ssrc(track_id: &str) -> u32 {
    track_id
        .bytes()
        .fold(2166136261u32, |h, b| (h ^ b as u32).wrapping_mul(16777619))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtc::TransportDirection;
    use crate::signaling::protocol::IceParameters;

    fn options(id: &str) -> TransportOptions {
        TransportOptions {
            id: id.to_string(),
            direction: TransportDirection::Send,
            ice_parameters: IceParameters {
                username_fragment: "u".into(),
                password: "p".into(),
                ice_lite: true,
            },
            ice_candidates: vec![],
            dtls_parameters: DtlsParameters {
                role: None,
                fingerprints: vec![],
            },
            ice_servers: vec![],
        }
    }

    #[tokio::test]
    async fn test_denied_device() {
        let media = SyntheticMedia::new();
        media.deny(MediaKind::Video);
        let err = media.open(MediaKind::Video).await.unwrap_err();
        assert!(matches!(err, AppError::MediaDevice { kind: MediaKind::Video, .. }));
        assert!(media.open(MediaKind::Audio).await.is_ok());
    }

    #[tokio::test]
    async fn test_transport_failure_is_observable() {
        let media = SyntheticMedia::new();
        let link = media.open_transport(options("t1")).await.unwrap();
        assert_eq!(*link.state.borrow(), LinkState::Connected);
        assert!(media.fail_transport("t1"));
        assert_eq!(*link.state.borrow(), LinkState::Failed);
        assert!(!media.fail_transport("missing"));
    }

    #[tokio::test]
    async fn test_send_requires_open_transport() {
        let media = SyntheticMedia::new();
        let track = media.open(MediaKind::Audio).await.unwrap();
        assert!(media.send_track("t1", &track).await.is_err());

        media.open_transport(options("t1")).await.unwrap();
        let params = media.send_track("t1", &track).await.unwrap();
        assert_eq!(params.mime_types(), vec!["audio/opus"]);
        assert_eq!(media.sending_count(), 1);

        media.close_transport("t1").await;
        assert_eq!(media.sending_count(), 0);
    }
}
