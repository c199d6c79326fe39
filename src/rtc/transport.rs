//! Send/receive transports
//!
//! Each transport mirrors a server-side WebRTC transport. Its state machine:
//!
//! ```text
//! new ──connect intent──> connecting ──server ack──> connected
//!  │                          │                          │
//!  └──────────────────────────┴──────> failed | closed <─┘
//! ```
//!
//! The local DTLS parameters are sent with `connectTransport` on first use;
//! produce/consume wait for the acknowledgement and fail when it is refused.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::consumer::Consumer;
use super::ice::IceServer;
use super::producer::Producer;
use crate::error::{AppError, Result};
use crate::media::{LinkState, LocalTrack, MediaBackend, TransportOptions};
use crate::signaling::protocol::{
    ConsumeResponse, DtlsParameters, ProduceResponse, ProducerAnnouncement, Request,
    RtpCapabilities, TransportParams,
};
use crate::signaling::{call, SignalingChannel};

/// Transport direction; named after the server-side role on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportDirection {
    #[serde(rename = "producer")]
    Send,
    #[serde(rename = "consumer")]
    Recv,
}

impl std::fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportDirection::Send => write!(f, "send"),
            TransportDirection::Recv => write!(f, "recv"),
        }
    }
}

/// Transport connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportState::New => write!(f, "new"),
            TransportState::Connecting => write!(f, "connecting"),
            TransportState::Connected => write!(f, "connected"),
            TransportState::Failed => write!(f, "failed"),
            TransportState::Closed => write!(f, "closed"),
        }
    }
}

/// One negotiated unidirectional media transport
pub struct Transport {
    id: String,
    direction: TransportDirection,
    state: TransportState,
    local_dtls: DtlsParameters,
    link_state: watch::Receiver<LinkState>,
}

impl Transport {
    /// Create the server-side transport and its local half
    pub async fn create(
        channel: &dyn SignalingChannel,
        backend: &Arc<dyn MediaBackend>,
        room_id: &str,
        direction: TransportDirection,
        ice_servers: Vec<IceServer>,
    ) -> Result<Self> {
        let params: TransportParams = call(
            channel,
            Request::CreateWebRtcTransport {
                room_id: room_id.to_string(),
                direction,
            },
        )
        .await
        .map_err(|e| AppError::transport(direction, format!("create failed: {}", e)))?;

        let link = backend
            .open_transport(TransportOptions {
                id: params.id.clone(),
                direction,
                ice_parameters: params.ice_parameters,
                ice_candidates: params.ice_candidates,
                dtls_parameters: params.dtls_parameters,
                ice_servers,
            })
            .await?;

        info!("{} transport created: {}", direction, params.id);

        Ok(Self {
            id: params.id,
            direction,
            state: TransportState::New,
            local_dtls: link.local_dtls,
            link_state: link.state,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn direction(&self) -> TransportDirection {
        self.direction
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    /// Subscribe to connectivity updates from the media stack
    pub fn link_watch(&self) -> watch::Receiver<LinkState> {
        self.link_state.clone()
    }

    /// Run the connect handshake if it has not happened yet
    pub async fn ensure_connected(
        &mut self,
        channel: &dyn SignalingChannel,
        room_id: &str,
    ) -> Result<()> {
        match self.state {
            TransportState::Connected => return Ok(()),
            TransportState::New => {}
            TransportState::Connecting => {
                return Err(AppError::transport(
                    self.direction,
                    "connect already in progress",
                ))
            }
            TransportState::Failed | TransportState::Closed => {
                return Err(AppError::transport(
                    self.direction,
                    format!("transport {} is {}", self.id, self.state),
                ))
            }
        }

        self.state = TransportState::Connecting;
        debug!("Connecting {} transport {}", self.direction, self.id);

        let result = channel
            .request(Request::ConnectTransport {
                room_id: room_id.to_string(),
                transport_id: self.id.clone(),
                dtls_parameters: self.local_dtls.clone(),
                direction: self.direction,
            })
            .await;

        match result {
            Ok(_) => {
                self.state = TransportState::Connected;
                info!("{} transport {} connected", self.direction, self.id);
                Ok(())
            }
            Err(e) => {
                self.state = TransportState::Failed;
                warn!("{} transport {} connect failed: {}", self.direction, self.id, e);
                Err(AppError::transport(
                    self.direction,
                    format!("connect not acknowledged: {}", e),
                ))
            }
        }
    }

    /// Publish a local track; the producer is valid once the server grants an id
    pub async fn produce(
        &mut self,
        channel: &dyn SignalingChannel,
        backend: &Arc<dyn MediaBackend>,
        room_id: &str,
        track: LocalTrack,
    ) -> Result<Producer> {
        if self.direction != TransportDirection::Send {
            return Err(AppError::InvalidState("produce on a receive transport".into()));
        }
        self.ensure_connected(channel, room_id).await?;

        let kind = track.kind();
        let rtp_parameters = backend.send_track(&self.id, &track).await?;

        let granted: Result<ProduceResponse> = call(
            channel,
            Request::Produce {
                room_id: room_id.to_string(),
                transport_id: self.id.clone(),
                kind: kind.wire_kind(),
                rtp_parameters,
                media_type: kind,
            },
        )
        .await;

        match granted {
            Ok(response) => {
                debug!("Producer {} granted for {}", response.id, kind);
                Ok(Producer::new(response.id, kind, track, self.id.clone()))
            }
            Err(e) => {
                backend.stop_sending(&self.id, track.id()).await;
                Err(e)
            }
        }
    }

    /// Create a consumer for a remote producer
    pub async fn consume(
        &mut self,
        channel: &dyn SignalingChannel,
        backend: &Arc<dyn MediaBackend>,
        room_id: &str,
        rtp_capabilities: &RtpCapabilities,
        announcement: &ProducerAnnouncement,
    ) -> Result<Consumer> {
        if self.direction != TransportDirection::Recv {
            return Err(AppError::InvalidState("consume on a send transport".into()));
        }
        self.ensure_connected(channel, room_id).await?;

        let response: ConsumeResponse = call(
            channel,
            Request::Consume {
                room_id: room_id.to_string(),
                producer_id: announcement.producer_id.clone(),
                rtp_capabilities: rtp_capabilities.clone(),
            },
        )
        .await?;

        let params = match response {
            ConsumeResponse::Granted(params) => params,
            ConsumeResponse::Refused { error } => {
                return Err(AppError::CannotConsume {
                    producer_id: announcement.producer_id.clone(),
                    reason: error,
                })
            }
        };

        let kind = announcement.media_type;
        if kind.wire_kind() != params.kind {
            warn!(
                "Consumer {} kind mismatch: announced {}, granted {}",
                params.id, kind, params.kind
            );
        }

        let track = backend
            .receive_track(&self.id, &params.id, kind, &params.rtp_parameters)
            .await?;

        let peer_id = params
            .producer_peer_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| announcement.peer_id.clone());

        Ok(Consumer::new(
            params.id,
            announcement.producer_id.clone(),
            peer_id,
            kind,
            track,
        ))
    }

    /// Close the local half; idempotent
    pub async fn close(&mut self, backend: &Arc<dyn MediaBackend>) {
        if self.state == TransportState::Closed {
            return;
        }
        backend.close_transport(&self.id).await;
        self.state = TransportState::Closed;
        info!("{} transport {} closed", self.direction, self.id);
    }
}

/// The session's send and receive transports
#[derive(Default)]
pub struct TransportPair {
    send: Option<Transport>,
    recv: Option<Transport>,
}

impl TransportPair {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport; a direction can only be filled once per session
    pub fn install(&mut self, transport: Transport) -> Result<()> {
        let slot = match transport.direction() {
            TransportDirection::Send => &mut self.send,
            TransportDirection::Recv => &mut self.recv,
        };
        if slot.is_some() {
            return Err(AppError::InvalidState(format!(
                "{} transport already exists",
                transport.direction()
            )));
        }
        *slot = Some(transport);
        Ok(())
    }

    pub fn get(&self, direction: TransportDirection) -> Option<&Transport> {
        match direction {
            TransportDirection::Send => self.send.as_ref(),
            TransportDirection::Recv => self.recv.as_ref(),
        }
    }

    pub fn get_mut(&mut self, direction: TransportDirection) -> Result<&mut Transport> {
        let slot = match direction {
            TransportDirection::Send => self.send.as_mut(),
            TransportDirection::Recv => self.recv.as_mut(),
        };
        slot.ok_or_else(|| AppError::InvalidState(format!("no {} transport", direction)))
    }

    pub fn state(&self, direction: TransportDirection) -> Option<TransportState> {
        self.get(direction).map(Transport::state)
    }

    /// Close both transports; closed records stay until [`TransportPair::reset`]
    pub async fn close_all(&mut self, backend: &Arc<dyn MediaBackend>) {
        if let Some(transport) = self.send.as_mut() {
            transport.close(backend).await;
        }
        if let Some(transport) = self.recv.as_mut() {
            transport.close(backend).await;
        }
    }

    /// Forget all transports (start of a new session)
    pub fn reset(&mut self) {
        self.send = None;
        self.recv = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaKind, SyntheticMedia};
    use crate::signaling::fake::FakeChannel;
    use crate::signaling::{Credentials, SignalingChannel};

    async fn connected_channel() -> FakeChannel {
        let channel = FakeChannel::sfu();
        channel
            .connect(&Credentials {
                token: None,
                peer_id: "local-1".into(),
                display_name: "Tester".into(),
                role: "student".into(),
            })
            .await
            .unwrap();
        channel
    }

    fn backend() -> (Arc<SyntheticMedia>, Arc<dyn MediaBackend>) {
        let media = Arc::new(SyntheticMedia::new());
        let backend: Arc<dyn MediaBackend> = media.clone();
        (media, backend)
    }

    #[tokio::test]
    async fn test_connect_handshake_runs_once_before_produce() {
        let channel = connected_channel().await;
        let (media, backend) = backend();
        let mut transport =
            Transport::create(&channel, &backend, "R1", TransportDirection::Send, vec![])
                .await
                .unwrap();
        assert_eq!(transport.state(), TransportState::New);

        let track = crate::media::LocalTrack::new(MediaKind::Audio, "mic");
        let producer = transport
            .produce(&channel, &backend, "R1", track.clone())
            .await
            .unwrap();
        assert_eq!(transport.state(), TransportState::Connected);
        assert_eq!(producer.kind(), MediaKind::Audio);

        let track2 = crate::media::LocalTrack::new(MediaKind::Video, "cam");
        transport.produce(&channel, &backend, "R1", track2).await.unwrap();

        assert_eq!(channel.count("connectTransport"), 1);
        assert_eq!(channel.count("produce"), 2);
        assert_eq!(media.sending_count(), 2);
    }

    #[tokio::test]
    async fn test_refused_connect_fails_transport() {
        let channel = connected_channel().await;
        channel.reject("connectTransport", "dtls mismatch");
        let (_media, backend) = backend();
        let mut transport =
            Transport::create(&channel, &backend, "R1", TransportDirection::Recv, vec![])
                .await
                .unwrap();

        let err = transport.ensure_connected(&channel, "R1").await.unwrap_err();
        assert!(matches!(err, AppError::Transport { .. }));
        assert_eq!(transport.state(), TransportState::Failed);

        // No silent retry on a failed transport
        assert!(transport.ensure_connected(&channel, "R1").await.is_err());
        assert_eq!(channel.count("connectTransport"), 1);
    }

    #[tokio::test]
    async fn test_refused_produce_releases_track() {
        let channel = connected_channel().await;
        channel.reject("produce", "not allowed");
        let (media, backend) = backend();
        let mut transport =
            Transport::create(&channel, &backend, "R1", TransportDirection::Send, vec![])
                .await
                .unwrap();
        let track = crate::media::LocalTrack::new(MediaKind::Screen, "screen");
        assert!(transport.produce(&channel, &backend, "R1", track).await.is_err());
        assert_eq!(media.sending_count(), 0);
    }

    #[tokio::test]
    async fn test_pair_holds_one_transport_per_direction() {
        let channel = connected_channel().await;
        let (_media, backend) = backend();
        let mut pair = TransportPair::new();
        let a = Transport::create(&channel, &backend, "R1", TransportDirection::Send, vec![])
            .await
            .unwrap();
        let b = Transport::create(&channel, &backend, "R1", TransportDirection::Send, vec![])
            .await
            .unwrap();
        pair.install(a).unwrap();
        assert!(pair.install(b).is_err());
        assert!(pair.get_mut(TransportDirection::Recv).is_err());

        pair.close_all(&backend).await;
        assert_eq!(pair.state(TransportDirection::Send), Some(TransportState::Closed));
        pair.reset();
        assert_eq!(pair.state(TransportDirection::Send), None);
    }

    #[tokio::test]
    async fn test_consume_refusal_is_reported() {
        let channel = connected_channel().await;
        channel.refuse_consume("p1");
        let (_media, backend) = backend();
        let mut transport =
            Transport::create(&channel, &backend, "R1", TransportDirection::Recv, vec![])
                .await
                .unwrap();
        let announcement = ProducerAnnouncement {
            peer_id: "peerA".into(),
            peer_name: None,
            producer_id: "p1".into(),
            media_type: MediaKind::Video,
        };
        let err = transport
            .consume(&channel, &backend, "R1", &RtpCapabilities::default(), &announcement)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::CannotConsume { .. }));
    }
}
