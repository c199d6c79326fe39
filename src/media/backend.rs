//! Media stack seam
//!
//! ICE/DTLS transport termination, RTP packetization and congestion control
//! live behind [`MediaBackend`]. The session only drives the negotiation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::{LocalTrack, MediaKind, RemoteTrack};
use crate::error::Result;
use crate::rtc::ice::IceServer;
use crate::rtc::TransportDirection;
use crate::signaling::protocol::{
    DtlsParameters, IceCandidate, IceParameters, RtpCapabilities, RtpParameters,
};

/// Connectivity of a local transport as reported by the media stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::New => write!(f, "new"),
            LinkState::Checking => write!(f, "checking"),
            LinkState::Connected => write!(f, "connected"),
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Failed => write!(f, "failed"),
            LinkState::Closed => write!(f, "closed"),
        }
    }
}

/// Remote transport description handed to the media stack
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub id: String,
    pub direction: TransportDirection,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
    pub ice_servers: Vec<IceServer>,
}

/// Local half of a transport
pub struct TransportLink {
    /// DTLS parameters to send in `connectTransport`
    pub local_dtls: DtlsParameters,
    /// Connectivity updates
    pub state: watch::Receiver<LinkState>,
}

#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Codecs the local stack can encode and decode
    fn native_capabilities(&self) -> RtpCapabilities;

    /// Create the local side of a server transport
    async fn open_transport(&self, options: TransportOptions) -> Result<TransportLink>;

    /// Attach a local track to a send transport, returning its RTP parameters
    async fn send_track(&self, transport_id: &str, track: &LocalTrack) -> Result<RtpParameters>;

    /// Detach a local track from a send transport
    async fn stop_sending(&self, transport_id: &str, track_id: &str);

    /// Bind a granted consumer to a receive transport
    async fn receive_track(
        &self,
        transport_id: &str,
        consumer_id: &str,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<RemoteTrack>;

    /// Tear down the local side of a transport
    async fn close_transport(&self, transport_id: &str);
}
