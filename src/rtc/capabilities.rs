//! Capability negotiator
//!
//! Holds the router's RTP capabilities and the subset the local media stack
//! supports. Loaded once per session, before any transport exists.

use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::media::MediaKind;
use crate::signaling::protocol::{
    Request, RouterCapabilitiesResponse, RtpCapabilities, RtpCodecCapability, RtpParameters,
};
use crate::signaling::{call, SignalingChannel};

/// Negotiated endpoint capabilities
#[derive(Debug, Default)]
pub struct Device {
    local: Option<RtpCapabilities>,
}

impl Device {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.local.is_some()
    }

    /// Load router capabilities and compute the locally usable subset
    pub fn load(&mut self, router: RtpCapabilities, native: &RtpCapabilities) -> Result<()> {
        if self.is_loaded() {
            return Err(AppError::AlreadyLoaded);
        }

        let codecs: Vec<RtpCodecCapability> = router
            .codecs
            .iter()
            .filter(|codec| codec.is_rtx() || native.codecs.iter().any(|n| n.matches(codec)))
            .cloned()
            .collect();

        if !codecs.iter().any(|c| !c.is_rtx()) {
            return Err(AppError::Negotiation(
                "router offers no codec supported by the local media stack".into(),
            ));
        }

        info!(
            "Capabilities loaded: {} of {} router codecs usable",
            codecs.iter().filter(|c| !c.is_rtx()).count(),
            router.codecs.iter().filter(|c| !c.is_rtx()).count()
        );

        self.local = Some(RtpCapabilities {
            codecs,
            header_extensions: router.header_extensions.clone(),
        });
        Ok(())
    }

    /// Local capabilities sent with `joinRoom` and `consume`
    pub fn rtp_capabilities(&self) -> Result<&RtpCapabilities> {
        self.local
            .as_ref()
            .ok_or_else(|| AppError::InvalidState("capabilities not loaded".into()))
    }

    pub fn can_produce(&self, kind: MediaKind) -> bool {
        self.has_codec_for(kind)
    }

    /// Advisory local check before asking the server to create a consumer
    ///
    /// With `rtp_parameters` the producer's codecs must intersect the local
    /// set; without, any codec of the right kind suffices.
    pub fn can_consume(&self, kind: MediaKind, rtp_parameters: Option<&RtpParameters>) -> bool {
        if !self.has_codec_for(kind) {
            return false;
        }
        let Some(params) = rtp_parameters else {
            return true;
        };
        let mime_types = params.mime_types();
        if mime_types.is_empty() {
            return true;
        }
        let local = match self.local.as_ref() {
            Some(local) => local,
            None => return false,
        };
        mime_types.iter().any(|mime| {
            local
                .codecs
                .iter()
                .any(|c| !c.is_rtx() && c.mime_type.eq_ignore_ascii_case(mime))
        })
    }

    fn has_codec_for(&self, kind: MediaKind) -> bool {
        let wire = kind.wire_kind();
        self.local
            .as_ref()
            .map(|caps| caps.codecs.iter().any(|c| c.kind == wire && !c.is_rtx()))
            .unwrap_or(false)
    }
}

/// Ask the signaling server for the room router's capabilities
pub async fn fetch_router_capabilities(
    channel: &dyn SignalingChannel,
    room_id: &str,
) -> Result<RtpCapabilities> {
    let response: RouterCapabilitiesResponse = call(
        channel,
        Request::GetRouterRtpCapabilities {
            room_id: room_id.to_string(),
        },
    )
    .await?;
    debug!(
        "Router capabilities for room {}: {} codecs",
        room_id,
        response.rtp_capabilities.codecs.len()
    );
    Ok(response.rtp_capabilities)
}
