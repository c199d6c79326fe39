//! Signaling wire types and messages
//!
//! Frames are JSON text messages over the WebSocket:
//!
//! ```text
//! client -> server  {"id": 7, "method": "joinRoom", "data": {...}}   request
//! client -> server  {"event": "producerCreated", "data": {...}}      notification
//! server -> client  {"id": 7, "data": {...}}                         response
//! server -> client  {"id": 7, "error": "room is full"}               rejection
//! server -> client  {"event": "userJoined", "data": {...}}           push event
//! ```
//!
//! Every request and event is a variant of a closed enum; unknown methods or
//! events fail to decode instead of leaking untyped fields into the session.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AppError, Result};
use crate::media::{MediaKind, WireKind};
use crate::rtc::TransportDirection;

// ============================================================================
// Negotiation parameters
// ============================================================================

/// One codec entry of an RTP capability set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: WireKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub parameters: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rtcp_feedback: Vec<Value>,
}

impl RtpCodecCapability {
    pub fn new(kind: WireKind, mime_type: impl Into<String>, clock_rate: u32) -> Self {
        Self {
            kind,
            mime_type: mime_type.into(),
            clock_rate,
            channels: None,
            preferred_payload_type: None,
            parameters: serde_json::Map::new(),
            rtcp_feedback: Vec::new(),
        }
    }

    pub fn with_channels(mut self, channels: u8) -> Self {
        self.channels = Some(channels);
        self
    }

    /// Retransmission entries are not media codecs
    pub fn is_rtx(&self) -> bool {
        self.mime_type.to_ascii_lowercase().ends_with("/rtx")
    }

    /// Same codec irrespective of payload type and fmtp details
    pub fn matches(&self, other: &RtpCodecCapability) -> bool {
        self.kind == other.kind
            && self.mime_type.eq_ignore_ascii_case(&other.mime_type)
            && self.clock_rate == other.clock_rate
            && match (self.channels, other.channels) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    }
}

/// RTP capabilities of a router or endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
}

/// RTP send/receive parameters, opaque to the session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpParameters(pub Value);

impl RtpParameters {
    /// MIME types listed in the parameters' `codecs` array
    pub fn mime_types(&self) -> Vec<String> {
        self.0
            .get("codecs")
            .and_then(Value::as_array)
            .map(|codecs| {
                codecs
                    .iter()
                    .filter_map(|c| c.get("mimeType").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// ICE parameters of a server-side transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default)]
    pub ice_lite: bool,
}

/// ICE candidate of a server-side transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    #[serde(alias = "address")]
    pub ip: String,
    pub protocol: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<String>,
}

/// DTLS certificate fingerprint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

/// DTLS parameters exchanged in `connectTransport`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DtlsParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub fingerprints: Vec<DtlsFingerprint>,
}

// ============================================================================
// Requests (client -> server, correlated)
// ============================================================================

/// Correlated signaling requests
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "method", content = "data")]
pub enum Request {
    #[serde(rename = "getRouterRtpCapabilities", rename_all = "camelCase")]
    GetRouterRtpCapabilities { room_id: String },

    #[serde(rename = "joinRoom", rename_all = "camelCase")]
    JoinRoom {
        room_id: String,
        user_name: String,
        user_role: String,
        rtp_capabilities: RtpCapabilities,
    },

    #[serde(rename = "createWebRtcTransport", rename_all = "camelCase")]
    CreateWebRtcTransport {
        room_id: String,
        #[serde(rename = "type")]
        direction: TransportDirection,
    },

    #[serde(rename = "connectTransport", rename_all = "camelCase")]
    ConnectTransport {
        room_id: String,
        transport_id: String,
        dtls_parameters: DtlsParameters,
        #[serde(rename = "type")]
        direction: TransportDirection,
    },

    #[serde(rename = "produce", rename_all = "camelCase")]
    Produce {
        room_id: String,
        transport_id: String,
        kind: WireKind,
        rtp_parameters: RtpParameters,
        media_type: MediaKind,
    },

    #[serde(rename = "consume", rename_all = "camelCase")]
    Consume {
        room_id: String,
        producer_id: String,
        rtp_capabilities: RtpCapabilities,
    },

    #[serde(rename = "resumeConsumer", rename_all = "camelCase")]
    ResumeConsumer { room_id: String, consumer_id: String },

    #[serde(rename = "pauseProducer", rename_all = "camelCase")]
    PauseProducer { room_id: String, media_type: MediaKind },

    #[serde(rename = "resumeProducer", rename_all = "camelCase")]
    ResumeProducer { room_id: String, media_type: MediaKind },

    #[serde(rename = "closeProducer", rename_all = "camelCase")]
    CloseProducer { room_id: String, media_type: MediaKind },

    #[serde(rename = "leaveRoom", rename_all = "camelCase")]
    LeaveRoom { room_id: String },
}

impl Request {
    /// Wire method name
    pub fn method(&self) -> &'static str {
        match self {
            Request::GetRouterRtpCapabilities { .. } => "getRouterRtpCapabilities",
            Request::JoinRoom { .. } => "joinRoom",
            Request::CreateWebRtcTransport { .. } => "createWebRtcTransport",
            Request::ConnectTransport { .. } => "connectTransport",
            Request::Produce { .. } => "produce",
            Request::Consume { .. } => "consume",
            Request::ResumeConsumer { .. } => "resumeConsumer",
            Request::PauseProducer { .. } => "pauseProducer",
            Request::ResumeProducer { .. } => "resumeProducer",
            Request::CloseProducer { .. } => "closeProducer",
            Request::LeaveRoom { .. } => "leaveRoom",
        }
    }
}

/// Fire-and-forget client messages
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum Notification {
    /// Authenticate the connection; answered by a `connection_ack` event
    #[serde(rename = "connect", rename_all = "camelCase")]
    Connect {
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        peer_id: String,
        user_name: String,
        role: String,
    },

    /// Announce a freshly created producer so peers can consume it
    #[serde(rename = "producerCreated", rename_all = "camelCase")]
    ProducerCreated {
        room_id: String,
        producer_id: String,
        media_type: MediaKind,
    },

    #[serde(rename = "chatMessage", rename_all = "camelCase")]
    ChatMessage {
        room_id: String,
        user_name: String,
        message: String,
    },
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterCapabilitiesResponse {
    pub rtp_capabilities: RtpCapabilities,
}

/// A remote participant as listed by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    #[serde(alias = "id")]
    pub peer_id: String,
    #[serde(default, alias = "name")]
    pub peer_name: String,
    #[serde(default)]
    pub role: String,
}

/// An existing producer as listed in the join response
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub producer_id: String,
    pub kind: MediaKind,
    pub peer_id: String,
    #[serde(default)]
    pub peer_name: Option<String>,
    #[serde(default)]
    pub media_type: Option<MediaKind>,
}

impl ProducerInfo {
    pub fn announcement(&self) -> ProducerAnnouncement {
        ProducerAnnouncement {
            peer_id: self.peer_id.clone(),
            peer_name: self.peer_name.clone(),
            producer_id: self.producer_id.clone(),
            media_type: self.media_type.unwrap_or(self.kind),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomResponse {
    #[serde(default)]
    pub peers: Vec<PeerInfo>,
    #[serde(default)]
    pub producers: Vec<ProducerInfo>,
    #[serde(default)]
    pub joined: Option<bool>,
    /// Server-assigned id replacing the locally generated one
    #[serde(default)]
    pub peer_id: Option<String>,
}

/// Server-side transport description
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: String,
    pub ice_parameters: IceParameters,
    #[serde(default)]
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProduceResponse {
    pub id: String,
}

/// Granted consumer parameters
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParams {
    pub id: String,
    #[serde(default)]
    pub producer_id: Option<String>,
    pub kind: WireKind,
    pub rtp_parameters: RtpParameters,
    #[serde(default, rename = "type")]
    pub consumer_type: Option<String>,
    #[serde(default)]
    pub producer_peer_id: Option<String>,
}

/// `consume` answers either with parameters or with an error body
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ConsumeResponse {
    Refused { error: String },
    Granted(ConsumerParams),
}

// ============================================================================
// Server push events
// ============================================================================

/// Authentication acknowledgement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionAck {
    pub peer_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerLeft {
    pub peer_id: String,
}

/// A remote producer became available
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerAnnouncement {
    pub peer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_name: Option<String>,
    pub producer_id: String,
    pub media_type: MediaKind,
}

/// A remote producer changed state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerNotice {
    pub peer_id: String,
    pub media_type: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(default)]
    pub peer_id: Option<String>,
    #[serde(default, alias = "userName")]
    pub sender: String,
    pub message: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Unsolicited server pushes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "connection_ack")]
    ConnectionAck(ConnectionAck),
    #[serde(rename = "userJoined")]
    UserJoined(PeerInfo),
    #[serde(rename = "userLeft")]
    UserLeft(PeerLeft),
    #[serde(rename = "newProducer")]
    NewProducer(ProducerAnnouncement),
    #[serde(rename = "producerPaused")]
    ProducerPaused(ProducerNotice),
    #[serde(rename = "producerResumed")]
    ProducerResumed(ProducerNotice),
    #[serde(rename = "producerClosed")]
    ProducerClosed(ProducerNotice),
    #[serde(rename = "chatMessage")]
    ChatMessage(ChatMessage),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::ConnectionAck(_) => "connection_ack",
            ServerEvent::UserJoined(_) => "userJoined",
            ServerEvent::UserLeft(_) => "userLeft",
            ServerEvent::NewProducer(_) => "newProducer",
            ServerEvent::ProducerPaused(_) => "producerPaused",
            ServerEvent::ProducerResumed(_) => "producerResumed",
            ServerEvent::ProducerClosed(_) => "producerClosed",
            ServerEvent::ChatMessage(_) => "chatMessage",
        }
    }
}

// ============================================================================
// Framing
// ============================================================================

/// Decoded server frame
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Response {
        id: u64,
        result: std::result::Result<Value, String>,
    },
    Event(ServerEvent),
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

/// Encode a correlated request frame
pub fn encode_request(id: u64, request: &Request) -> Result<String> {
    let mut value = serde_json::to_value(request)?;
    match value.as_object_mut() {
        Some(obj) => {
            obj.insert("id".to_string(), Value::from(id));
        }
        None => return Err(AppError::Protocol("request did not encode to an object".into())),
    }
    Ok(serde_json::to_string(&value)?)
}

/// Encode a fire-and-forget frame
pub fn encode_notification(notification: &Notification) -> Result<String> {
    Ok(serde_json::to_string(notification)?)
}

/// Decode and validate a server frame
pub fn decode_frame(text: &str) -> Result<ServerFrame> {
    let raw: RawFrame = serde_json::from_str(text)
        .map_err(|e| AppError::Protocol(format!("Malformed frame: {}", e)))?;

    if let Some(id) = raw.id {
        let result = match raw.error {
            Some(Value::String(reason)) => Err(reason),
            Some(Value::Null) | None => Ok(raw.data.unwrap_or(Value::Null)),
            Some(other) => Err(other.to_string()),
        };
        return Ok(ServerFrame::Response { id, result });
    }

    let name = raw
        .event
        .ok_or_else(|| AppError::Protocol("Frame has neither id nor event".into()))?;
    let tagged = serde_json::json!({
        "event": name,
        "data": raw.data.unwrap_or(Value::Null),
    });
    serde_json::from_value(tagged)
        .map(ServerFrame::Event)
        .map_err(|e| AppError::Protocol(format!("Invalid '{}' event: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_frame_layout() {
        let frame = encode_request(
            3,
            &Request::CreateWebRtcTransport {
                room_id: "R1".into(),
                direction: TransportDirection::Send,
            },
        )
        .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(
            value,
            json!({
                "id": 3,
                "method": "createWebRtcTransport",
                "data": { "roomId": "R1", "type": "producer" }
            })
        );
    }

    #[test]
    fn test_produce_carries_wire_kind_and_media_type() {
        let request = Request::Produce {
            room_id: "R1".into(),
            transport_id: "t1".into(),
            kind: MediaKind::Screen.wire_kind(),
            rtp_parameters: RtpParameters(json!({})),
            media_type: MediaKind::Screen,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["data"]["kind"], "video");
        assert_eq!(value["data"]["mediaType"], "screen");
        assert_eq!(request.method(), "produce");
    }

    #[test]
    fn test_decode_response_and_rejection() {
        let ok = decode_frame(r#"{"id":1,"data":{"id":"p1"}}"#).unwrap();
        assert_eq!(
            ok,
            ServerFrame::Response {
                id: 1,
                result: Ok(json!({"id": "p1"}))
            }
        );

        let rejected = decode_frame(r#"{"id":2,"error":"room is full"}"#).unwrap();
        assert_eq!(
            rejected,
            ServerFrame::Response {
                id: 2,
                result: Err("room is full".into())
            }
        );
    }

    #[test]
    fn test_decode_events() {
        let frame = decode_frame(
            r#"{"event":"newProducer","data":{"peerId":"peerA","peerName":"Alice","producerId":"p1","mediaType":"screen"}}"#,
        )
        .unwrap();
        match frame {
            ServerFrame::Event(ServerEvent::NewProducer(a)) => {
                assert_eq!(a.peer_id, "peerA");
                assert_eq!(a.producer_id, "p1");
                assert_eq!(a.media_type, MediaKind::Screen);
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        let joined =
            decode_frame(r#"{"event":"userJoined","data":{"peerId":"peerA","peerName":"Alice","role":"teacher"}}"#)
                .unwrap();
        assert!(matches!(joined, ServerFrame::Event(ServerEvent::UserJoined(ref p)) if p.peer_name == "Alice"));
    }

    #[test]
    fn test_unknown_or_malformed_events_fail() {
        assert!(decode_frame(r#"{"event":"teleport","data":{}}"#).is_err());
        assert!(decode_frame(r#"{"event":"userLeft","data":{"peer":"x"}}"#).is_err());
        assert!(decode_frame(r#"{"event":"newProducer","data":{"peerId":"a","producerId":"p","mediaType":"hologram"}}"#).is_err());
        assert!(decode_frame(r#"{"data":{}}"#).is_err());
        assert!(decode_frame("not json").is_err());
    }

    #[test]
    fn test_join_response_defaults() {
        let response: JoinRoomResponse = serde_json::from_value(json!({
            "producers": [{"producerId": "p1", "kind": "video", "peerId": "peerA"}]
        }))
        .unwrap();
        assert!(response.peers.is_empty());
        assert_eq!(response.joined, None);
        let announcement = response.producers[0].announcement();
        assert_eq!(announcement.media_type, MediaKind::Video);
        assert_eq!(announcement.peer_id, "peerA");
    }

    #[test]
    fn test_consume_response_variants() {
        let refused: ConsumeResponse =
            serde_json::from_value(json!({"error": "cannot consume"})).unwrap();
        assert!(matches!(refused, ConsumeResponse::Refused { .. }));

        let granted: ConsumeResponse = serde_json::from_value(json!({
            "id": "c1",
            "kind": "video",
            "rtpParameters": {"codecs": [{"mimeType": "video/VP8"}]},
            "type": "simple",
            "producerPeerId": "peerA"
        }))
        .unwrap();
        match granted {
            ConsumeResponse::Granted(params) => {
                assert_eq!(params.id, "c1");
                assert_eq!(params.rtp_parameters.mime_types(), vec!["video/VP8"]);
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_codec_matching_ignores_payload_type() {
        let mut a = RtpCodecCapability::new(WireKind::Audio, "audio/opus", 48000).with_channels(2);
        a.preferred_payload_type = Some(100);
        let b = RtpCodecCapability::new(WireKind::Audio, "audio/OPUS", 48000).with_channels(2);
        assert!(a.matches(&b));
        let c = RtpCodecCapability::new(WireKind::Audio, "audio/opus", 48000).with_channels(1);
        assert!(!a.matches(&c));
        assert!(RtpCodecCapability::new(WireKind::Video, "video/rtx", 90000).is_rtx());
    }
}
