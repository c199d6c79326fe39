//! Scripted in-memory signaling server for tests

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};

use super::channel::{ChannelEvent, ChannelState, Connection, Credentials, SignalingChannel};
use super::protocol::{
    ConnectionAck, Notification, Request, RtpCapabilities, RtpCodecCapability, ServerEvent,
};
use crate::error::{AppError, Result};
use crate::media::{MediaKind, WireKind};
use crate::rtc::TransportDirection;

#[derive(Default)]
struct Script {
    connect_error: Option<String>,
    rejections: HashMap<&'static str, String>,
    timeouts: HashSet<&'static str>,
    gates: HashMap<&'static str, Arc<Notify>>,
    refused_consumes: HashSet<String>,
    producers: HashMap<String, (String, MediaKind)>,
    join_response: Option<Value>,
    router_codecs: Option<Vec<RtpCodecCapability>>,
}

#[derive(Default)]
struct Log {
    requests: Vec<Request>,
    notifications: Vec<Notification>,
    connects: usize,
    disconnects: usize,
}

/// Answers requests like a cooperative SFU unless told otherwise
#[derive(Default)]
pub struct FakeChannel {
    script: Mutex<Script>,
    log: Mutex<Log>,
    events: Mutex<Option<mpsc::UnboundedSender<ChannelEvent>>>,
    state: Mutex<ChannelState>,
}

impl FakeChannel {
    pub fn sfu() -> Self {
        Self::default()
    }

    /// Fail `connect` with a connection error
    pub fn fail_connect(&self) {
        self.script.lock().connect_error = Some("connection refused".into());
    }

    pub fn reject(&self, method: &'static str, reason: &str) {
        self.script.lock().rejections.insert(method, reason.to_string());
    }

    /// Answer `method` with a timeout error
    pub fn time_out(&self, method: &'static str) {
        self.script.lock().timeouts.insert(method);
    }

    /// Hold `method` until the returned notify is triggered
    pub fn gate(&self, method: &'static str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.script.lock().gates.insert(method, notify.clone());
        notify
    }

    pub fn refuse_consume(&self, producer_id: &str) {
        self.script
            .lock()
            .refused_consumes
            .insert(producer_id.to_string());
    }

    /// Describe a remote producer so `consume` answers with its kind and owner
    pub fn register_producer(&self, producer_id: &str, peer_id: &str, kind: MediaKind) {
        self.script
            .lock()
            .producers
            .insert(producer_id.to_string(), (peer_id.to_string(), kind));
    }

    pub fn set_join_response(&self, response: Value) {
        self.script.lock().join_response = Some(response);
    }

    pub fn set_router_codecs(&self, codecs: Vec<RtpCodecCapability>) {
        self.script.lock().router_codecs = Some(codecs);
    }

    /// Deliver a server push
    pub fn push(&self, event: ServerEvent) {
        self.emit(ChannelEvent::Server(event));
    }

    pub fn emit(&self, event: ChannelEvent) {
        if let ChannelEvent::Closed { .. } = event {
            *self.state.lock() = ChannelState::Failed;
        }
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn requests(&self) -> Vec<Request> {
        self.log.lock().requests.clone()
    }

    pub fn methods(&self) -> Vec<&'static str> {
        self.log.lock().requests.iter().map(Request::method).collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.methods().into_iter().filter(|m| *m == method).count()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.log.lock().notifications.clone()
    }

    pub fn connects(&self) -> usize {
        self.log.lock().connects
    }

    pub fn disconnects(&self) -> usize {
        self.log.lock().disconnects
    }

    fn respond(&self, request: &Request) -> Value {
        let script = self.script.lock();
        match request {
            Request::GetRouterRtpCapabilities { .. } => {
                let codecs = script.router_codecs.clone().unwrap_or_else(|| {
                    vec![
                        RtpCodecCapability::new(WireKind::Audio, "audio/opus", 48000)
                            .with_channels(2),
                        RtpCodecCapability::new(WireKind::Video, "video/VP8", 90000),
                    ]
                });
                let caps = RtpCapabilities {
                    codecs,
                    header_extensions: Vec::new(),
                };
                json!({ "rtpCapabilities": caps })
            }
            Request::JoinRoom { .. } => script
                .join_response
                .clone()
                .unwrap_or_else(|| json!({ "peers": [], "producers": [], "joined": true })),
            Request::CreateWebRtcTransport { direction, .. } => {
                let id = match direction {
                    TransportDirection::Send => "send-transport",
                    TransportDirection::Recv => "recv-transport",
                };
                json!({
                    "id": id,
                    "iceParameters": { "usernameFragment": "ufrag", "password": "pwd", "iceLite": true },
                    "iceCandidates": [{
                        "foundation": "udpcandidate",
                        "priority": 1076302079u32,
                        "ip": "203.0.113.5",
                        "protocol": "udp",
                        "port": 40000,
                        "type": "host"
                    }],
                    "dtlsParameters": {
                        "role": "auto",
                        "fingerprints": [{ "algorithm": "sha-256", "value": "AA:BB" }]
                    }
                })
            }
            Request::Produce { media_type, .. } => json!({ "id": format!("producer-{}", media_type) }),
            Request::Consume { producer_id, .. } => {
                if script.refused_consumes.contains(producer_id) {
                    return json!({ "error": "cannot consume" });
                }
                let (peer_id, kind) = script
                    .producers
                    .get(producer_id)
                    .cloned()
                    .map(|(peer, kind)| (Some(peer), kind))
                    .unwrap_or((None, MediaKind::Video));
                let mut granted = json!({
                    "id": format!("consumer-{}", producer_id),
                    "producerId": producer_id,
                    "kind": kind.wire_kind(),
                    "rtpParameters": { "codecs": [] },
                    "type": "simple"
                });
                if let Some(peer_id) = peer_id {
                    granted["producerPeerId"] = json!(peer_id);
                }
                granted
            }
            _ => json!({}),
        }
    }
}

#[async_trait]
impl SignalingChannel for FakeChannel {
    async fn connect(&self, credentials: &Credentials) -> Result<Connection> {
        self.log.lock().connects += 1;
        let refused = self
            .script
            .lock()
            .connect_error
            .as_ref()
            .map(|reason| AppError::Connection(reason.clone()));
        if let Some(e) = refused {
            *self.state.lock() = ChannelState::Failed;
            return Err(e);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock() = Some(tx);
        *self.state.lock() = ChannelState::Connected;
        Ok(Connection {
            ack: ConnectionAck {
                peer_id: credentials.peer_id.clone(),
                name: credentials.display_name.clone(),
                role: credentials.role.clone(),
            },
            events: rx,
        })
    }

    async fn request(&self, request: Request) -> Result<Value> {
        let method = request.method();
        if !self.is_connected() {
            return Err(AppError::Connection(format!("not connected, cannot send '{}'", method)));
        }
        self.log.lock().requests.push(request.clone());

        let gate = self.script.lock().gates.get(method).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let (rejection, timed_out) = {
            let script = self.script.lock();
            (
                script.rejections.get(method).cloned(),
                script.timeouts.contains(method),
            )
        };
        if timed_out {
            return Err(AppError::Timeout {
                method: method.to_string(),
                timeout_ms: 10,
            });
        }
        if let Some(reason) = rejection {
            return Err(AppError::Rejected {
                method: method.to_string(),
                reason,
            });
        }
        Ok(self.respond(&request))
    }

    async fn notify(&self, notification: Notification) -> Result<()> {
        if !self.is_connected() {
            return Err(AppError::Connection("not connected".into()));
        }
        let rejected = {
            let script = self.script.lock();
            let name = match &notification {
                Notification::Connect { .. } => "connect",
                Notification::ProducerCreated { .. } => "producerCreated",
                Notification::ChatMessage { .. } => "chatMessage",
            };
            script.rejections.get(name).cloned()
        };
        if let Some(reason) = rejected {
            return Err(AppError::Connection(reason));
        }
        self.log.lock().notifications.push(notification);
        Ok(())
    }

    async fn disconnect(&self) {
        self.log.lock().disconnects += 1;
        self.events.lock().take();
        *self.state.lock() = ChannelState::Disconnected;
    }

    fn state(&self) -> ChannelState {
        *self.state.lock()
    }
}
