//! WebSocket signaling channel
//!
//! One driver task owns the socket. Requests register a oneshot under their
//! correlation id and wait for the driver to complete it; pushed events go
//! to an unbounded queue handed out by `connect`. When the socket drops, all
//! in-flight requests fail with a connection error and the driver retries a
//! bounded number of times with a fixed delay before reporting `Closed`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::channel::{ChannelEvent, ChannelState, Connection, Credentials, SignalingChannel};
use super::protocol::{
    decode_frame, encode_notification, encode_request, ConnectionAck, Notification, Request,
    ServerEvent, ServerFrame,
};
use crate::config::SignalingConfig;
use crate::error::{AppError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct PendingRequest {
    method: &'static str,
    tx: oneshot::Sender<Result<Value>>,
}

/// State shared between the channel handle and its driver task
struct Shared {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    state: watch::Sender<ChannelState>,
}

impl Shared {
    fn set_state(&self, state: ChannelState) {
        self.state.send_if_modified(|current| {
            if *current != state {
                debug!("Signaling channel: {} -> {}", current, state);
                *current = state;
                true
            } else {
                false
            }
        });
    }

    /// Reject every in-flight request
    fn fail_pending(&self, reason: &str) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        if !drained.is_empty() {
            debug!("Failing {} in-flight requests: {}", drained.len(), reason);
        }
        for (_, request) in drained {
            let _ = request.tx.send(Err(AppError::Connection(format!(
                "'{}' aborted: {}",
                request.method, reason
            ))));
        }
    }

    fn complete(&self, id: u64, result: std::result::Result<Value, String>) {
        let Some(request) = self.pending.lock().remove(&id) else {
            trace!("Response for unknown or expired request {}", id);
            return;
        };
        let result = result.map_err(|reason| AppError::Rejected {
            method: request.method.to_string(),
            reason,
        });
        let _ = request.tx.send(result);
    }
}

/// Resources of one established connection
struct Link {
    outbound: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
    driver: JoinHandle<()>,
}

#[derive(Debug, Clone)]
struct Settings {
    url: String,
    connect_timeout: Duration,
    request_timeout: Duration,
    reconnect_attempts: u32,
    reconnect_delay: Duration,
}

/// [`SignalingChannel`] over a WebSocket
pub struct WsSignalingChannel {
    settings: Settings,
    shared: Arc<Shared>,
    link: Mutex<Option<Link>>,
}

impl WsSignalingChannel {
    pub fn new(config: &SignalingConfig) -> Self {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        Self {
            settings: Settings {
                url: config.url.clone(),
                connect_timeout: Duration::from_millis(config.connect_timeout_ms as u64),
                request_timeout: Duration::from_millis(config.request_timeout_ms as u64),
                reconnect_attempts: config.reconnect_attempts,
                reconnect_delay: Duration::from_millis(config.reconnect_delay_ms as u64),
            },
            shared: Arc::new(Shared {
                next_id: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                state,
            }),
            link: Mutex::new(None),
        }
    }

    /// Subscribe to connection state changes
    pub fn state_watch(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    fn outbound(&self) -> Result<mpsc::UnboundedSender<Message>> {
        self.link
            .lock()
            .as_ref()
            .map(|link| link.outbound.clone())
            .ok_or_else(|| AppError::Connection("Signaling channel not connected".into()))
    }

    /// Open the socket, retrying a bounded number of times
    async fn open_with_retry(&self, token: Option<&str>) -> Result<WsStream> {
        let attempts = self.settings.reconnect_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match open_socket(&self.settings, token).await {
                Ok(socket) => return Ok(socket),
                Err(e) => {
                    warn!(
                        "Signaling connect attempt {}/{} failed: {}",
                        attempt, attempts, e
                    );
                    last_error = Some(e);
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.settings.reconnect_delay).await;
            }
        }
        Err(last_error.unwrap_or_else(|| AppError::Connection("no connect attempt made".into())))
    }
}

#[async_trait]
impl SignalingChannel for WsSignalingChannel {
    async fn connect(&self, credentials: &Credentials) -> Result<Connection> {
        self.disconnect().await;
        self.shared.set_state(ChannelState::Connecting);
        info!("Connecting to signaling server {}", self.settings.url);

        let socket = match self.open_with_retry(credentials.token.as_deref()).await {
            Ok(socket) => socket,
            Err(e) => {
                self.shared.set_state(ChannelState::Failed);
                return Err(e);
            }
        };

        let handshake = Notification::Connect {
            token: credentials.token.clone(),
            peer_id: credentials.peer_id.clone(),
            user_name: credentials.display_name.clone(),
            role: credentials.role.clone(),
        };
        let handshake_frame = encode_notification(&handshake)?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let driver = Driver {
            settings: self.settings.clone(),
            shared: self.shared.clone(),
            token: credentials.token.clone(),
            handshake_frame: handshake_frame.clone(),
            outbound_rx,
            events_tx,
            ack_tx: Some(ack_tx),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(driver.run(socket));

        let _ = outbound_tx.send(Message::Text(handshake_frame.into()));
        *self.link.lock() = Some(Link {
            outbound: outbound_tx,
            cancel,
            driver: handle,
        });

        match tokio::time::timeout(self.settings.connect_timeout, ack_rx).await {
            Ok(Ok(ack)) => {
                self.shared.set_state(ChannelState::Connected);
                info!("Signaling connected as {} ({})", ack.peer_id, ack.role);
                Ok(Connection {
                    ack,
                    events: events_rx,
                })
            }
            Ok(Err(_)) => {
                self.disconnect().await;
                self.shared.set_state(ChannelState::Failed);
                Err(AppError::Connection(
                    "Connection closed before acknowledgement".into(),
                ))
            }
            Err(_) => {
                self.disconnect().await;
                self.shared.set_state(ChannelState::Failed);
                Err(AppError::Timeout {
                    method: "connect".into(),
                    timeout_ms: self.settings.connect_timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn request(&self, request: Request) -> Result<Value> {
        let method = request.method();
        if !self.is_connected() {
            return Err(AppError::Connection(format!(
                "Cannot send '{}': channel is {}",
                method,
                self.state()
            )));
        }
        let outbound = self.outbound()?;

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = encode_request(id, &request)?;
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .insert(id, PendingRequest { method, tx });

        if outbound.send(Message::Text(frame.into())).is_err() {
            self.shared.pending.lock().remove(&id);
            return Err(AppError::Connection(format!(
                "Cannot send '{}': writer closed",
                method
            )));
        }
        debug!("-> {} #{}", method, id);

        match tokio::time::timeout(self.settings.request_timeout, rx).await {
            Ok(Ok(result)) => {
                debug!("<- {} #{} {}", method, id, if result.is_ok() { "ok" } else { "error" });
                result
            }
            Ok(Err(_)) => Err(AppError::Connection(format!("'{}' dropped", method))),
            Err(_) => {
                self.shared.pending.lock().remove(&id);
                warn!("Request {} #{} timed out", method, id);
                Err(AppError::Timeout {
                    method: method.to_string(),
                    timeout_ms: self.settings.request_timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn notify(&self, notification: Notification) -> Result<()> {
        if !self.is_connected() {
            return Err(AppError::Connection(format!(
                "Cannot send notification: channel is {}",
                self.state()
            )));
        }
        let frame = encode_notification(&notification)?;
        self.outbound()?
            .send(Message::Text(frame.into()))
            .map_err(|_| AppError::Connection("Cannot send notification: writer closed".into()))
    }

    async fn disconnect(&self) {
        let link = self.link.lock().take();
        if let Some(link) = link {
            link.cancel.cancel();
            if let Err(e) = link.driver.await {
                warn!("Signaling driver ended abnormally: {}", e);
            }
            info!("Signaling disconnected");
        }
        self.shared.fail_pending("disconnected");
        self.shared.set_state(ChannelState::Disconnected);
    }

    fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }
}

async fn open_socket(settings: &Settings, token: Option<&str>) -> Result<WsStream> {
    let mut request = settings
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| AppError::Connection(format!("Invalid signaling URL: {}", e)))?;
    if let Some(token) = token {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| AppError::Connection(format!("Invalid token: {}", e)))?;
        request.headers_mut().insert("Authorization", value);
    }

    match tokio::time::timeout(
        settings.connect_timeout,
        tokio_tungstenite::connect_async(request),
    )
    .await
    {
        Ok(Ok((socket, _))) => Ok(socket),
        Ok(Err(e)) => Err(AppError::Connection(e.to_string())),
        Err(_) => Err(AppError::Timeout {
            method: "connect".into(),
            timeout_ms: settings.connect_timeout.as_millis() as u64,
        }),
    }
}

enum Exit {
    Cancelled,
    Lost(String),
}

/// Socket owner; lives until disconnect or reconnection gives up
struct Driver {
    settings: Settings,
    shared: Arc<Shared>,
    token: Option<String>,
    handshake_frame: String,
    outbound_rx: mpsc::UnboundedReceiver<Message>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    ack_tx: Option<oneshot::Sender<ConnectionAck>>,
    cancel: CancellationToken,
}

impl Driver {
    async fn run(mut self, mut socket: WsStream) {
        loop {
            let reason = match self.pump(&mut socket).await {
                Exit::Cancelled => {
                    let _ = tokio::time::timeout(Duration::from_secs(1), socket.close(None)).await;
                    return;
                }
                Exit::Lost(reason) => reason,
            };

            warn!("Signaling connection lost: {}", reason);
            self.shared.fail_pending(&reason);
            // Frames queued for the dead socket belong to requests just failed
            while self.outbound_rx.try_recv().is_ok() {}

            match self.reconnect().await {
                Some(restored) => socket = restored,
                None => return,
            }
        }
    }

    async fn pump(&mut self, socket: &mut WsStream) -> Exit {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Exit::Cancelled,
                outbound = self.outbound_rx.recv() => match outbound {
                    Some(message) => {
                        if let Err(e) = socket.send(message).await {
                            return Exit::Lost(e.to_string());
                        }
                    }
                    None => return Exit::Cancelled,
                },
                incoming = socket.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.dispatch(&text),
                    Some(Ok(Message::Close(_))) => return Exit::Lost("closed by server".into()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Exit::Lost(e.to_string()),
                    None => return Exit::Lost("stream ended".into()),
                },
            }
        }
    }

    fn dispatch(&mut self, text: &str) {
        match decode_frame(text) {
            Ok(ServerFrame::Response { id, result }) => self.shared.complete(id, result),
            Ok(ServerFrame::Event(ServerEvent::ConnectionAck(ack))) if self.ack_tx.is_some() => {
                if let Some(tx) = self.ack_tx.take() {
                    let _ = tx.send(ack);
                }
            }
            Ok(ServerFrame::Event(event)) => {
                trace!("<- event {}", event.name());
                let _ = self.events_tx.send(ChannelEvent::Server(event));
            }
            Err(e) => warn!("Dropping signaling frame: {}", e),
        }
    }

    async fn reconnect(&mut self) -> Option<WsStream> {
        let max = self.settings.reconnect_attempts;
        for attempt in 1..=max {
            self.shared.set_state(ChannelState::Reconnecting(attempt));
            let _ = self
                .events_tx
                .send(ChannelEvent::Reconnecting { attempt, max });

            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.settings.reconnect_delay) => {}
            }

            match open_socket(&self.settings, self.token.as_deref()).await {
                Ok(mut socket) => {
                    let handshake = Message::Text(self.handshake_frame.clone().into());
                    if let Err(e) = socket.send(handshake).await {
                        warn!("Reconnect attempt {}/{} failed: {}", attempt, max, e);
                        continue;
                    }
                    info!("Signaling reconnected after {} attempt(s)", attempt);
                    self.shared.set_state(ChannelState::Connected);
                    let _ = self.events_tx.send(ChannelEvent::Reconnected);
                    return Some(socket);
                }
                Err(e) => warn!("Reconnect attempt {}/{} failed: {}", attempt, max, e),
            }
        }

        let reason = format!("gave up after {} reconnect attempts", max);
        warn!("Signaling {}", reason);
        self.shared.set_state(ChannelState::Failed);
        let _ = self.events_tx.send(ChannelEvent::Closed { reason });
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    fn config(url: String) -> SignalingConfig {
        SignalingConfig {
            url,
            connect_timeout_ms: 1000,
            request_timeout_ms: 200,
            reconnect_attempts: 2,
            reconnect_delay_ms: 20,
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            token: Some("tok".into()),
            peer_id: "local-1".into(),
            display_name: "Alice".into(),
            role: "teacher".into(),
        }
    }

    /// Minimal SFU stand-in: acks `connect`, answers `getRouterRtpCapabilities`,
    /// rejects `joinRoom`, ignores `leaveRoom`, pushes one event after the ack.
    /// Closes the socket when it receives `closeProducer`.
    async fn spawn_server() -> (String, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (url, listener)
    }

    async fn serve_one(listener: &TcpListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        while let Some(Ok(message)) = ws.next().await {
            let Message::Text(text) = message else { continue };
            let frame: Value = serde_json::from_str(&text).unwrap();
            if frame["event"] == "connect" {
                let ack = json!({
                    "event": "connection_ack",
                    "data": {"peerId": "srv-7", "name": frame["data"]["userName"], "role": "teacher"}
                });
                ws.send(Message::Text(ack.to_string().into())).await.unwrap();
                let joined = json!({
                    "event": "userJoined",
                    "data": {"peerId": "B", "peerName": "Bob", "role": "student"}
                });
                ws.send(Message::Text(joined.to_string().into())).await.unwrap();
                continue;
            }
            let id = frame["id"].clone();
            let reply = match frame["method"].as_str() {
                Some("getRouterRtpCapabilities") => {
                    json!({"id": id, "data": {"rtpCapabilities": {"codecs": []}}})
                }
                Some("joinRoom") => json!({"id": id, "error": "room is full"}),
                Some("closeProducer") => break,
                _ => continue,
            };
            ws.send(Message::Text(reply.to_string().into())).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_handshake_requests_and_events() {
        let (url, listener) = spawn_server().await;
        let server = tokio::spawn(async move { serve_one(&listener).await });

        let channel = WsSignalingChannel::new(&config(url));
        let mut connection = channel.connect(&credentials()).await.unwrap();
        assert_eq!(connection.ack.peer_id, "srv-7");
        assert_eq!(connection.ack.name, "Alice");
        assert!(channel.is_connected());

        let caps = channel
            .request(Request::GetRouterRtpCapabilities { room_id: "R1".into() })
            .await
            .unwrap();
        assert_eq!(caps["rtpCapabilities"]["codecs"], json!([]));

        let err = channel
            .request(Request::LeaveRoom { room_id: "R1".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Timeout { .. }));
        assert!(channel.shared.pending.lock().is_empty());

        let err = channel
            .request(Request::JoinRoom {
                room_id: "R1".into(),
                user_name: "Alice".into(),
                user_role: "teacher".into(),
                rtp_capabilities: Default::default(),
            })
            .await
            .unwrap_err();
        match err {
            AppError::Rejected { method, reason } => {
                assert_eq!(method, "joinRoom");
                assert_eq!(reason, "room is full");
            }
            other => panic!("unexpected error {:?}", other),
        }

        match connection.events.recv().await.unwrap() {
            ChannelEvent::Server(ServerEvent::UserJoined(peer)) => assert_eq!(peer.peer_id, "B"),
            other => panic!("unexpected event {:?}", other),
        }

        channel.disconnect().await;
        channel.disconnect().await;
        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert!(connection.events.recv().await.is_none());
        server.abort();
    }

    #[tokio::test]
    async fn test_unreachable_server_is_connection_error() {
        let (url, listener) = spawn_server().await;
        drop(listener);
        let channel = WsSignalingChannel::new(&config(url));
        let err = channel.connect(&credentials()).await.unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Connection);
        assert_eq!(channel.state(), ChannelState::Failed);

        let err = channel
            .request(Request::LeaveRoom { room_id: "R1".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Connection(_)));
    }

    #[tokio::test]
    async fn test_lost_connection_fails_in_flight_and_gives_up() {
        let (url, listener) = spawn_server().await;
        let server = tokio::spawn(async move {
            serve_one(&listener).await;
            // Listener dropped here so every reconnect attempt is refused
        });

        let channel = WsSignalingChannel::new(&config(url));
        let mut connection = channel.connect(&credentials()).await.unwrap();

        let err = channel
            .request(Request::CloseProducer {
                room_id: "R1".into(),
                media_type: crate::media::MediaKind::Audio,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Connection(_)));
        server.await.unwrap();

        let mut reconnecting = 0;
        loop {
            match connection.events.recv().await {
                Some(ChannelEvent::Reconnecting { max, .. }) => {
                    assert_eq!(max, 2);
                    reconnecting += 1;
                }
                Some(ChannelEvent::Closed { .. }) => break,
                Some(_) => {}
                None => panic!("event stream ended without Closed"),
            }
        }
        assert_eq!(reconnecting, 2);
        assert_eq!(channel.state(), ChannelState::Failed);
        channel.disconnect().await;
    }
}
