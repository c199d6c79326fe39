//! Session orchestrator
//!
//! Owns every registry of one room session and is driven by a single task:
//! commands from [`super::SessionHandle`] and internal messages (signaling
//! events, track-ended and transport-failure watchers) are handled one at a
//! time, so no registry is ever touched concurrently.
//!
//! Internal messages carry the session generation they were produced for.
//! Teardown bumps the generation, so results and events belonging to a
//! session that no longer exists are discarded.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::fallback::{degraded_warning, placeholder_peers};
use super::state::SessionState;
use crate::config::AppConfig;
use crate::error::{AppError, ErrorClass, Result};
use crate::events::{EventBus, SessionEvent};
use crate::media::{LinkState, LocalTrack, MediaBackend, MediaDevices, MediaKind};
use crate::rtc::capabilities::fetch_router_capabilities;
use crate::rtc::consumer::ConsumerInfo;
use crate::rtc::peer::PeerSnapshot;
use crate::rtc::producer::ProducerInfo;
use crate::rtc::{
    Device, IceServerClient, Peer, PeerRegistry, Placement, ProducerRegistry, Transport,
    TransportDirection, TransportPair, TransportState,
};
use crate::signaling::protocol::{
    ChatMessage, JoinRoomResponse, PeerInfo, ProducerAnnouncement, ProducerNotice,
};
use crate::signaling::{
    call, ChannelEvent, Credentials, Notification, Request, ServerEvent, SignalingChannel,
};

/// Result of a join attempt that did not fail
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JoinOutcome {
    /// Connected with media
    Active,
    /// Signaling unreachable; placeholder peers only
    Degraded { warning: String },
}

/// Point-in-time view of the session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub peer_id: String,
    pub display_name: String,
    pub role: String,
    pub room_id: Option<String>,
    pub peers: Vec<PeerSnapshot>,
    /// Consumers waiting for their peer, by peer id
    pub pending: HashMap<String, Vec<ConsumerInfo>>,
    pub producers: Vec<ProducerInfo>,
    pub send_transport: Option<TransportState>,
    pub recv_transport: Option<TransportState>,
    pub warning: Option<String>,
    pub last_error: Option<String>,
}

/// Message from a background task to the session task
#[derive(Debug)]
pub(crate) struct Internal {
    generation: u64,
    kind: InternalKind,
}

#[derive(Debug)]
enum InternalKind {
    Channel(ChannelEvent),
    TrackEnded { kind: MediaKind, track_id: String },
    TransportFailed { direction: TransportDirection },
}

/// Local participant identity for the current session
#[derive(Debug, Clone)]
struct Identity {
    peer_id: String,
    display_name: String,
    role: String,
    token: Option<String>,
}

/// Media collaborators of a session
#[derive(Clone)]
pub struct MediaStack {
    pub devices: Arc<dyn MediaDevices>,
    pub backend: Arc<dyn MediaBackend>,
}

/// One room session
pub struct Session {
    config: AppConfig,
    channel: Arc<dyn SignalingChannel>,
    devices: Arc<dyn MediaDevices>,
    backend: Arc<dyn MediaBackend>,
    ice: IceServerClient,
    events: EventBus,

    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    identity: Identity,
    room_id: Option<String>,
    joined_room: bool,
    device: Device,
    transports: TransportPair,
    producers: ProducerRegistry,
    peers: PeerRegistry,
    /// Peers that left during this session; late announcements are dropped
    departed: HashSet<String>,
    warning: Option<String>,
    last_error: Option<String>,

    generation: u64,
    internal_tx: mpsc::UnboundedSender<Internal>,
    tasks: Vec<JoinHandle<()>>,
    /// Cancellation token of the join in progress, shared with handles
    join_slot: Arc<Mutex<Option<CancellationToken>>>,
}

impl Session {
    /// Create an idle session and the receiver for its internal messages
    pub(crate) fn new(
        config: AppConfig,
        channel: Arc<dyn SignalingChannel>,
        media: MediaStack,
        events: EventBus,
    ) -> (Self, mpsc::UnboundedReceiver<Internal>) {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let identity = Identity {
            peer_id: config
                .identity
                .peer_id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            display_name: config.identity.display_name.clone(),
            role: config.identity.role.clone(),
            token: config.identity.token.clone(),
        };
        let session = Self {
            ice: IceServerClient::new(&config.ice),
            config,
            channel,
            devices: media.devices,
            backend: media.backend,
            events,
            state: SessionState::Idle,
            state_tx,
            identity,
            room_id: None,
            joined_room: false,
            device: Device::new(),
            transports: TransportPair::new(),
            producers: ProducerRegistry::new(),
            peers: PeerRegistry::new(),
            departed: HashSet::new(),
            warning: None,
            last_error: None,
            generation: 0,
            internal_tx,
            tasks: Vec::new(),
            join_slot: Arc::new(Mutex::new(None)),
        };
        (session, internal_rx)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub(crate) fn join_slot(&self) -> Arc<Mutex<Option<CancellationToken>>> {
        self.join_slot.clone()
    }

    /// Publish a fresh token for the join about to run
    fn begin_join(&self) -> CancellationToken {
        let cancel = CancellationToken::new();
        *self.join_slot.lock() = Some(cancel.clone());
        cancel
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            peer_id: self.identity.peer_id.clone(),
            display_name: self.identity.display_name.clone(),
            role: self.identity.role.clone(),
            room_id: self.room_id.clone(),
            peers: self.peers.snapshot(),
            pending: self.peers.pending_snapshot(),
            producers: self.producers.snapshot(),
            send_transport: self.transports.state(TransportDirection::Send),
            recv_transport: self.transports.state(TransportDirection::Recv),
            warning: self.warning.clone(),
            last_error: self.last_error.clone(),
        }
    }

    fn set_state(&mut self, next: SessionState) -> Result<()> {
        let from = self.state;
        if from == next {
            return Ok(());
        }
        self.state = from.transition(next)?;
        info!("Session state: {} -> {}", from, next);
        self.state_tx.send_replace(next);
        self.events
            .publish(SessionEvent::StateChanged { from, to: next });
        Ok(())
    }

    fn room(&self) -> Result<String> {
        self.room_id
            .clone()
            .ok_or_else(|| AppError::InvalidState("not in a room".into()))
    }

    // ========================================================================
    // Join
    // ========================================================================

    /// Join a room
    ///
    /// Connection-class failures before the room is joined enter fallback
    /// mode when it is enabled; any other failure tears the session down and
    /// leaves it `failed`. Cancelling `cancel` aborts the attempt and returns
    /// the session to `idle`.
    pub async fn join(&mut self, room_id: &str, cancel: &CancellationToken) -> Result<JoinOutcome> {
        if !self.state.can_join() {
            return Err(AppError::InvalidState(format!(
                "cannot join while {}",
                self.state
            )));
        }
        self.warning = None;
        self.last_error = None;
        self.start_join(room_id, cancel).await
    }

    /// Join with a token that [`super::SessionHandle::leave`] can cancel
    pub(crate) async fn join_tracked(&mut self, room_id: &str) -> Result<JoinOutcome> {
        let cancel = self.begin_join();
        let outcome = self.join(room_id, &cancel).await;
        self.join_slot.lock().take();
        outcome
    }

    async fn start_join(&mut self, room_id: &str, cancel: &CancellationToken) -> Result<JoinOutcome> {
        self.generation += 1;
        self.transports.reset();
        self.device = Device::new();
        self.room_id = Some(room_id.to_string());
        self.set_state(SessionState::Connecting)?;
        info!("Joining room {} as {}", room_id, self.identity.display_name);

        match self.run_join(room_id, cancel).await {
            Ok(()) => {
                self.set_state(SessionState::Active)?;
                info!(
                    "Joined room {}: {} peers, {} producers",
                    room_id,
                    self.peers.peers().len(),
                    self.producers.len()
                );
                Ok(JoinOutcome::Active)
            }
            Err(AppError::Cancelled) => {
                info!("Join of room {} cancelled", room_id);
                self.leave().await;
                Err(AppError::Cancelled)
            }
            Err(e)
                if e.class() == ErrorClass::Connection
                    && self.config.fallback.enabled
                    && matches!(
                        self.state,
                        SessionState::Connecting | SessionState::NegotiatingCapabilities
                    ) =>
            {
                let warning = self.enter_fallback(&e).await?;
                Ok(JoinOutcome::Degraded { warning })
            }
            Err(e) => {
                self.fail(&e).await;
                Err(e)
            }
        }
    }

    async fn run_join(&mut self, room_id: &str, cancel: &CancellationToken) -> Result<()> {
        // Signaling
        let credentials = Credentials {
            token: self.identity.token.clone(),
            peer_id: self.identity.peer_id.clone(),
            display_name: self.identity.display_name.clone(),
            role: self.identity.role.clone(),
        };
        let connection = cancellable(cancel, self.channel.connect(&credentials)).await??;
        if !connection.ack.peer_id.is_empty() {
            self.identity.peer_id = connection.ack.peer_id.clone();
        }
        if !connection.ack.role.is_empty() {
            self.identity.role = connection.ack.role.clone();
        }
        self.spawn_forwarder(connection.events);
        self.set_state(SessionState::NegotiatingCapabilities)?;

        // Capabilities
        let router =
            cancellable(cancel, fetch_router_capabilities(self.channel.as_ref(), room_id)).await??;
        self.device
            .load(router, &self.backend.native_capabilities())?;
        self.set_state(SessionState::JoiningRoom)?;

        // Room
        let rtp_capabilities = self.device.rtp_capabilities()?.clone();
        let response: JoinRoomResponse = cancellable(
            cancel,
            call(
                self.channel.as_ref(),
                Request::JoinRoom {
                    room_id: room_id.to_string(),
                    user_name: self.identity.display_name.clone(),
                    user_role: self.identity.role.clone(),
                    rtp_capabilities,
                },
            ),
        )
        .await??;
        if response.joined == Some(false) {
            return Err(AppError::Rejected {
                method: "joinRoom".into(),
                reason: "server refused to join".into(),
            });
        }
        self.joined_room = true;
        if let Some(peer_id) = response.peer_id.clone().filter(|id| !id.is_empty()) {
            debug!("Server assigned peer id {}", peer_id);
            self.identity.peer_id = peer_id;
        }

        // Transports
        let ice_servers = cancellable(cancel, self.ice.resolve(self.identity.token.as_deref())).await?;
        for direction in [TransportDirection::Send, TransportDirection::Recv] {
            let transport = cancellable(
                cancel,
                Transport::create(
                    self.channel.as_ref(),
                    &self.backend,
                    room_id,
                    direction,
                    ice_servers.clone(),
                ),
            )
            .await??;
            self.spawn_transport_watch(&transport);
            self.transports.install(transport)?;
        }

        // Existing participants
        for info in response.peers {
            if info.peer_id != self.identity.peer_id {
                self.register_peer(info);
            }
        }
        for producer in &response.producers {
            if producer.peer_id == self.identity.peer_id {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }
            self.consume_or_log(producer.announcement()).await?;
        }

        // Local media
        let mut kinds = Vec::new();
        if self.config.media.publish_audio {
            kinds.push(MediaKind::Audio);
        }
        if self.config.media.publish_video {
            kinds.push(MediaKind::Video);
        }
        for kind in kinds {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }
            match self.publish(kind).await {
                Ok(_) => {}
                Err(e) if e.class() == ErrorClass::Negotiation => return Err(e),
                Err(e) => warn!("Joined without {}: {}", kind, e),
            }
        }
        Ok(())
    }

    async fn enter_fallback(&mut self, cause: &AppError) -> Result<String> {
        warn!("Signaling unavailable, entering fallback mode: {}", cause);
        self.teardown(false).await;
        self.set_state(SessionState::Degraded)?;

        let warning = degraded_warning(cause);
        self.warning = Some(warning.clone());
        self.last_error = Some(cause.to_string());
        self.events.publish(SessionEvent::Degraded {
            warning: warning.clone(),
        });

        for peer in placeholder_peers(self.config.fallback.placeholder_peers) {
            self.events.publish(SessionEvent::PeerJoined {
                peer_id: peer.id().to_string(),
                name: peer.name().to_string(),
                role: peer.role().to_string(),
            });
            self.peers.add_peer(peer);
        }
        Ok(warning)
    }

    /// Tear down after a fatal error and record it
    async fn fail(&mut self, error: &AppError) {
        error!("Session failed: {}", error);
        self.teardown(true).await;
        self.last_error = Some(error.to_string());
        self.events.publish(SessionEvent::Error {
            class: error.class(),
            message: error.to_string(),
        });
        if let Err(e) = self.set_state(SessionState::Failed) {
            warn!("{}", e);
        }
    }

    // ========================================================================
    // Leave / teardown
    // ========================================================================

    /// Leave the room; a no-op when idle
    pub async fn leave(&mut self) {
        if matches!(self.state, SessionState::Idle | SessionState::Leaving) {
            return;
        }
        if let Err(e) = self.set_state(SessionState::Leaving) {
            warn!("{}", e);
            return;
        }
        self.teardown(true).await;
        self.room_id = None;
        self.warning = None;
        if let Err(e) = self.set_state(SessionState::Idle) {
            warn!("{}", e);
        }
        info!("Left room");
    }

    /// Release every resource of the current session
    ///
    /// Transports stay recorded as closed until the next join.
    async fn teardown(&mut self, notify_server: bool) {
        self.generation += 1;
        self.departed.clear();
        for task in self.tasks.drain(..) {
            task.abort();
        }

        for producer in self.producers.drain() {
            producer.track().stop();
            self.backend
                .stop_sending(producer.transport_id(), producer.track().id())
                .await;
            self.events.publish(SessionEvent::ProducerClosed {
                producer_id: producer.id().to_string(),
                kind: producer.kind(),
            });
        }

        for consumer in self.peers.clear() {
            consumer.close();
            self.events.publish(SessionEvent::ConsumerClosed {
                peer_id: consumer.peer_id().to_string(),
                consumer_id: consumer.id().to_string(),
            });
        }

        self.transports.close_all(&self.backend).await;

        if notify_server && self.joined_room && self.channel.is_connected() {
            if let Some(room_id) = self.room_id.clone() {
                if let Err(e) = self.channel.request(Request::LeaveRoom { room_id }).await {
                    warn!("leaveRoom failed: {}", e);
                }
            }
        }
        self.joined_room = false;
        self.channel.disconnect().await;
        self.device = Device::new();
        debug!("Session resources released");
    }

    // ========================================================================
    // Producers
    // ========================================================================

    fn ensure_media_allowed(&self) -> Result<()> {
        match self.state {
            SessionState::Active | SessionState::JoiningRoom => Ok(()),
            state => Err(AppError::InvalidState(format!(
                "media operations are unavailable while {}",
                state
            ))),
        }
    }

    /// Open a local source and publish it; returns the producer id
    ///
    /// An existing producer of the same kind is closed first.
    pub async fn publish(&mut self, kind: MediaKind) -> Result<String> {
        self.ensure_media_allowed()?;
        if !self.device.can_produce(kind) {
            return Err(AppError::CannotProduce(kind));
        }

        let track = match self.devices.open(kind).await {
            Ok(track) => track,
            Err(e) => {
                if let AppError::MediaDevice { reason, .. } = &e {
                    warn!("Cannot open {} source: {}", kind, reason);
                    self.events.publish(SessionEvent::MediaDeviceError {
                        kind,
                        message: reason.clone(),
                    });
                }
                return Err(e);
            }
        };

        if self.producers.contains(kind) {
            self.close_producer(kind).await?;
        }

        let room_id = self.room()?;
        let transport = self.transports.get_mut(TransportDirection::Send)?;
        let producer = match transport
            .produce(self.channel.as_ref(), &self.backend, &room_id, track.clone())
            .await
        {
            Ok(producer) => producer,
            Err(e) => {
                track.stop();
                return Err(e);
            }
        };

        let announced = self
            .channel
            .notify(Notification::ProducerCreated {
                room_id: room_id.clone(),
                producer_id: producer.id().to_string(),
                media_type: kind,
            })
            .await;
        if let Err(e) = announced {
            warn!("Failed to announce {} producer, rolling back: {}", kind, e);
            track.stop();
            self.backend
                .stop_sending(producer.transport_id(), track.id())
                .await;
            if let Err(close_err) = self
                .channel
                .request(Request::CloseProducer {
                    room_id,
                    media_type: kind,
                })
                .await
            {
                warn!("closeProducer rollback for {} failed: {}", kind, close_err);
            }
            return Err(e);
        }

        let producer_id = producer.id().to_string();
        self.spawn_track_watch(&track);
        self.producers.insert(producer);
        info!("Publishing {} as producer {}", kind, producer_id);
        self.events.publish(SessionEvent::ProducerCreated {
            producer_id: producer_id.clone(),
            kind,
        });
        Ok(producer_id)
    }

    /// Stop publishing a kind; a no-op when nothing is published
    pub async fn close_producer(&mut self, kind: MediaKind) -> Result<()> {
        let Some(producer) = self.producers.remove(kind) else {
            debug!("No {} producer to close", kind);
            return Ok(());
        };

        producer.track().stop();
        self.backend
            .stop_sending(producer.transport_id(), producer.track().id())
            .await;

        if let Some(room_id) = self.room_id.clone() {
            if self.channel.is_connected() {
                if let Err(e) = self
                    .channel
                    .request(Request::CloseProducer {
                        room_id,
                        media_type: kind,
                    })
                    .await
                {
                    warn!("closeProducer for {} failed: {}", kind, e);
                }
            }
        }

        info!("Closed {} producer {}", kind, producer.id());
        self.events.publish(SessionEvent::ProducerClosed {
            producer_id: producer.id().to_string(),
            kind,
        });
        Ok(())
    }

    /// Pause or resume a producer; the local change is reverted if the server refuses
    pub async fn set_producer_paused(&mut self, kind: MediaKind, paused: bool) -> Result<()> {
        self.ensure_media_allowed()?;
        let Some(producer) = self.producers.get_mut(kind) else {
            debug!("No {} producer to {}", kind, if paused { "pause" } else { "resume" });
            return Ok(());
        };
        if producer.is_paused() == paused {
            return Ok(());
        }
        producer.set_paused(paused);

        let room_id = self.room()?;
        let request = if paused {
            Request::PauseProducer {
                room_id,
                media_type: kind,
            }
        } else {
            Request::ResumeProducer {
                room_id,
                media_type: kind,
            }
        };
        if let Err(e) = self.channel.request(request).await {
            if let Some(producer) = self.producers.get_mut(kind) {
                producer.set_paused(!paused);
            }
            return Err(e);
        }

        self.events.publish(if paused {
            SessionEvent::ProducerPaused { kind }
        } else {
            SessionEvent::ProducerResumed { kind }
        });
        Ok(())
    }

    // ========================================================================
    // Consumers
    // ========================================================================

    /// Consume a remote producer and place it under its peer
    pub async fn consume(&mut self, announcement: ProducerAnnouncement) -> Result<()> {
        if self.peers.has_producer(&announcement.producer_id) {
            debug!("Producer {} already consumed", announcement.producer_id);
            return Ok(());
        }
        if !self.device.can_consume(announcement.media_type, None) {
            return Err(AppError::CannotConsume {
                producer_id: announcement.producer_id.clone(),
                reason: format!("no local {} codec", announcement.media_type),
            });
        }

        let room_id = self.room()?;
        let rtp_capabilities = self.device.rtp_capabilities()?.clone();
        let transport = self.transports.get_mut(TransportDirection::Recv)?;
        let consumer = transport
            .consume(
                self.channel.as_ref(),
                &self.backend,
                &room_id,
                &rtp_capabilities,
                &announcement,
            )
            .await?;

        if let Err(e) = self
            .channel
            .request(Request::ResumeConsumer {
                room_id,
                consumer_id: consumer.id().to_string(),
            })
            .await
        {
            warn!("Failed to resume consumer {}: {}", consumer.id(), e);
        }

        let info = consumer.info();
        match self.peers.attach(consumer) {
            Placement::Attached => self.announce_consumer(&info),
            Placement::Pending => {}
            Placement::Duplicate(consumer) => {
                debug!("Dropping duplicate consumer {}", consumer.id());
                consumer.close();
            }
        }
        Ok(())
    }

    /// Consume, treating per-operation failures as non-fatal
    async fn consume_or_log(&mut self, announcement: ProducerAnnouncement) -> Result<()> {
        let producer_id = announcement.producer_id.clone();
        match self.consume(announcement).await {
            Err(e) if e.class() == ErrorClass::Negotiation => Err(e),
            Err(e) => {
                warn!("Failed to consume producer {}: {}", producer_id, e);
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    /// Ask the server to resume a consumer; unknown ids are ignored
    pub async fn resume_consumer(&mut self, consumer_id: &str) -> Result<()> {
        if self.peers.consumer(consumer_id).is_none() {
            debug!("Consumer {} not found, nothing to resume", consumer_id);
            return Ok(());
        }
        let room_id = self.room()?;
        self.channel
            .request(Request::ResumeConsumer {
                room_id,
                consumer_id: consumer_id.to_string(),
            })
            .await?;
        Ok(())
    }

    fn announce_consumer(&self, info: &ConsumerInfo) {
        self.events.publish(SessionEvent::NewConsumer {
            peer_id: info.peer_id.clone(),
            consumer_id: info.id.clone(),
            producer_id: info.producer_id.clone(),
            kind: info.kind,
        });
    }

    fn register_peer(&mut self, info: PeerInfo) {
        let known = self.peers.contains(&info.peer_id);
        let drained = self
            .peers
            .add_peer(Peer::new(&info.peer_id, &info.peer_name, &info.role));
        if !known {
            self.events.publish(SessionEvent::PeerJoined {
                peer_id: info.peer_id.clone(),
                name: info.peer_name.clone(),
                role: info.role.clone(),
            });
        }
        for consumer_id in drained {
            if let Some(consumer) = self.peers.consumer(&consumer_id) {
                self.announce_consumer(&consumer.info());
            }
        }
    }

    /// Send a chat message to the room
    pub async fn send_chat(&mut self, text: &str) -> Result<()> {
        if self.state != SessionState::Active {
            return Err(AppError::InvalidState(format!(
                "cannot chat while {}",
                self.state
            )));
        }
        self.channel
            .notify(Notification::ChatMessage {
                room_id: self.room()?,
                user_name: self.identity.display_name.clone(),
                message: text.to_string(),
            })
            .await
    }

    // ========================================================================
    // Internal messages
    // ========================================================================

    pub(crate) async fn handle_internal(&mut self, message: Internal) {
        if message.generation != self.generation {
            trace!("Dropping stale message {:?}", message.kind);
            return;
        }
        match message.kind {
            InternalKind::Channel(ChannelEvent::Server(event)) => {
                self.handle_server_event(event).await
            }
            InternalKind::Channel(ChannelEvent::Reconnecting { attempt, max }) => {
                warn!("Signaling reconnecting ({}/{})", attempt, max);
                self.events.publish(SessionEvent::SignalingReconnecting {
                    attempt,
                    max_attempts: max,
                });
            }
            InternalKind::Channel(ChannelEvent::Reconnected) => {
                self.handle_signaling_restored().await
            }
            InternalKind::Channel(ChannelEvent::Closed { reason }) => {
                self.handle_signaling_lost(reason).await
            }
            InternalKind::TrackEnded { kind, track_id } => {
                let current = self
                    .producers
                    .get(kind)
                    .is_some_and(|p| p.track().id() == track_id);
                if current {
                    info!("Local {} track ended, closing producer", kind);
                    if let Err(e) = self.close_producer(kind).await {
                        warn!("Failed to close ended {} producer: {}", kind, e);
                    }
                }
            }
            InternalKind::TransportFailed { direction } => {
                if matches!(
                    self.state,
                    SessionState::Active | SessionState::JoiningRoom
                ) {
                    let error = AppError::transport(direction, "connectivity failed");
                    self.fail(&error).await;
                }
            }
        }
    }

    /// The server dropped our room state with the old socket; rejoin from scratch
    async fn handle_signaling_restored(&mut self) {
        if self.state != SessionState::Active {
            debug!("Signaling restored while {}", self.state);
            return;
        }
        let Some(room_id) = self.room_id.clone() else {
            return;
        };
        info!("Signaling connection restored, rejoining room {}", room_id);

        self.teardown(true).await;
        let cancel = self.begin_join();
        let outcome = self.start_join(&room_id, &cancel).await;
        self.join_slot.lock().take();
        match outcome {
            Ok(JoinOutcome::Active) => info!("Rejoined room {}", room_id),
            Ok(JoinOutcome::Degraded { .. }) => {}
            Err(e) => warn!("Rejoining room {} failed: {}", room_id, e),
        }
    }

    async fn handle_signaling_lost(&mut self, reason: String) {
        if self.state != SessionState::Active {
            debug!("Signaling closed while {}: {}", self.state, reason);
            return;
        }
        let cause = AppError::Connection(reason);
        if self.config.fallback.enabled {
            if let Err(e) = self.enter_fallback(&cause).await {
                warn!("Cannot enter fallback mode: {}", e);
            }
        } else {
            self.fail(&cause).await;
        }
    }

    async fn handle_server_event(&mut self, event: ServerEvent) {
        if self.state != SessionState::Active {
            debug!("Ignoring {} while {}", event.name(), self.state);
            return;
        }
        match event {
            ServerEvent::ConnectionAck(_) => debug!("Ignoring late connection_ack"),
            ServerEvent::UserJoined(info) => {
                if info.peer_id != self.identity.peer_id {
                    self.departed.remove(&info.peer_id);
                    self.register_peer(info);
                }
            }
            ServerEvent::UserLeft(left) => {
                self.departed.insert(left.peer_id.clone());
                let known = self.peers.contains(&left.peer_id);
                if let Some((_, consumers)) = self.peers.remove_peer(&left.peer_id) {
                    for consumer in consumers {
                        consumer.close();
                        self.events.publish(SessionEvent::ConsumerClosed {
                            peer_id: left.peer_id.clone(),
                            consumer_id: consumer.id().to_string(),
                        });
                    }
                }
                if known {
                    self.events.publish(SessionEvent::PeerLeft {
                        peer_id: left.peer_id,
                    });
                }
            }
            ServerEvent::NewProducer(announcement) => {
                if announcement.peer_id == self.identity.peer_id {
                    return;
                }
                if self.departed.contains(&announcement.peer_id) {
                    debug!(
                        "Dropping producer {} of departed peer {}",
                        announcement.producer_id, announcement.peer_id
                    );
                    return;
                }
                if let Err(e) = self.consume_or_log(announcement).await {
                    self.fail(&e).await;
                }
            }
            ServerEvent::ProducerPaused(notice) => self.mark_remote(notice, true),
            ServerEvent::ProducerResumed(notice) => self.mark_remote(notice, false),
            ServerEvent::ProducerClosed(notice) => {
                for consumer in self.peers.take_matching(&notice.peer_id, notice.media_type) {
                    consumer.close();
                    self.events.publish(SessionEvent::ConsumerClosed {
                        peer_id: notice.peer_id.clone(),
                        consumer_id: consumer.id().to_string(),
                    });
                }
            }
            ServerEvent::ChatMessage(message) => self.publish_chat(message),
        }
    }

    fn mark_remote(&mut self, notice: ProducerNotice, paused: bool) {
        for consumer_id in self.peers.set_paused(&notice.peer_id, notice.media_type, paused) {
            let peer_id = notice.peer_id.clone();
            self.events.publish(if paused {
                SessionEvent::ConsumerPaused {
                    peer_id,
                    consumer_id,
                }
            } else {
                SessionEvent::ConsumerResumed {
                    peer_id,
                    consumer_id,
                }
            });
        }
    }

    fn publish_chat(&self, message: ChatMessage) {
        let timestamp = message
            .timestamp
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        self.events.publish(SessionEvent::ChatMessage {
            peer_id: message.peer_id,
            sender: message.sender,
            message: message.message,
            timestamp,
        });
    }

    // ========================================================================
    // Background watchers
    // ========================================================================

    fn track_task(&mut self, task: JoinHandle<()>) {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(task);
    }

    fn spawn_forwarder(&mut self, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
        let tx = self.internal_tx.clone();
        let generation = self.generation;
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let message = Internal {
                    generation,
                    kind: InternalKind::Channel(event),
                };
                if tx.send(message).is_err() {
                    break;
                }
            }
        });
        self.track_task(task);
    }

    fn spawn_track_watch(&mut self, track: &LocalTrack) {
        let tx = self.internal_tx.clone();
        let generation = self.generation;
        let track = track.clone();
        let task = tokio::spawn(async move {
            if track.wait_ended().await {
                let _ = tx.send(Internal {
                    generation,
                    kind: InternalKind::TrackEnded {
                        kind: track.kind(),
                        track_id: track.id().to_string(),
                    },
                });
            }
        });
        self.track_task(task);
    }

    fn spawn_transport_watch(&mut self, transport: &Transport) {
        let tx = self.internal_tx.clone();
        let generation = self.generation;
        let direction = transport.direction();
        let mut link = transport.link_watch();
        let task = tokio::spawn(async move {
            loop {
                let state = *link.borrow_and_update();
                match state {
                    LinkState::Failed => {
                        let _ = tx.send(Internal {
                            generation,
                            kind: InternalKind::TransportFailed { direction },
                        });
                        return;
                    }
                    LinkState::Closed => return,
                    _ => {}
                }
                if link.changed().await.is_err() {
                    return;
                }
            }
        });
        self.track_task(task);
    }
}

/// Run `future` unless `cancel` fires first
async fn cancellable<F: Future>(cancel: &CancellationToken, future: F) -> Result<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AppError::Cancelled),
        output = future => Ok(output),
    }
}
