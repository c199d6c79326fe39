//! Room session
//!
//! [`SessionHandle`] is the public entry point. It owns no state itself: every
//! call is forwarded to a single task that owns the [`Session`] and processes
//! commands and signaling events in arrival order.

pub mod fallback;
pub mod orchestrator;
pub mod state;

pub use orchestrator::{JoinOutcome, MediaStack, Session, SessionSnapshot};
pub use state::SessionState;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::events::{EventBus, SessionEvent};
use crate::media::MediaKind;
use crate::signaling::SignalingChannel;
use orchestrator::Internal;

/// Pending command capacity
const COMMAND_CAPACITY: usize = 32;

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Join {
        room_id: String,
        reply: Reply<JoinOutcome>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
    Publish {
        kind: MediaKind,
        reply: Reply<String>,
    },
    CloseProducer {
        kind: MediaKind,
        reply: Reply<()>,
    },
    SetProducerPaused {
        kind: MediaKind,
        paused: bool,
        reply: Reply<()>,
    },
    ResumeConsumer {
        consumer_id: String,
        reply: Reply<()>,
    },
    SendChat {
        text: String,
        reply: Reply<()>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
}

/// Cloneable handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    /// Token of the join the session task is running, if any
    running_join: Arc<Mutex<Option<CancellationToken>>>,
    state: watch::Receiver<SessionState>,
    events: EventBus,
}

impl SessionHandle {
    /// Start the session task
    ///
    /// The task runs until every handle is dropped, leaving the room first.
    pub fn spawn(
        config: AppConfig,
        channel: Arc<dyn SignalingChannel>,
        media: MediaStack,
        events: EventBus,
    ) -> Self {
        let (session, internal_rx) = Session::new(config, channel, media, events.clone());
        let state = session.state_watch();
        let running_join = session.join_slot();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        tokio::spawn(run(session, internal_rx, commands_rx));

        Self {
            commands: commands_tx,
            running_join,
            state,
            events,
        }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| AppError::InvalidState("session task has stopped".into()))?;
        rx.await
            .map_err(|_| AppError::InvalidState("session task dropped the request".into()))
    }

    /// Join a room; see [`Session::join`]
    pub async fn join(&self, room_id: &str) -> Result<JoinOutcome> {
        let room_id = room_id.to_string();
        self.request(|reply| Command::Join { room_id, reply })
            .await?
    }

    /// Leave the room, aborting the join the session task is running
    ///
    /// Joins still queued behind it run afterwards.
    pub async fn leave(&self) -> Result<()> {
        if let Some(cancel) = self.running_join.lock().as_ref() {
            cancel.cancel();
        }
        self.request(|reply| Command::Leave { reply }).await
    }

    /// Publish a local source; returns the producer id
    pub async fn publish(&self, kind: MediaKind) -> Result<String> {
        self.request(|reply| Command::Publish { kind, reply }).await?
    }

    pub async fn close_producer(&self, kind: MediaKind) -> Result<()> {
        self.request(|reply| Command::CloseProducer { kind, reply })
            .await?
    }

    pub async fn pause_producer(&self, kind: MediaKind) -> Result<()> {
        self.request(|reply| Command::SetProducerPaused {
            kind,
            paused: true,
            reply,
        })
        .await?
    }

    pub async fn resume_producer(&self, kind: MediaKind) -> Result<()> {
        self.request(|reply| Command::SetProducerPaused {
            kind,
            paused: false,
            reply,
        })
        .await?
    }

    pub async fn resume_consumer(&self, consumer_id: &str) -> Result<()> {
        let consumer_id = consumer_id.to_string();
        self.request(|reply| Command::ResumeConsumer { consumer_id, reply })
            .await?
    }

    pub async fn send_chat(&self, text: &str) -> Result<()> {
        let text = text.to_string();
        self.request(|reply| Command::SendChat { text, reply })
            .await?
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Current state without a round trip to the session task
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

/// Session task
async fn run(
    mut session: Session,
    mut internal_rx: mpsc::UnboundedReceiver<Internal>,
    mut commands_rx: mpsc::Receiver<Command>,
) {
    loop {
        tokio::select! {
            command = commands_rx.recv() => match command {
                Some(command) => dispatch(&mut session, command).await,
                None => break,
            },
            Some(message) = internal_rx.recv() => session.handle_internal(message).await,
        }
    }

    debug!("All session handles dropped");
    session.leave().await;
    info!("Session task stopped");
}

async fn dispatch(session: &mut Session, command: Command) {
    match command {
        Command::Join { room_id, reply } => {
            let _ = reply.send(session.join_tracked(&room_id).await);
        }
        Command::Leave { reply } => {
            session.leave().await;
            let _ = reply.send(());
        }
        Command::Publish { kind, reply } => {
            let _ = reply.send(session.publish(kind).await);
        }
        Command::CloseProducer { kind, reply } => {
            let _ = reply.send(session.close_producer(kind).await);
        }
        Command::SetProducerPaused {
            kind,
            paused,
            reply,
        } => {
            let _ = reply.send(session.set_producer_paused(kind, paused).await);
        }
        Command::ResumeConsumer { consumer_id, reply } => {
            let _ = reply.send(session.resume_consumer(&consumer_id).await);
        }
        Command::SendChat { text, reply } => {
            let _ = reply.send(session.send_chat(&text).await);
        }
        Command::Snapshot { reply } => {
            let _ = reply.send(session.snapshot());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SyntheticMedia;
    use crate::signaling::fake::FakeChannel;
    use std::time::Duration;

    fn spawn_session() -> (SessionHandle, Arc<FakeChannel>) {
        let mut config = AppConfig::default();
        config.identity.peer_id = Some("me".into());
        let channel = Arc::new(FakeChannel::sfu());
        let media = Arc::new(SyntheticMedia::new());
        let stack = MediaStack {
            devices: media.clone(),
            backend: media,
        };
        let handle = SessionHandle::spawn(config, channel.clone(), stack, EventBus::new());
        (handle, channel)
    }

    async fn wait_for(handle: &SessionHandle, state: SessionState) {
        let mut watch = handle.state_watch();
        tokio::time::timeout(Duration::from_secs(1), watch.wait_for(|s| *s == state))
            .await
            .expect("state not reached")
            .expect("session task stopped");
    }

    #[tokio::test]
    async fn test_join_and_leave_through_handle() {
        let (handle, channel) = spawn_session();
        let mut events = handle.subscribe();

        assert_eq!(handle.join("R1").await.unwrap(), JoinOutcome::Active);
        assert_eq!(handle.state(), SessionState::Active);
        assert_eq!(handle.snapshot().await.unwrap().producers.len(), 2);

        handle.pause_producer(MediaKind::Video).await.unwrap();
        handle.resume_producer(MediaKind::Video).await.unwrap();
        assert!(handle
            .snapshot()
            .await
            .unwrap()
            .producers
            .iter()
            .all(|p| !p.paused));
        handle.send_chat("hi").await.unwrap();

        handle.leave().await.unwrap();
        assert_eq!(handle.state(), SessionState::Idle);
        assert_eq!(channel.count("leaveRoom"), 1);

        let first = events.recv().await.unwrap();
        assert_eq!(
            first,
            SessionEvent::StateChanged {
                from: SessionState::Idle,
                to: SessionState::Connecting
            }
        );
    }

    #[tokio::test]
    async fn test_leave_cancels_pending_join() {
        let (handle, channel) = spawn_session();
        let _gate = channel.gate("joinRoom");

        let joining = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.join("R1").await })
        };
        wait_for(&handle, SessionState::JoiningRoom).await;

        handle.leave().await.unwrap();
        let result = joining.await.unwrap();
        assert!(matches!(result, Err(AppError::Cancelled)));
        assert_eq!(handle.state(), SessionState::Idle);
        assert_eq!(channel.count("createWebRtcTransport"), 0);
        assert_eq!(channel.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_leave_cancels_the_running_join_not_a_queued_one() {
        let (first, channel) = spawn_session();
        let second = first.clone();
        let gate = channel.gate("joinRoom");

        let running = {
            let handle = first.clone();
            tokio::spawn(async move { handle.join("R1").await })
        };
        wait_for(&first, SessionState::JoiningRoom).await;

        // Queued behind the running join
        let queued = {
            let handle = second.clone();
            tokio::spawn(async move { handle.join("R2").await })
        };
        tokio::task::yield_now().await;

        let leaving = {
            let handle = first.clone();
            tokio::spawn(async move { handle.leave().await })
        };
        let result = tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .expect("running join was not cancelled")
            .unwrap();
        assert!(matches!(result, Err(AppError::Cancelled)));

        // The queued join runs on its own token and completes
        wait_for(&second, SessionState::JoiningRoom).await;
        gate.notify_one();
        assert_eq!(queued.await.unwrap().unwrap(), JoinOutcome::Active);

        // The leave itself is processed after it
        leaving.await.unwrap().unwrap();
        assert_eq!(second.state(), SessionState::Idle);
        assert_eq!(channel.count("joinRoom"), 2);
        assert_eq!(channel.count("leaveRoom"), 1);
    }

    #[tokio::test]
    async fn test_operations_require_a_session() {
        let (handle, _channel) = spawn_session();
        assert!(handle.publish(MediaKind::Audio).await.is_err());
        assert!(handle.send_chat("hello").await.is_err());
        // Leaving while idle is a no-op
        handle.leave().await.unwrap();
        assert_eq!(handle.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_join_while_active_is_rejected() {
        let (handle, _channel) = spawn_session();
        handle.join("R1").await.unwrap();
        let err = handle.join("R2").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));
        assert_eq!(handle.snapshot().await.unwrap().room_id.as_deref(), Some("R1"));
    }
}
