//! Media track handles

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use super::MediaKind;

/// Lifecycle of a local track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    /// Source is producing media
    Live,
    /// Stopped by this client (leave, toggle-off, replacement)
    Stopped,
    /// Source went away on its own (permission revoked, OS stopped the share)
    Ended,
}

/// Handle to a locally captured track
///
/// Clones share state. Only an external end (see [`LocalTrack::end`])
/// wakes [`LocalTrack::wait_ended`] with `true`; a local [`LocalTrack::stop`]
/// resolves it with `false` so the session does not react to its own stops.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<LocalTrackInner>,
}

struct LocalTrackInner {
    id: String,
    kind: MediaKind,
    label: String,
    enabled: AtomicBool,
    state: watch::Sender<TrackState>,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, label: impl Into<String>) -> Self {
        let (state, _) = watch::channel(TrackState::Live);
        Self {
            inner: Arc::new(LocalTrackInner {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
                label: label.into(),
                enabled: AtomicBool::new(true),
                state,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn state(&self) -> TrackState {
        *self.inner.state.borrow()
    }

    pub fn is_live(&self) -> bool {
        self.state() == TrackState::Live
    }

    /// Stop the track from this side
    pub fn stop(&self) {
        self.inner.state.send_if_modified(|state| {
            if *state == TrackState::Live {
                *state = TrackState::Stopped;
                true
            } else {
                false
            }
        });
    }

    /// Mark the source as ended externally
    pub fn end(&self) {
        self.inner.state.send_if_modified(|state| {
            if *state == TrackState::Live {
                *state = TrackState::Ended;
                true
            } else {
                false
            }
        });
    }

    /// Wait until the track leaves `Live`; `true` when it ended externally
    pub async fn wait_ended(&self) -> bool {
        let mut rx = self.inner.state.subscribe();
        loop {
            match *rx.borrow_and_update() {
                TrackState::Ended => return true,
                TrackState::Stopped => return false,
                TrackState::Live => {}
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("label", &self.inner.label)
            .field("enabled", &self.is_enabled())
            .field("state", &self.state())
            .finish()
    }
}

/// Handle to a track received from a remote producer
#[derive(Clone, Debug)]
pub struct RemoteTrack {
    inner: Arc<RemoteTrackInner>,
}

#[derive(Debug)]
struct RemoteTrackInner {
    id: String,
    kind: MediaKind,
    closed: AtomicBool,
}

impl RemoteTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            inner: Arc::new(RemoteTrackInner {
                id: id.into(),
                kind,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_external_end_wakes_waiter() {
        let track = LocalTrack::new(MediaKind::Video, "camera");
        let waiter = {
            let track = track.clone();
            tokio::spawn(async move { track.wait_ended().await })
        };
        tokio::task::yield_now().await;
        track.end();
        assert!(waiter.await.unwrap());
        assert_eq!(track.state(), TrackState::Ended);
    }

    #[tokio::test]
    async fn test_local_stop_is_not_an_end() {
        let track = LocalTrack::new(MediaKind::Audio, "mic");
        track.stop();
        assert!(!track.wait_ended().await);
        // A later external end does not override the stop
        track.end();
        assert_eq!(track.state(), TrackState::Stopped);
    }

    #[test]
    fn test_enabled_toggle_shared_between_clones() {
        let track = LocalTrack::new(MediaKind::Video, "camera");
        let clone = track.clone();
        clone.set_enabled(false);
        assert!(!track.is_enabled());
        assert!(track.is_live());
    }
}
