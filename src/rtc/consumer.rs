//! Remote consumers

use serde::Serialize;

use crate::media::{MediaKind, RemoteTrack};

/// A subscription to one remote producer
#[derive(Debug)]
pub struct Consumer {
    id: String,
    producer_id: String,
    peer_id: String,
    kind: MediaKind,
    paused: bool,
    track: RemoteTrack,
}

impl Consumer {
    pub fn new(
        id: impl Into<String>,
        producer_id: impl Into<String>,
        peer_id: impl Into<String>,
        kind: MediaKind,
        track: RemoteTrack,
    ) -> Self {
        Self {
            id: id.into(),
            producer_id: producer_id.into(),
            peer_id: peer_id.into(),
            kind,
            paused: false,
            track,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn track(&self) -> &RemoteTrack {
        &self.track
    }

    pub fn close(&self) {
        self.track.close();
    }

    pub fn info(&self) -> ConsumerInfo {
        ConsumerInfo {
            id: self.id.clone(),
            producer_id: self.producer_id.clone(),
            peer_id: self.peer_id.clone(),
            kind: self.kind,
            paused: self.paused,
        }
    }
}

/// Serializable view of a consumer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumerInfo {
    pub id: String,
    pub producer_id: String,
    pub peer_id: String,
    pub kind: MediaKind,
    pub paused: bool,
}
