//! Local producers

use std::collections::BTreeMap;

use serde::Serialize;

use crate::media::{LocalTrack, MediaKind};

/// A local track being published through the send transport
#[derive(Debug)]
pub struct Producer {
    id: String,
    kind: MediaKind,
    track: LocalTrack,
    transport_id: String,
    paused: bool,
}

impl Producer {
    pub fn new(
        id: impl Into<String>,
        kind: MediaKind,
        track: LocalTrack,
        transport_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            track,
            transport_id: transport_id.into(),
            paused: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn track(&self) -> &LocalTrack {
        &self.track
    }

    pub fn transport_id(&self) -> &str {
        &self.transport_id
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Pause or resume locally; the track's enabled flag follows
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
        self.track.set_enabled(!paused);
    }

    pub fn info(&self) -> ProducerInfo {
        ProducerInfo {
            id: self.id.clone(),
            kind: self.kind,
            track_id: self.track.id().to_string(),
            paused: self.paused,
        }
    }
}

/// Serializable view of a producer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProducerInfo {
    pub id: String,
    pub kind: MediaKind,
    pub track_id: String,
    pub paused: bool,
}

/// At most one producer per media kind
#[derive(Debug, Default)]
pub struct ProducerRegistry {
    producers: BTreeMap<MediaKind, Producer>,
}

impl ProducerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a producer, returning the one it replaced
    pub fn insert(&mut self, producer: Producer) -> Option<Producer> {
        self.producers.insert(producer.kind(), producer)
    }

    pub fn get(&self, kind: MediaKind) -> Option<&Producer> {
        self.producers.get(&kind)
    }

    pub fn get_mut(&mut self, kind: MediaKind) -> Option<&mut Producer> {
        self.producers.get_mut(&kind)
    }

    pub fn remove(&mut self, kind: MediaKind) -> Option<Producer> {
        self.producers.remove(&kind)
    }

    pub fn contains(&self, kind: MediaKind) -> bool {
        self.producers.contains_key(&kind)
    }

    /// Remove every producer
    pub fn drain(&mut self) -> Vec<Producer> {
        std::mem::take(&mut self.producers).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    pub fn snapshot(&self) -> Vec<ProducerInfo> {
        self.producers.values().map(Producer::info).collect()
    }
}
