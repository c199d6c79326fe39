//! Remote peers and their consumers
//!
//! Producer announcements can overtake the matching peer announcement. A
//! consumer whose peer is not known yet is parked in a pending buffer keyed
//! by peer id and moved into the peer when it registers. A consumer is
//! either attached to exactly one peer or pending, never both.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, info};

use super::consumer::{Consumer, ConsumerInfo};
use crate::media::MediaKind;

/// A remote room participant
#[derive(Debug)]
pub struct Peer {
    id: String,
    name: String,
    role: String,
    placeholder: bool,
    consumers: Vec<Consumer>,
}

impl Peer {
    pub fn new(id: impl Into<String>, name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role: role.into(),
            placeholder: false,
            consumers: Vec::new(),
        }
    }

    /// A media-less stand-in shown while signaling is unavailable
    pub fn placeholder(id: impl Into<String>, name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            placeholder: true,
            ..Self::new(id, name, role)
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn is_placeholder(&self) -> bool {
        self.placeholder
    }

    pub fn consumers(&self) -> &[Consumer] {
        &self.consumers
    }

    pub fn info(&self) -> PeerSnapshot {
        PeerSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            role: self.role.clone(),
            placeholder: self.placeholder,
            consumers: self.consumers.iter().map(Consumer::info).collect(),
        }
    }
}

/// Serializable view of a peer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerSnapshot {
    pub id: String,
    pub name: String,
    pub role: String,
    pub placeholder: bool,
    pub consumers: Vec<ConsumerInfo>,
}

/// Where [`PeerRegistry::attach`] put a consumer
#[derive(Debug)]
pub enum Placement {
    /// Attached to a known peer; announce it
    Attached,
    /// Peer not known yet; parked until it joins
    Pending,
    /// Same producer already consumed; the consumer is handed back
    Duplicate(Consumer),
}

/// Peers in join order plus the pending-consumer buffer
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Vec<Peer>,
    pending: HashMap<String, Vec<Consumer>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer and move its pending consumers into it
    ///
    /// Returns the ids of the consumers that were drained, in arrival order.
    /// Registering an already known peer updates its name and role.
    pub fn add_peer(&mut self, peer: Peer) -> Vec<String> {
        let drained = self.pending.remove(peer.id()).unwrap_or_default();
        let ids: Vec<String> = drained.iter().map(|c| c.id().to_string()).collect();

        match self.peers.iter_mut().find(|p| p.id == peer.id) {
            Some(existing) => {
                debug!("Peer {} already registered, updating info", peer.id);
                existing.name = peer.name;
                existing.role = peer.role;
                existing.placeholder = peer.placeholder;
                existing.consumers.extend(drained);
            }
            None => {
                let mut peer = peer;
                info!("Peer joined: {} ({})", peer.name, peer.id);
                peer.consumers.extend(drained);
                self.peers.push(peer);
            }
        }

        if !ids.is_empty() {
            debug!("Drained {} pending consumers", ids.len());
        }
        ids
    }

    /// Attach a consumer to its peer, or park it if the peer is unknown
    pub fn attach(&mut self, consumer: Consumer) -> Placement {
        if self.has_producer(consumer.producer_id()) {
            return Placement::Duplicate(consumer);
        }
        match self.peers.iter_mut().find(|p| p.id == consumer.peer_id()) {
            Some(peer) => {
                peer.consumers.push(consumer);
                Placement::Attached
            }
            None => {
                debug!(
                    "Peer {} unknown, buffering consumer {}",
                    consumer.peer_id(),
                    consumer.id()
                );
                self.pending
                    .entry(consumer.peer_id().to_string())
                    .or_default()
                    .push(consumer);
                Placement::Pending
            }
        }
    }

    /// Whether any attached or pending consumer already targets the producer
    pub fn has_producer(&self, producer_id: &str) -> bool {
        self.all_consumers().any(|c| c.producer_id() == producer_id)
    }

    /// Remove a peer; returns its consumers (attached and pending), not yet closed
    pub fn remove_peer(&mut self, peer_id: &str) -> Option<(Peer, Vec<Consumer>)> {
        let pending = self.pending.remove(peer_id).unwrap_or_default();
        let index = self.peers.iter().position(|p| p.id == peer_id);

        match index {
            Some(index) => {
                let mut peer = self.peers.remove(index);
                let mut consumers = std::mem::take(&mut peer.consumers);
                consumers.extend(pending);
                info!("Peer left: {} ({})", peer.name, peer.id);
                Some((peer, consumers))
            }
            None if !pending.is_empty() => {
                debug!("Dropping {} pending consumers of {}", pending.len(), peer_id);
                Some((Peer::new(peer_id, "", ""), pending))
            }
            None => None,
        }
    }

    /// Detach every consumer of `peer_id` carrying `kind`
    pub fn take_matching(&mut self, peer_id: &str, kind: MediaKind) -> Vec<Consumer> {
        let mut taken = Vec::new();
        if let Some(peer) = self.peers.iter_mut().find(|p| p.id == peer_id) {
            let (matching, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut peer.consumers)
                .into_iter()
                .partition(|c| c.kind() == kind);
            peer.consumers = kept;
            taken = matching;
        }
        if let Some(pending) = self.pending.get_mut(peer_id) {
            let (matching, kept): (Vec<_>, Vec<_>) = std::mem::take(pending)
                .into_iter()
                .partition(|c| c.kind() == kind);
            *pending = kept;
            taken.extend(matching);
            if pending.is_empty() {
                self.pending.remove(peer_id);
            }
        }
        taken
    }

    /// Mark the consumers of `peer_id` carrying `kind`; returns their ids
    pub fn set_paused(&mut self, peer_id: &str, kind: MediaKind, paused: bool) -> Vec<String> {
        self.consumers_mut(peer_id)
            .filter(|c| c.kind() == kind)
            .map(|c| {
                c.set_paused(paused);
                c.id().to_string()
            })
            .collect()
    }

    /// Remove everything; returns all consumers for closing
    pub fn clear(&mut self) -> Vec<Consumer> {
        let mut consumers: Vec<Consumer> = std::mem::take(&mut self.peers)
            .into_iter()
            .flat_map(|p| p.consumers)
            .collect();
        consumers.extend(std::mem::take(&mut self.pending).into_values().flatten());
        consumers
    }

    pub fn peer(&self, peer_id: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == peer_id)
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peer(peer_id).is_some()
    }

    pub fn consumer(&self, consumer_id: &str) -> Option<&Consumer> {
        self.all_consumers().find(|c| c.id() == consumer_id)
    }

    pub fn pending_for(&self, peer_id: &str) -> &[Consumer] {
        self.pending.get(peer_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of buffered consumers across all peers
    pub fn pending_len(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    pub fn pending_snapshot(&self) -> HashMap<String, Vec<ConsumerInfo>> {
        self.pending
            .iter()
            .map(|(peer_id, consumers)| {
                (
                    peer_id.clone(),
                    consumers.iter().map(Consumer::info).collect(),
                )
            })
            .collect()
    }

    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        self.peers.iter().map(Peer::info).collect()
    }

    fn all_consumers(&self) -> impl Iterator<Item = &Consumer> {
        self.peers
            .iter()
            .flat_map(|p| p.consumers.iter())
            .chain(self.pending.values().flatten())
    }

    fn consumers_mut<'a>(&'a mut self, peer_id: &'a str) -> impl Iterator<Item = &'a mut Consumer> {
        self.peers
            .iter_mut()
            .filter(move |p| p.id == peer_id)
            .flat_map(|p| p.consumers.iter_mut())
            .chain(
                self.pending
                    .iter_mut()
                    .filter(move |(id, _)| id.as_str() == peer_id)
                    .flat_map(|(_, consumers)| consumers.iter_mut()),
            )
    }
}
