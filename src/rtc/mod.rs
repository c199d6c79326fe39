//! SFU media session building blocks
//!
//! ```text
//! Device (capabilities) ──> TransportPair ──┬─> send transport ──> ProducerRegistry
//!                                          └─> recv transport ──> PeerRegistry
//!                                                                  ├─ peers ─> consumers
//!                                                                  └─ pending consumers
//! ```
//!
//! These types hold state and perform single negotiation steps; ordering and
//! error policy belong to the session orchestrator.

pub mod capabilities;
pub mod consumer;
pub mod ice;
pub mod peer;
pub mod producer;
pub mod transport;

pub use capabilities::Device;
pub use consumer::Consumer;
pub use ice::{IceServer, IceServerClient};
pub use peer::{Peer, PeerRegistry, Placement};
pub use producer::{Producer, ProducerRegistry};
pub use transport::{Transport, TransportDirection, TransportPair, TransportState};
