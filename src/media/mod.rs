//! Local and remote media handles
//!
//! The session never touches capture devices or the RTP stack directly.
//! Two seams isolate them:
//! - [`MediaDevices`] opens camera, microphone and screen tracks
//! - [`MediaBackend`] runs ICE/DTLS transports and binds tracks to them
//!
//! [`SyntheticMedia`] implements both without real media and backs the
//! headless CLI, fallback mode and the test suite.

pub mod backend;
pub mod devices;
pub mod kind;
pub mod synthetic;
pub mod track;

pub use backend::{LinkState, MediaBackend, TransportLink, TransportOptions};
pub use devices::MediaDevices;
pub use kind::{MediaKind, WireKind};
pub use synthetic::SyntheticMedia;
pub use track::{LocalTrack, RemoteTrack, TrackState};
