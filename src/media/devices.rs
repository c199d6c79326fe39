use async_trait::async_trait;

use super::{LocalTrack, MediaKind};
use crate::error::Result;

/// Access to local capture devices
///
/// Implementations report permission and busy-device failures as
/// [`AppError::MediaDevice`](crate::error::AppError::MediaDevice) so they stay
/// distinguishable from network errors.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open a track for the given kind (microphone, camera or screen)
    async fn open(&self, kind: MediaKind) -> Result<LocalTrack>;
}
