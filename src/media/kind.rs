use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Locally published or remotely consumed media unit kind
///
/// `Screen` is independent from `Video`: a screen share never replaces the
/// camera producer, both may be active at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
    Screen,
}

/// RTP-level kind carried on the wire (screen shares travel as video)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireKind {
    Audio,
    Video,
}

impl MediaKind {
    pub const ALL: [MediaKind; 3] = [MediaKind::Audio, MediaKind::Video, MediaKind::Screen];

    pub fn wire_kind(self) -> WireKind {
        match self {
            MediaKind::Audio => WireKind::Audio,
            MediaKind::Video | MediaKind::Screen => WireKind::Video,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Screen => "screen",
        }
    }
}

impl WireKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WireKind::Audio => "audio",
            WireKind::Video => "video",
        }
    }
}

impl From<WireKind> for MediaKind {
    fn from(kind: WireKind) -> Self {
        match kind {
            WireKind::Audio => MediaKind::Audio,
            WireKind::Video => MediaKind::Video,
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for WireKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "audio" | "mic" | "microphone" => Ok(MediaKind::Audio),
            "video" | "camera" | "webcam" => Ok(MediaKind::Video),
            "screen" | "screenshare" => Ok(MediaKind::Screen),
            other => Err(format!("unknown media kind: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_screen_travels_as_video() {
        assert_eq!(MediaKind::Screen.wire_kind(), WireKind::Video);
        assert_eq!(MediaKind::Video.wire_kind(), WireKind::Video);
        assert_eq!(MediaKind::Audio.wire_kind(), WireKind::Audio);
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(serde_json::to_string(&MediaKind::Screen).unwrap(), "\"screen\"");
        let kind: MediaKind = serde_json::from_str("\"audio\"").unwrap();
        assert_eq!(kind, MediaKind::Audio);
        assert!(serde_json::from_str::<MediaKind>("\"vidoe\"").is_err());
    }

    #[test]
    fn test_from_str_aliases() {
        assert_eq!("camera".parse::<MediaKind>().unwrap(), MediaKind::Video);
        assert_eq!("MIC".parse::<MediaKind>().unwrap(), MediaKind::Audio);
        assert!("hologram".parse::<MediaKind>().is_err());
    }
}
