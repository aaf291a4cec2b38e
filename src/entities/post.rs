//! Post identity, media source and the per-post playback state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Feed-unique post identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PostId(String);

impl PostId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PostId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PostId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Where a post's media comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaSource {
    pub url: String,
    /// Higher bitrate rendition, used when HD mode is on
    #[serde(default)]
    pub hd_url: Option<String>,
}

impl MediaSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), hd_url: None }
    }

    pub fn with_hd(mut self, hd_url: impl Into<String>) -> Self {
        self.hd_url = Some(hd_url.into());
        self
    }

    /// URL to load for the requested quality (falls back to the base rendition).
    pub fn url_for(&self, quality: Quality) -> &str {
        match (quality, &self.hd_url) {
            (Quality::High, Some(hd)) => hd,
            _ => &self.url,
        }
    }
}

/// Rendition requested from the host when creating a media element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Quality {
    #[default]
    Standard,
    High,
}

/// Host media readiness, ordered from "nothing" to "enough to play through".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum ReadyState {
    #[default]
    HaveNothing,
    HaveMetadata,
    HaveCurrentData,
    HaveFutureData,
    HaveEnoughData,
}

impl ReadyState {
    /// True once the element can keep producing frames after `play()`.
    pub fn can_play(self) -> bool {
        self >= ReadyState::HaveFutureData
    }
}

/// Per-post playback state.
///
/// ```text
/// Idle -> Preloading -> Ready -> Starting -> Playing <-> Paused
///                                   |                      |
///                                   v                      v
///                               TapToPlay               Unloaded
/// (any) -> Failed after the load retry ladder is exhausted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PlaybackState {
    #[default]
    Idle,
    Preloading,
    Ready,
    /// Waiting for readiness or retrying `play()`; holds a play slot
    Starting,
    Playing,
    Paused,
    Unloaded,
    /// Autoplay gave up; the container shows a click-to-play affordance
    TapToPlay,
    /// Permanent load failure; placeholder shown instead of the player
    Failed,
}

impl PlaybackState {
    /// States counted against `max_concurrent_videos`.
    pub fn holds_play_slot(self) -> bool {
        matches!(self, PlaybackState::Starting | PlaybackState::Playing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PlaybackState::Idle => "idle",
            PlaybackState::Preloading => "preloading",
            PlaybackState::Ready => "ready",
            PlaybackState::Starting => "starting",
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
            PlaybackState::Unloaded => "unloaded",
            PlaybackState::TapToPlay => "tap-to-play",
            PlaybackState::Failed => "failed",
        }
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_state_ordering() {
        assert!(!ReadyState::HaveCurrentData.can_play());
        assert!(ReadyState::HaveFutureData.can_play());
        assert!(ReadyState::HaveEnoughData.can_play());
    }

    #[test]
    fn test_source_quality_fallback() {
        let plain = MediaSource::new("a.mp4");
        assert_eq!(plain.url_for(Quality::High), "a.mp4");
        let hd = MediaSource::new("a.mp4").with_hd("a_hd.mp4");
        assert_eq!(hd.url_for(Quality::High), "a_hd.mp4");
        assert_eq!(hd.url_for(Quality::Standard), "a.mp4");
    }
}
