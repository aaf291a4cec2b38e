//! Error taxonomy for host media failures and scheduler operations.

use super::post::PostId;

/// Kind of failure reported by a host media element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum MediaErrorKind {
    Network,
    Decode,
    Unsupported,
    /// Preload never reached a playable state within its bound
    Timeout,
}

impl std::fmt::Display for MediaErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaErrorKind::Network => write!(f, "network"),
            MediaErrorKind::Decode => write!(f, "decode"),
            MediaErrorKind::Unsupported => write!(f, "unsupported source"),
            MediaErrorKind::Timeout => write!(f, "load timeout"),
        }
    }
}

/// Errors returned by host media calls.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaError {
    /// Host refused to start playback (autoplay policy, interrupted play, ...)
    Rejected(String),
    /// Resource could not be created or loaded
    Load(MediaErrorKind),
}

impl std::fmt::Display for MediaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaError::Rejected(reason) => write!(f, "play rejected: {}", reason),
            MediaError::Load(kind) => write!(f, "load failed: {}", kind),
        }
    }
}

impl std::error::Error for MediaError {}

/// Scheduler-level errors. None of these escape a per-post operation:
/// they are logged at the task boundary and routed into a retry ladder.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackError {
    /// Player never became playable within the readiness bound
    ReadinessTimeout,
    /// Host media API refused `play()`
    PlaybackRejected(String),
    /// Network/decode failure while loading
    LoadError(MediaErrorKind),
    /// Load retries exhausted; the post shows a placeholder
    PermanentFailure,
    /// Completion of an operation issued under an older feed generation
    StaleOperation { issued: u64, current: u64 },
    /// `play()` requested before the handle can produce frames
    NotReady,
    UnknownPost(PostId),
}

impl std::fmt::Display for PlaybackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackError::ReadinessTimeout => write!(f, "player not ready before timeout"),
            PlaybackError::PlaybackRejected(e) => write!(f, "playback rejected: {}", e),
            PlaybackError::LoadError(kind) => write!(f, "load error: {}", kind),
            PlaybackError::PermanentFailure => write!(f, "permanently failed"),
            PlaybackError::StaleOperation { issued, current } => {
                write!(f, "stale operation (generation {} superseded by {})", issued, current)
            }
            PlaybackError::NotReady => write!(f, "player cannot produce frames yet"),
            PlaybackError::UnknownPost(id) => write!(f, "unknown post {}", id),
        }
    }
}

impl std::error::Error for PlaybackError {}

impl From<MediaError> for PlaybackError {
    fn from(e: MediaError) -> Self {
        match e {
            MediaError::Rejected(reason) => PlaybackError::PlaybackRejected(reason),
            MediaError::Load(kind) => PlaybackError::LoadError(kind),
        }
    }
}
