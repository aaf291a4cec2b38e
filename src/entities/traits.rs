//! Abstract host capabilities.
//!
//! The scheduler never talks to a concrete video element, layout engine or
//! timer. The container hands it implementations of these traits; tests and
//! the simulation binary use the ones in `crate::sim`.

use std::sync::Arc;
use std::time::Duration;

use super::error::{MediaError, MediaErrorKind};
use super::geometry::{Rect, ViewRef};
use super::post::{MediaSource, PostId, Quality, ReadyState};

/// One playable media resource owned by the host (a video element).
pub trait MediaElement {
    /// Begin (or restart) fetching the source.
    fn load(&mut self);

    fn ready_state(&self) -> ReadyState;

    /// Start playback. Hosts may refuse (autoplay policies).
    fn play(&mut self) -> Result<(), MediaError>;

    fn pause(&mut self);

    fn set_muted(&mut self, muted: bool);

    /// Playback position in seconds.
    fn current_time(&self) -> f64;

    fn seek(&mut self, secs: f64);

    /// Drop decoded/buffered data but keep the source reference.
    fn release(&mut self);

    /// End the element's lifecycle for good.
    fn destroy(&mut self);

    /// Network/decode error currently reported by the element, if any.
    fn error(&self) -> Option<MediaErrorKind>;
}

/// Factory for media elements.
pub trait MediaHost {
    fn create(
        &mut self,
        post_id: &PostId,
        source: &MediaSource,
        quality: Quality,
    ) -> Result<Box<dyn MediaElement>, MediaError>;
}

/// Layout queries against the host view system.
pub trait LayoutProvider {
    /// Visible scroll region.
    fn viewport(&self) -> Rect;

    /// Bounds of a view in viewport coordinates, None when not laid out yet.
    fn bounds(&self, view: ViewRef) -> Option<Rect>;
}

/// Monotonic time source. Injected so tests can drive a virtual clock.
pub trait Clock {
    /// Time elapsed since an arbitrary fixed origin.
    fn now(&self) -> Duration;
}

/// Blanket impl: Arc<T> implements Clock if T does
impl<T: Clock + ?Sized> Clock for Arc<T> {
    fn now(&self) -> Duration {
        (**self).now()
    }
}
