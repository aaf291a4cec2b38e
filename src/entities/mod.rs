//! Domain types and host capability traits.
//!
//! Everything here is plain data or an abstract interface. The scheduling
//! engine in `core` depends on these; nothing here depends on `core`.

pub mod error;
pub mod geometry;
pub mod post;
pub mod traits;

pub use error::{MediaError, MediaErrorKind, PlaybackError};
pub use geometry::{Rect, ViewRef};
pub use post::{MediaSource, PlaybackState, PostId, Quality, ReadyState};
pub use traits::{Clock, LayoutProvider, MediaElement, MediaHost};
