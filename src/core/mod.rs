//! Core engine modules - feed facade, scheduler, preload, eviction, events
//!
//! These modules form the playback engine, independent of any host toolkit.

pub mod clock;
pub mod event_bus;
pub mod eviction;
pub mod feed;
pub mod player;
pub mod posts;
pub mod preload;
pub mod retry;
pub mod scheduler;
pub mod visibility;

// Re-exports for convenience
pub use clock::{ManualClock, SystemClock, TimerId, Timers};
pub use event_bus::{EventBus, FeedEvent};
pub use eviction::EvictionManager;
pub use feed::{Feed, FeedStats};
pub use player::PlayerHandle;
pub use posts::{Post, PostTable};
pub use preload::PreloadQueue;
pub use retry::{RetryController, RetryLadder};
pub use scheduler::{Directive, PlaybackScheduler};
pub use visibility::{VisibilityRecord, VisibilityTracker};
