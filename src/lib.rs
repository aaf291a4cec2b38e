//! FEEDPLAY - viewport-driven media playback scheduler
//!
//! Re-exports all modules for use by binary targets.

// Core engine (feed, scheduler, preload, eviction, events)
pub mod core;

// Domain types and host traits
pub mod entities;

// App modules
pub mod cli;
pub mod config;
pub mod sim;

// Re-export commonly used types from core
pub use core::event_bus::{EventBus, FeedEvent};
pub use core::feed::{Feed, FeedStats};

// Re-export entities
pub use config::{ConcurrencyPolicy, FeedSettings, Profile};
pub use entities::{MediaSource, PlaybackState, PostId, ViewRef};
