//! Notification bus from the scheduler to the container.
//!
//! Architecture:
//! - Containers subscribe callbacks (immediate invocation on emit)
//! - emit() invokes callbacks immediately AND queues for deferred processing
//! - poll() returns queued events for batch processing in the host loop
//!
//! Callback order: FIFO (first-subscribed, first-called).
//!
//! Subscribers only ever see owned event values; they cannot reach scheduler
//! state. A panicking subscriber is caught at the callback boundary, logged,
//! and the remaining subscribers still run.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, RwLock};

use log::{error, warn};
use serde::Serialize;

use crate::entities::{MediaErrorKind, PlaybackState, PostId};

/// Maximum events in queue before oldest are evicted
const MAX_QUEUE_SIZE: usize = 1000;

/// Everything the feed tells its container.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FeedEvent {
    PlaybackStateChanged { post_id: PostId, state: PlaybackState },
    /// Media error seen by the health check or a preload poll
    LoadError { post_id: PostId, kind: MediaErrorKind, retry: u32 },
    /// Load retries exhausted; show the placeholder
    PermanentFailure { post_id: PostId },
    /// Post destroyed under memory pressure; the container may drop its view
    PostEvicted { post_id: PostId },
}

impl FeedEvent {
    pub fn post_id(&self) -> &PostId {
        match self {
            FeedEvent::PlaybackStateChanged { post_id, .. }
            | FeedEvent::LoadError { post_id, .. }
            | FeedEvent::PermanentFailure { post_id }
            | FeedEvent::PostEvicted { post_id } => post_id,
        }
    }
}

type Callback = Arc<dyn Fn(&FeedEvent) + Send + Sync>;

/// Pub/Sub bus with deferred processing support.
///
/// Cloning shares subscribers and queue, so the container can keep a handle
/// while the feed owns another.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<Vec<Callback>>>,
    queue: Arc<Mutex<VecDeque<FeedEvent>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.read().map(|s| s.len()).unwrap_or(0))
            .field("queue_len", &self.queue_len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Pub/Sub (immediate) ==========

    /// Register a callback invoked synchronously on every emit.
    ///
    /// # Example
    /// ```ignore
    /// let seen = Arc::new(Mutex::new(Vec::new()));
    /// let sink = Arc::clone(&seen);
    /// feed.events().subscribe(move |e| sink.lock().unwrap().push(e.clone()));
    /// ```
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&FeedEvent) + Send + Sync + 'static,
    {
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(callback));
    }

    /// Invoke callbacks, then queue the event for poll().
    pub fn emit(&self, event: FeedEvent) {
        // Snapshot so a callback may subscribe without deadlocking
        let callbacks: Vec<Callback> = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for cb in &callbacks {
            if catch_unwind(AssertUnwindSafe(|| cb(&event))).is_err() {
                error!("EventBus: subscriber panicked handling {:?}", event);
            }
        }

        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= MAX_QUEUE_SIZE {
            let evict_count = queue.len() / 2;
            warn!("EventBus queue full ({} events), evicting oldest {}", queue.len(), evict_count);
            queue.drain(..evict_count);
        }
        queue.push_back(event);
    }

    // ========== Deferred Processing ==========

    /// All events emitted since the last poll, oldest first.
    pub fn poll(&self) -> Vec<FeedEvent> {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect()
    }

    // ========== Utilities ==========

    /// Clear all subscribers and queue
    pub fn clear(&self) {
        self.subscribers.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn has_subscribers(&self) -> bool {
        !self.subscribers.read().unwrap_or_else(|e| e.into_inner()).is_empty()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn changed(id: &str, state: PlaybackState) -> FeedEvent {
        FeedEvent::PlaybackStateChanged { post_id: PostId::new(id), state }
    }

    #[test]
    fn test_subscribe_emit_immediate() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        bus.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(changed("a", PlaybackState::Playing));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        bus.emit(changed("a", PlaybackState::Paused));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_emit_queues_for_poll() {
        let bus = EventBus::new();
        bus.emit(changed("a", PlaybackState::Playing));
        bus.emit(FeedEvent::PermanentFailure { post_id: PostId::new("b") });

        let events = bus.poll();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].post_id().as_str(), "b");
        assert!(bus.poll().is_empty());
    }

    #[test]
    fn test_panicking_subscriber_is_contained() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.subscribe(|_| panic!("container bug"));
        let c = Arc::clone(&counter);
        bus.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(changed("a", PlaybackState::Playing));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(bus.queue_len(), 1);
    }

    #[test]
    fn test_queue_eviction() {
        let bus = EventBus::new();
        for i in 0..MAX_QUEUE_SIZE + 1 {
            bus.emit(FeedEvent::PostEvicted { post_id: PostId::new(format!("p{i}")) });
        }
        let events = bus.poll();
        assert_eq!(events.len(), MAX_QUEUE_SIZE / 2 + 1);
        assert_eq!(events.last().map(|e| e.post_id().to_string()), Some(format!("p{}", MAX_QUEUE_SIZE)));
    }

    #[test]
    fn test_clones_share_state() {
        let bus = EventBus::new();
        let handle = bus.clone();
        handle.subscribe(|_| {});
        assert!(bus.has_subscribers());
        bus.emit(changed("a", PlaybackState::Ready));
        assert_eq!(handle.poll().len(), 1);
        bus.clear();
        assert!(!handle.has_subscribers());
    }

    #[test]
    fn test_serializes_tagged() {
        let json = serde_json::to_string(&changed("a", PlaybackState::Playing)).unwrap();
        assert!(json.contains("\"event\":\"playback_state_changed\""));
        assert!(json.contains("\"post_id\":\"a\""));
    }
}
