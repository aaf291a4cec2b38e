//! Preload queue: distance-ordered, velocity-paced, concurrency-gated.
//!
//! **Why**: loading every post near the viewport at once floods the network
//! and decoder. The queue hands out one post at a time, closest first, and
//! the feed waits `pacing_delay()` before asking again. Fast flings get a
//! longer delay so content scrolled straight past is never fetched.
//!
//! **Used by**: Feed (pump task, hover loads, retry reloads).
//!
//! # Invariants
//!
//! - `dequeue_next` only returns posts that exist, have a source, are not
//!   failed, have no live player, are not in flight and are currently inside
//!   the near-viewport band. Anything else popped is dropped on the floor.
//! - The active preload count *is* the in-flight map, so `begin`/`finish`
//!   keep it exact on every completion path.
//! - In-flight entries carry the feed generation; `finish` with a stale
//!   generation is ignored.

use std::time::Duration;

use indexmap::IndexMap;
use log::{debug, trace};

use crate::config::FeedSettings;
use crate::core::posts::PostTable;
use crate::core::visibility::VisibilityTracker;
use crate::entities::PostId;

/// One queued post.
#[derive(Debug, Clone, PartialEq)]
pub struct PreloadEntry {
    pub post_id: PostId,
    pub priority_distance: f64,
    /// Insertion sequence, the stable tie-breaker
    seq: u64,
}

/// A preload that has started and not yet completed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InFlight {
    pub generation: u64,
    pub started_at: Duration,
    /// Post drifted past the cancel distance; unload as soon as it is ready
    pub cancelled: bool,
}

/// Scroll speed estimate, updated on every scroll tick.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScrollVelocity {
    last_y: Option<f64>,
    last_ts: Duration,
    velocity_px_per_ms: f64,
}

impl ScrollVelocity {
    /// Feed a new scroll position; returns the updated speed (px/ms, unsigned).
    pub fn update(&mut self, y: f64, now: Duration) -> f64 {
        if let Some(last_y) = self.last_y {
            let dt = now.saturating_sub(self.last_ts).as_secs_f64() * 1000.0;
            if dt > 0.0 {
                self.velocity_px_per_ms = (y - last_y).abs() / dt;
            }
        }
        self.last_y = Some(y);
        self.last_ts = now;
        self.velocity_px_per_ms
    }

    pub fn px_per_ms(&self) -> f64 {
        self.velocity_px_per_ms
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Two-tier pacing between dequeues.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacingPolicy {
    pub normal: Duration,
    pub fast: Duration,
    /// px/ms above which the fast-scroll delay applies
    pub velocity_threshold: f64,
}

impl PacingPolicy {
    pub fn delay(&self, velocity_px_per_ms: f64) -> Duration {
        if velocity_px_per_ms > self.velocity_threshold {
            self.fast
        } else {
            self.normal
        }
    }
}

#[derive(Debug)]
pub struct PreloadQueue {
    entries: IndexMap<PostId, PreloadEntry>,
    next_seq: u64,
    in_flight: IndexMap<PostId, InFlight>,
    max_simultaneous: usize,
    band_px: f64,
    hd_band_px: f64,
    cancel_distance_px: f64,
    hd_mode: bool,
    pacing: PacingPolicy,
    velocity: ScrollVelocity,
    /// Host view hidden (tab in background): hand out nothing
    paused: bool,
}

impl PreloadQueue {
    pub fn from_settings(s: &FeedSettings) -> Self {
        Self {
            entries: IndexMap::new(),
            next_seq: 0,
            in_flight: IndexMap::new(),
            max_simultaneous: s.max_simultaneous_preloads.max(1),
            band_px: s.preload_band_px,
            hd_band_px: s.hd_preload_band_px,
            cancel_distance_px: s.cancel_distance_px,
            hd_mode: s.hd_mode,
            pacing: PacingPolicy {
                normal: Duration::from_millis(s.pacing_normal_ms),
                fast: Duration::from_millis(s.pacing_fast_ms),
                velocity_threshold: s.fast_scroll_velocity,
            },
            velocity: ScrollVelocity::default(),
            paused: false,
        }
    }

    // ========== Queue ==========

    /// Queue a post (or refresh its distance, keeping its original sequence).
    /// Negative distances are priority requests and stick until dequeued.
    /// Posts already in flight are ignored.
    pub fn enqueue(&mut self, post_id: PostId, distance: f64) {
        if self.in_flight.contains_key(&post_id) {
            return;
        }
        if let Some(entry) = self.entries.get_mut(&post_id) {
            if entry.priority_distance >= 0.0 || distance < entry.priority_distance {
                entry.priority_distance = distance;
            }
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            post_id.clone(),
            PreloadEntry { post_id, priority_distance: distance, seq },
        );
    }

    pub fn remove(&mut self, post_id: &PostId) -> bool {
        self.entries.shift_remove(post_id).is_some()
    }

    pub fn contains(&self, post_id: &PostId) -> bool {
        self.entries.contains_key(post_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queued entries in dequeue order.
    pub fn ordered(&self) -> Vec<&PreloadEntry> {
        let mut v: Vec<&PreloadEntry> = self.entries.values().collect();
        v.sort_by(|a, b| entry_order(a, b));
        v
    }

    /// Next post to preload, or None when gated, paused or nothing is valid.
    pub fn dequeue_next(&mut self, posts: &PostTable, tracker: &VisibilityTracker) -> Option<PostId> {
        if self.paused || !self.has_capacity() {
            return None;
        }
        let band = self.band_px();
        loop {
            let best = self
                .entries
                .values()
                .min_by(|a, b| entry_order(a, b))
                .map(|e| e.post_id.clone())?;
            self.entries.shift_remove(&best);

            let Some(post) = posts.get(&best) else {
                trace!("PreloadQueue: dropping {} (no longer registered)", best);
                continue;
            };
            if !post.has_source() || post.is_failed() || post.has_live_player() {
                trace!("PreloadQueue: dropping {} (no source / failed / loaded)", best);
                continue;
            }
            if self.in_flight.contains_key(&best) {
                continue;
            }
            if tracker.distance(&best) > band {
                trace!("PreloadQueue: dropping {} (left the near band)", best);
                continue;
            }
            return Some(best);
        }
    }

    /// Drop queued entries whose post is now outside the band.
    pub fn prune(&mut self, tracker: &VisibilityTracker) -> usize {
        let band = self.band_px();
        let before = self.entries.len();
        self.entries.retain(|id, _| tracker.distance(id) <= band);
        before - self.entries.len()
    }

    // ========== In-flight accounting ==========

    pub fn begin(&mut self, post_id: PostId, generation: u64, now: Duration) {
        self.entries.shift_remove(&post_id);
        self.in_flight.insert(post_id, InFlight { generation, started_at: now, cancelled: false });
    }

    /// Complete a preload. Returns None for unknown posts and stale generations.
    pub fn finish(&mut self, post_id: &PostId, generation: u64) -> Option<InFlight> {
        match self.in_flight.get(post_id) {
            Some(f) if f.generation == generation => self.in_flight.shift_remove(post_id),
            Some(f) => {
                trace!(
                    "PreloadQueue: ignoring finish for {} (generation {} != {})",
                    post_id, generation, f.generation
                );
                None
            }
            None => None,
        }
    }

    pub fn in_flight(&self, post_id: &PostId) -> Option<&InFlight> {
        self.in_flight.get(post_id)
    }

    pub fn is_in_flight(&self, post_id: &PostId) -> bool {
        self.in_flight.contains_key(post_id)
    }

    /// Currently preloading count.
    pub fn active(&self) -> usize {
        self.in_flight.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.in_flight.len() < self.max_simultaneous
    }

    pub fn max_simultaneous(&self) -> usize {
        self.max_simultaneous
    }

    /// Flag in-flight preloads whose post drifted past the cancel distance.
    /// Returns the newly flagged ids.
    pub fn mark_cancellations(&mut self, tracker: &VisibilityTracker) -> Vec<PostId> {
        let limit = self.cancel_distance_px;
        let mut flagged = Vec::new();
        for (id, flight) in self.in_flight.iter_mut() {
            if !flight.cancelled && tracker.distance(id) > limit {
                flight.cancelled = true;
                flagged.push(id.clone());
            }
        }
        for id in &flagged {
            debug!("PreloadQueue: {} left the band mid-flight, will unload on ready", id);
        }
        flagged
    }

    /// Distance past which an in-flight preload is unloaded on ready.
    pub fn cancel_distance(&self) -> f64 {
        self.cancel_distance_px
    }

    // ========== Pacing ==========

    pub fn record_scroll(&mut self, y: f64, now: Duration) -> f64 {
        self.velocity.update(y, now)
    }

    pub fn velocity(&self) -> f64 {
        self.velocity.px_per_ms()
    }

    pub fn pacing_delay(&self) -> Duration {
        self.pacing.delay(self.velocity.px_per_ms())
    }

    // ========== Modes ==========

    pub fn set_paused(&mut self, paused: bool) {
        if self.paused != paused {
            debug!("PreloadQueue: {}", if paused { "paused (host hidden)" } else { "resumed" });
        }
        self.paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn set_hd_mode(&mut self, enabled: bool) {
        self.hd_mode = enabled;
    }

    /// Near-viewport band for the current mode.
    pub fn band_px(&self) -> f64 {
        if self.hd_mode { self.hd_band_px.min(self.band_px) } else { self.band_px }
    }

    /// Forget everything (feed reload / cleanup).
    pub fn reset(&mut self) {
        self.entries.clear();
        self.in_flight.clear();
        self.velocity.reset();
    }
}

fn entry_order(a: &PreloadEntry, b: &PreloadEntry) -> std::cmp::Ordering {
    a.priority_distance
        .total_cmp(&b.priority_distance)
        .then(a.seq.cmp(&b.seq))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::player::PlayerHandle;
    use crate::core::posts::Post;
    use crate::core::retry::RetryController;
    use crate::entities::{MediaSource, PlaybackState, Quality, ViewRef};
    use crate::entities::MediaHost;
    use crate::core::clock::ManualClock;
    use crate::sim::{SimHost, SimLayout};
    use std::sync::Arc;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    /// 10 posts of 600px, 800px viewport scrolled to the top.
    fn fixture() -> (PostTable, VisibilityTracker, SimLayout, PreloadQueue) {
        let settings = FeedSettings::default();
        let retry = RetryController::from_settings(&settings);
        let mut posts = PostTable::new();
        let mut tracker = VisibilityTracker::new(0.2);
        for i in 0..10u64 {
            let id = PostId::new(format!("p{i}"));
            let source = Some(MediaSource::new(format!("{i}.mp4")));
            posts.insert(Post::new(id.clone(), ViewRef(i), source, 0, retry.load_ladder()));
            tracker.observe(id, ViewRef(i));
        }
        let layout = SimLayout::new(10, 600.0, 0.0, 800.0);
        tracker.measure(&layout);
        (posts, tracker, layout, PreloadQueue::from_settings(&settings))
    }

    fn id(s: &str) -> PostId {
        PostId::new(s)
    }

    #[test]
    fn test_orders_by_distance_then_insertion() {
        let (posts, tracker, _, mut q) = fixture();
        q.enqueue(id("p3"), 1000.0);
        q.enqueue(id("p1"), 0.0);
        q.enqueue(id("p2"), 400.0);
        q.enqueue(id("p0"), 0.0);
        let order: Vec<_> = q.ordered().iter().map(|e| e.post_id.to_string()).collect();
        assert_eq!(order, vec!["p1", "p0", "p2", "p3"]);

        assert_eq!(q.dequeue_next(&posts, &tracker), Some(id("p1")));
        q.begin(id("p1"), 0, ms(0));
        assert_eq!(q.dequeue_next(&posts, &tracker), Some(id("p0")));
    }

    #[test]
    fn test_reenqueue_keeps_sequence() {
        let (_, _, _, mut q) = fixture();
        q.enqueue(id("p1"), 100.0);
        q.enqueue(id("p2"), 100.0);
        q.enqueue(id("p1"), 100.0);
        let order: Vec<_> = q.ordered().iter().map(|e| e.post_id.to_string()).collect();
        assert_eq!(order, vec!["p1", "p2"]);
    }

    #[test]
    fn test_priority_survives_distance_refresh() {
        let (posts, tracker, _, mut q) = fixture();
        q.enqueue(id("p1"), 0.0);
        q.enqueue(id("p2"), -1.0);
        q.enqueue(id("p2"), 400.0);
        assert_eq!(q.ordered()[0].priority_distance, -1.0);

        // Plain distances still follow the scroll
        q.enqueue(id("p1"), 300.0);
        q.enqueue(id("p1"), 200.0);
        assert_eq!(q.ordered()[1].priority_distance, 200.0);

        q.enqueue(id("p1"), -2.0);
        assert_eq!(q.dequeue_next(&posts, &tracker), Some(id("p1")));
    }

    #[test]
    fn test_concurrency_gate() {
        let (posts, tracker, _, mut q) = fixture();
        assert_eq!(q.max_simultaneous(), 2);
        for i in 0..4 {
            q.enqueue(id(&format!("p{i}")), i as f64);
        }
        let a = q.dequeue_next(&posts, &tracker).unwrap();
        q.begin(a.clone(), 0, ms(0));
        let b = q.dequeue_next(&posts, &tracker).unwrap();
        q.begin(b, 0, ms(0));
        assert_eq!(q.active(), 2);
        assert_eq!(q.dequeue_next(&posts, &tracker), None);

        assert!(q.finish(&a, 0).is_some());
        assert_eq!(q.active(), 1);
        assert!(q.dequeue_next(&posts, &tracker).is_some());
    }

    #[test]
    fn test_skips_invalid_posts() {
        let (mut posts, tracker, _, mut q) = fixture();
        let clock = Arc::new(ManualClock::new());
        let mut host = SimHost::new(clock);

        // p0: no source
        posts.get_mut(&id("p0")).unwrap().source = None;
        // p1: already has a live player
        let source = MediaSource::new("1.mp4");
        let element = host.create(&id("p1"), &source, Quality::Standard).unwrap();
        posts.get_mut(&id("p1")).unwrap().player = Some(PlayerHandle::preload(element));
        // p2: failed
        posts.get_mut(&id("p2")).unwrap().state = PlaybackState::Failed;
        // p9: far outside the band (distance 4600px)
        // p8: unregistered
        posts.remove(&id("p8"));

        for name in ["p0", "p1", "p2", "p9", "p8"] {
            q.enqueue(id(name), 0.0);
        }
        assert_eq!(q.dequeue_next(&posts, &tracker), None);
        assert!(q.is_empty());

        q.enqueue(id("p3"), 0.0);
        assert_eq!(q.dequeue_next(&posts, &tracker), Some(id("p3")));
    }

    #[test]
    fn test_in_flight_never_returned() {
        let (posts, tracker, _, mut q) = fixture();
        q.begin(id("p1"), 0, ms(0));
        q.enqueue(id("p1"), 0.0);
        assert!(!q.contains(&id("p1")));
        assert_eq!(q.dequeue_next(&posts, &tracker), None);
    }

    #[test]
    fn test_prune_and_band() {
        let (_, mut tracker, mut layout, mut q) = fixture();
        q.enqueue(id("p2"), 400.0);
        q.enqueue(id("p3"), 1000.0);
        layout.scroll_to(4200.0);
        tracker.measure(&layout);
        // Both are now above the viewport by more than the band
        assert_eq!(q.prune(&tracker), 2);
    }

    #[test]
    fn test_hd_band_is_tighter() {
        let (_, _, _, mut q) = fixture();
        let normal = q.band_px();
        q.set_hd_mode(true);
        assert!(q.band_px() < normal);
    }

    #[test]
    fn test_stale_finish_ignored() {
        let (_, _, _, mut q) = fixture();
        q.begin(id("p1"), 3, ms(0));
        assert!(q.finish(&id("p1"), 2).is_none());
        assert_eq!(q.active(), 1);
        assert!(q.finish(&id("p1"), 3).is_some());
        assert_eq!(q.active(), 0);
    }

    #[test]
    fn test_paused_hands_out_nothing() {
        let (posts, tracker, _, mut q) = fixture();
        q.enqueue(id("p1"), 0.0);
        q.set_paused(true);
        assert_eq!(q.dequeue_next(&posts, &tracker), None);
        q.set_paused(false);
        assert_eq!(q.dequeue_next(&posts, &tracker), Some(id("p1")));
    }

    #[test]
    fn test_mid_flight_cancellation() {
        let (_, mut tracker, mut layout, mut q) = fixture();
        q.begin(id("p2"), 0, ms(0));
        layout.scroll_to(5400.0);
        tracker.measure(&layout);
        assert_eq!(q.mark_cancellations(&tracker), vec![id("p2")]);
        assert!(q.in_flight(&id("p2")).unwrap().cancelled);
        // Flagging is one-shot
        assert!(q.mark_cancellations(&tracker).is_empty());
    }

    #[test]
    fn test_velocity_pacing() {
        let (_, _, _, mut q) = fixture();
        q.record_scroll(0.0, ms(0));
        q.record_scroll(100.0, ms(100));
        assert!((q.velocity() - 1.0).abs() < 1e-9);
        assert_eq!(q.pacing_delay(), ms(150));

        q.record_scroll(600.0, ms(200));
        assert!((q.velocity() - 5.0).abs() < 1e-9);
        assert_eq!(q.pacing_delay(), ms(400));
    }
}
