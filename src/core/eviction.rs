//! Eviction / unload manager.
//!
//! Two independent pressure-relief passes, both idempotent:
//!
//! 1. **Video unload** (cheap, throttled to one sweep per `sweep_interval`):
//!    loaded players farther than `unload_distance` release their buffers.
//!    The post, its view and its resume position stay.
//! 2. **Post eviction** (rare): once tracked posts exceed the soft cap
//!    (`target * soft_cap_factor`), the furthest non-visible posts are picked
//!    for full destruction until the table is back at `target`.
//!
//! Ordering for both: non-intersecting before intersecting, then farther
//! before nearer. Intersecting posts are never evicted.

use std::cmp::Ordering;
use std::time::Duration;

use log::debug;

use crate::config::FeedSettings;
use crate::core::posts::PostTable;
use crate::core::visibility::VisibilityTracker;
use crate::entities::{PlaybackState, PostId};

#[derive(Debug, Clone)]
pub struct EvictionManager {
    unload_distance_px: f64,
    hd_unload_distance_px: f64,
    hd_mode: bool,
    target_working_set: usize,
    soft_cap_factor: f64,
    sweep_interval: Duration,
    last_sweep: Option<Duration>,
}

impl EvictionManager {
    pub fn from_settings(s: &FeedSettings) -> Self {
        Self {
            unload_distance_px: s.unload_distance_px,
            hd_unload_distance_px: s.hd_unload_distance_px,
            hd_mode: s.hd_mode,
            target_working_set: s.target_working_set.max(1),
            soft_cap_factor: s.soft_cap_factor.max(1.0),
            sweep_interval: Duration::from_millis(s.unload_interval_ms),
            last_sweep: None,
        }
    }

    pub fn set_hd_mode(&mut self, enabled: bool) {
        self.hd_mode = enabled;
    }

    pub fn set_unload_distance(&mut self, px: f64) {
        self.unload_distance_px = px.max(0.0);
    }

    /// Effective unload distance (HD mode is tighter).
    pub fn unload_distance(&self) -> f64 {
        if self.hd_mode {
            self.hd_unload_distance_px.min(self.unload_distance_px)
        } else {
            self.unload_distance_px
        }
    }

    pub fn soft_cap(&self) -> usize {
        (self.target_working_set as f64 * self.soft_cap_factor).ceil() as usize
    }

    pub fn target_working_set(&self) -> usize {
        self.target_working_set
    }

    /// Throttle gate for unload sweeps. Returns true (and arms the throttle)
    /// when at least one interval has passed since the last sweep.
    pub fn sweep_due(&mut self, now: Duration) -> bool {
        match self.last_sweep {
            Some(last) if now.saturating_sub(last) < self.sweep_interval => false,
            _ => {
                self.last_sweep = Some(now);
                true
            }
        }
    }

    /// Release buffers of every loaded player beyond the unload distance.
    /// Returns the ids that were actually unloaded; a second call is a no-op.
    pub fn unload_far(&self, posts: &mut PostTable, tracker: &VisibilityTracker) -> Vec<PostId> {
        let limit = self.unload_distance();
        let mut candidates: Vec<(PostId, bool, f64)> = posts
            .iter()
            .filter(|p| p.is_loaded() && !p.state.holds_play_slot())
            .filter_map(|p| {
                let rec = tracker.record(&p.id)?;
                (rec.distance_px > limit).then(|| (p.id.clone(), rec.is_intersecting, rec.distance_px))
            })
            .collect();
        candidates.sort_by(pressure_order);

        let mut unloaded = Vec::new();
        for (id, _, distance) in candidates {
            let Some(post) = posts.get_mut(&id) else { continue };
            let Some(player) = post.player.as_mut() else { continue };
            if player.unload() {
                post.state = PlaybackState::Unloaded;
                debug!("EvictionManager: unloaded {} at {:.0}px", id, distance);
                unloaded.push(id);
            }
        }
        unloaded
    }

    /// Posts to destroy so the table shrinks back to the target size.
    /// Empty while under the soft cap. Never includes intersecting posts.
    pub fn eviction_victims(&self, posts: &PostTable, tracker: &VisibilityTracker) -> Vec<PostId> {
        let count = posts.len();
        if count <= self.soft_cap() {
            return Vec::new();
        }
        let excess = count - self.target_working_set;

        let mut candidates: Vec<(PostId, bool, f64)> = posts
            .iter()
            .filter(|p| !tracker.is_intersecting(&p.id))
            .map(|p| (p.id.clone(), false, tracker.distance(&p.id)))
            .collect();
        candidates.sort_by(pressure_order);
        candidates.truncate(excess);

        debug!(
            "EvictionManager: {} posts over soft cap {}, evicting {}",
            count,
            self.soft_cap(),
            candidates.len()
        );
        candidates.into_iter().map(|(id, _, _)| id).collect()
    }
}

/// Non-visible first, then farthest first.
fn pressure_order(a: &(PostId, bool, f64), b: &(PostId, bool, f64)) -> Ordering {
    a.1.cmp(&b.1).then(b.2.total_cmp(&a.2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::player::PlayerHandle;
    use crate::core::posts::Post;
    use crate::core::retry::RetryController;
    use crate::entities::{MediaHost, MediaSource, Quality, ViewRef};
    use crate::sim::{SimHost, SimLayout};
    use std::sync::Arc;

    fn settings(target: usize) -> FeedSettings {
        FeedSettings { target_working_set: target, ..FeedSettings::default() }
    }

    /// `count` posts of 600px, all with loaded players.
    fn fixture(count: u64, scroll: f64) -> (PostTable, VisibilityTracker, SimHost, Arc<ManualClock>) {
        let s = FeedSettings::default();
        let retry = RetryController::from_settings(&s);
        let clock = Arc::new(ManualClock::new());
        let mut host = SimHost::new(clock.clone());
        let mut posts = PostTable::new();
        let mut tracker = VisibilityTracker::new(0.2);
        for i in 0..count {
            let id = PostId::new(format!("p{i}"));
            let source = MediaSource::new(format!("{i}.mp4"));
            let mut post = Post::new(id.clone(), ViewRef(i), Some(source.clone()), 0, retry.load_ladder());
            let element = host.create(&id, &source, Quality::Standard).unwrap();
            post.player = Some(PlayerHandle::preload(element));
            posts.insert(post);
            tracker.observe(id, ViewRef(i));
        }
        clock.advance(Duration::from_secs(5));
        for post in posts.iter_mut() {
            if let Some(p) = post.player.as_mut() {
                p.mark_loaded();
            }
            post.state = PlaybackState::Ready;
        }
        let mut layout = SimLayout::new(count as usize, 600.0, 0.0, 800.0);
        layout.scroll_to(scroll);
        tracker.measure(&layout);
        (posts, tracker, host, clock)
    }

    #[test]
    fn test_unload_far_is_idempotent() {
        let (mut posts, tracker, host, _) = fixture(10, 0.0);
        let m = EvictionManager::from_settings(&FeedSettings::default());
        // 2000px limit: p5 starts at 3000 -> distance 2200
        let first = m.unload_far(&mut posts, &tracker);
        assert_eq!(first.len(), 5);
        assert_eq!(first[0], PostId::new("p9"));
        assert!(m.unload_far(&mut posts, &tracker).is_empty());
        assert_eq!(host.probe(&PostId::new("p9")).unwrap().releases, 1);
        assert_eq!(posts.state(&PostId::new("p9")), Some(PlaybackState::Unloaded));
        assert_eq!(posts.state(&PostId::new("p1")), Some(PlaybackState::Ready));
    }

    #[test]
    fn test_hd_mode_tightens_unload() {
        let (mut posts, tracker, _, _) = fixture(10, 0.0);
        let mut m = EvictionManager::from_settings(&FeedSettings::default());
        m.set_hd_mode(true);
        // 1000px limit: p3 (distance 1000) stays, p4.. go
        let unloaded = m.unload_far(&mut posts, &tracker);
        assert_eq!(unloaded.len(), 6);
        assert!(!unloaded.contains(&PostId::new("p3")));
    }

    #[test]
    fn test_sweep_throttle() {
        let mut m = EvictionManager::from_settings(&FeedSettings::default());
        assert!(m.sweep_due(Duration::from_millis(0)));
        assert!(!m.sweep_due(Duration::from_millis(200)));
        assert!(!m.sweep_due(Duration::from_millis(499)));
        assert!(m.sweep_due(Duration::from_millis(500)));
    }

    #[test]
    fn test_no_eviction_under_soft_cap() {
        let (posts, tracker, _, _) = fixture(15, 0.0);
        let m = EvictionManager::from_settings(&settings(10));
        assert_eq!(m.soft_cap(), 15);
        assert!(m.eviction_victims(&posts, &tracker).is_empty());
    }

    #[test]
    fn test_eviction_picks_furthest_non_visible() {
        // 20 posts, viewport in the middle (p10/p11 visible)
        let (posts, tracker, _, _) = fixture(20, 6000.0);
        let m = EvictionManager::from_settings(&settings(10));
        let victims = m.eviction_victims(&posts, &tracker);
        assert_eq!(victims.len(), 10);
        assert!(!victims.contains(&PostId::new("p10")));
        assert!(!victims.contains(&PostId::new("p11")));
        // p0 and p19 are the furthest
        assert!(victims.contains(&PostId::new("p0")));
        assert!(victims.contains(&PostId::new("p19")));
    }

    #[test]
    fn test_eviction_never_takes_visible_posts() {
        // Tiny target: everything non-visible goes, visible ones stay
        let (posts, tracker, _, _) = fixture(20, 6000.0);
        let m = EvictionManager::from_settings(&settings(1));
        let victims = m.eviction_victims(&posts, &tracker);
        assert_eq!(victims.len(), 18);
        for id in victims {
            assert!(!tracker.is_intersecting(&id));
        }
    }
}
