//! Playback scheduler: which posts play, which pause, who has audio.
//!
//! **Architecture**: the scheduler does NOT own posts. It receives
//! `&mut PostTable` for each operation, keeps only the ids of the posts
//! holding a play slot, and returns [`Directive`]s for the feed to carry out
//! (notifications, timers, priority preloads). That keeps every decision here
//! synchronous and testable without a clock.
//!
//! # Reconcile
//!
//! Candidates are intersecting posts at or above the autoplay threshold,
//! ordered by ratio (desc), distance (asc), feed index (asc). The first K
//! (K = `max_concurrent`, or 1 in exclusive-audio mode) are the target set.
//! Slot holders outside the target are paused first, then targets are
//! promoted. Demotion never unloads: the resume position survives.
//!
//! # Audio focus
//!
//! Everything starts muted. In exclusive-audio mode the top playing target
//! gets focus; the previous holder is muted before the new one is unmuted.

use std::time::Duration;

use indexmap::IndexSet;
use log::{debug, info, trace, warn};

use crate::config::ConcurrencyPolicy;
use crate::core::posts::PostTable;
use crate::core::retry::{PlayPath, RetryController, RetryDecision, WaitStatus};
use crate::core::visibility::VisibilityTracker;
use crate::entities::{PlaybackError, PlaybackState, PostId};

/// Follow-up work for the feed.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// State changed; tell the container
    Notify(PostId, PlaybackState),
    /// Poll readiness again after the readiness poll interval
    WaitReady(PostId),
    /// Retry `play()` after the delay
    RetryPlay(PostId, Duration),
    /// Target post has no usable player; preload it ahead of the queue
    Preload(PostId),
}

#[derive(Debug)]
pub struct PlaybackScheduler {
    max_concurrent: usize,
    autoplay_threshold: f32,
    exclusive_audio: bool,
    /// Slot holders (Starting + Playing), promotion order
    playing: IndexSet<PostId>,
    focused: Option<PostId>,
    /// Set by pause_all until resume_all
    suspended: bool,
}

impl PlaybackScheduler {
    pub fn new(policy: &ConcurrencyPolicy, exclusive_audio: bool) -> Self {
        Self {
            max_concurrent: policy.max_concurrent_videos.max(1),
            autoplay_threshold: policy.autoplay_threshold,
            exclusive_audio,
            playing: IndexSet::new(),
            focused: None,
            suspended: false,
        }
    }

    pub fn set_policy(&mut self, policy: &ConcurrencyPolicy) {
        self.max_concurrent = policy.max_concurrent_videos.max(1);
        self.autoplay_threshold = policy.autoplay_threshold;
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn exclusive_audio(&self) -> bool {
        self.exclusive_audio
    }

    /// Slot holders (Starting or Playing).
    pub fn slot_holders(&self) -> impl Iterator<Item = &PostId> {
        self.playing.iter()
    }

    pub fn focused(&self) -> Option<&PostId> {
        self.focused.as_ref()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Posts allowed to play right now, best first.
    fn targets(&self, posts: &PostTable, tracker: &VisibilityTracker) -> Vec<PostId> {
        if self.suspended {
            return Vec::new();
        }
        let mut candidates: Vec<(PostId, f32, f64, usize)> = posts
            .iter()
            .filter(|p| p.has_source())
            .filter(|p| !matches!(p.state, PlaybackState::Failed | PlaybackState::TapToPlay))
            .filter_map(|p| {
                let rec = tracker.record(&p.id)?;
                if !rec.is_intersecting || rec.intersection_ratio < self.autoplay_threshold {
                    return None;
                }
                let index = posts.index_of(&p.id).unwrap_or(usize::MAX);
                Some((p.id.clone(), rec.intersection_ratio, rec.distance_px, index))
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.1.total_cmp(&a.1)
                .then(a.2.total_cmp(&b.2))
                .then(a.3.cmp(&b.3))
        });

        let k = if self.exclusive_audio { 1 } else { self.max_concurrent };
        candidates.into_iter().take(k).map(|(id, ..)| id).collect()
    }

    /// Bring the playing set in line with current visibility.
    pub fn reconcile(
        &mut self,
        posts: &mut PostTable,
        tracker: &VisibilityTracker,
        retry: &RetryController,
        now: Duration,
    ) -> Vec<Directive> {
        let mut out = Vec::new();

        // Drop ids whose post vanished or left the slot states behind our back
        self.playing.retain(|id| posts.state(id).is_some_and(|s| s.holds_play_slot()));
        if self.focused.as_ref().is_some_and(|id| !self.playing.contains(id)) {
            self.assign_focus(posts, None);
        }

        let targets = self.targets(posts, tracker);

        // 1. Demote
        let demote: Vec<PostId> = self
            .playing
            .iter()
            .filter(|id| !targets.contains(id))
            .cloned()
            .collect();
        for id in demote {
            self.demote(posts, &id, &mut out);
        }

        // 2. Promote
        for id in &targets {
            if self.playing.contains(id) {
                continue;
            }
            if self.playing.len() >= self.max_concurrent {
                break;
            }
            self.promote(posts, id, retry, now, &mut out);
        }
        debug_assert!(self.playing.len() <= self.max_concurrent);

        // 3. Focus
        if self.exclusive_audio {
            let top = targets
                .iter()
                .find(|id| posts.state(id) == Some(PlaybackState::Playing))
                .cloned();
            self.assign_focus(posts, top);
        }

        out
    }

    fn demote(&mut self, posts: &mut PostTable, id: &PostId, out: &mut Vec<Directive>) {
        self.playing.shift_remove(id);
        if self.focused.as_ref() == Some(id) {
            self.assign_focus(posts, None);
        }
        let Some(post) = posts.get_mut(id) else { return };
        if let Some(player) = post.player.as_mut() {
            player.pause();
        }
        post.play_retry = None;
        post.readiness = None;
        post.state = PlaybackState::Paused;
        debug!("Scheduler: paused {}", id);
        out.push(Directive::Notify(id.clone(), PlaybackState::Paused));
    }

    fn promote(
        &mut self,
        posts: &mut PostTable,
        id: &PostId,
        retry: &RetryController,
        now: Duration,
        out: &mut Vec<Directive>,
    ) {
        let Some(post) = posts.get_mut(id) else { return };
        let usable = post.has_live_player() && matches!(post.state, PlaybackState::Ready | PlaybackState::Paused);
        if !usable {
            // Idle, still preloading, unloaded or waiting on a load retry
            if matches!(post.state, PlaybackState::Idle | PlaybackState::Unloaded) {
                out.push(Directive::Preload(id.clone()));
            }
            return;
        }

        let path = if post.has_played { PlayPath::Resume } else { PlayPath::Initial };
        post.play_retry = Some(retry.play_ladder(path));
        post.readiness = None;
        post.state = PlaybackState::Starting;
        self.playing.insert(id.clone());
        trace!("Scheduler: promoting {} ({:?} path)", id, path);
        out.push(Directive::Notify(id.clone(), PlaybackState::Starting));
        self.attempt_play(posts, id, retry, now, out);
    }

    /// One play attempt for a Starting post: wait for readiness or call play().
    fn attempt_play(
        &mut self,
        posts: &mut PostTable,
        id: &PostId,
        retry: &RetryController,
        now: Duration,
        out: &mut Vec<Directive>,
    ) {
        let Some(post) = posts.get_mut(id) else { return };
        let Some(player) = post.player.as_mut() else { return };

        if !player.can_play() {
            if post.readiness.is_none() {
                post.readiness = Some(retry.readiness_wait(now));
            }
            out.push(Directive::WaitReady(id.clone()));
            return;
        }
        post.readiness = None;

        match player.play() {
            Ok(()) => {
                post.state = PlaybackState::Playing;
                post.has_played = true;
                post.play_retry = None;
                info!("Scheduler: playing {}", id);
                out.push(Directive::Notify(id.clone(), PlaybackState::Playing));
            }
            Err(e) => self.on_play_failure(posts, id, e, out),
        }
    }

    fn on_play_failure(&mut self, posts: &mut PostTable, id: &PostId, err: PlaybackError, out: &mut Vec<Directive>) {
        let Some(post) = posts.get_mut(id) else { return };
        let decision = post
            .play_retry
            .as_mut()
            .map(|ladder| ladder.record_failure())
            .unwrap_or(RetryDecision::Exhausted);

        match decision {
            RetryDecision::Retry(delay) => {
                debug!("Scheduler: {} play failed ({}), retry in {}ms", id, err, delay.as_millis());
                out.push(Directive::RetryPlay(id.clone(), delay));
            }
            RetryDecision::Exhausted => {
                warn!("Scheduler: {} play attempts exhausted ({}), click-to-play", id, err);
                if let Some(player) = post.player.as_mut() {
                    player.pause();
                }
                post.play_retry = None;
                post.readiness = None;
                post.state = PlaybackState::TapToPlay;
                self.playing.shift_remove(id);
                if self.focused.as_ref() == Some(id) {
                    self.assign_focus(posts, None);
                }
                out.push(Directive::Notify(id.clone(), PlaybackState::TapToPlay));
            }
        }
    }

    /// Readiness poll fired for a Starting post.
    pub fn on_readiness_poll(
        &mut self,
        posts: &mut PostTable,
        id: &PostId,
        retry: &RetryController,
        now: Duration,
    ) -> Vec<Directive> {
        let mut out = Vec::new();
        let Some(post) = posts.get(id) else { return out };
        if post.state != PlaybackState::Starting {
            return out;
        }
        let ready = post.player.as_ref().is_some_and(|p| p.can_play());
        let status = post
            .readiness
            .map(|w| w.check(now, ready))
            .unwrap_or(if ready { WaitStatus::Ready } else { WaitStatus::TimedOut });

        match status {
            WaitStatus::Pending => out.push(Directive::WaitReady(id.clone())),
            WaitStatus::Ready => self.attempt_play(posts, id, retry, now, &mut out),
            WaitStatus::TimedOut => {
                if let Some(post) = posts.get_mut(id) {
                    post.readiness = None;
                }
                self.on_play_failure(posts, id, PlaybackError::ReadinessTimeout, &mut out);
            }
        }
        let top = first_playing(&self.playing, posts);
        self.refocus(posts, top);
        out
    }

    /// Backoff timer fired for a Starting post.
    pub fn on_play_retry(
        &mut self,
        posts: &mut PostTable,
        id: &PostId,
        retry: &RetryController,
        now: Duration,
    ) -> Vec<Directive> {
        let mut out = Vec::new();
        if posts.state(id) != Some(PlaybackState::Starting) {
            return out;
        }
        self.attempt_play(posts, id, retry, now, &mut out);
        let top = first_playing(&self.playing, posts);
        self.refocus(posts, top);
        out
    }

    /// After a late start, hand focus to the first playing slot holder.
    fn refocus(&mut self, posts: &mut PostTable, top: Option<PostId>) {
        if self.exclusive_audio && self.focused.is_none() {
            self.assign_focus(posts, top);
        }
    }

    /// Move audio focus. Old holder is muted before the new one is unmuted.
    fn assign_focus(&mut self, posts: &mut PostTable, new: Option<PostId>) {
        if self.focused == new {
            return;
        }
        if let Some(old) = self.focused.take() {
            if let Some(player) = posts.get_mut(&old).and_then(|p| p.player.as_mut()) {
                player.set_muted(true);
            }
            trace!("Scheduler: audio focus released by {}", old);
        }
        if let Some(id) = new {
            if let Some(player) = posts.get_mut(&id).and_then(|p| p.player.as_mut()) {
                player.set_muted(false);
                debug!("Scheduler: audio focus -> {}", id);
                self.focused = Some(id);
            }
        }
    }

    pub fn set_exclusive_audio(&mut self, posts: &mut PostTable, enabled: bool) {
        if self.exclusive_audio == enabled {
            return;
        }
        self.exclusive_audio = enabled;
        if !enabled {
            self.assign_focus(posts, None);
            // Back to the muted baseline
            for post in posts.iter_mut() {
                if let Some(player) = post.player.as_mut() {
                    player.set_muted(true);
                }
            }
        }
        info!("Scheduler: exclusive audio {}", if enabled { "on" } else { "off" });
    }

    /// Pause every slot holder and stop autoplay until `resume_all`.
    pub fn pause_all(&mut self, posts: &mut PostTable) -> Vec<Directive> {
        let mut out = Vec::new();
        self.suspended = true;
        let holders: Vec<PostId> = self.playing.iter().cloned().collect();
        for id in holders {
            self.demote(posts, &id, &mut out);
        }
        self.assign_focus(posts, None);
        out
    }

    pub fn resume_all(&mut self) {
        self.suspended = false;
    }

    /// Clear a click-to-play affordance so the post competes again.
    pub fn request_play(&mut self, posts: &mut PostTable, id: &PostId) -> bool {
        let Some(post) = posts.get_mut(id) else { return false };
        if post.state != PlaybackState::TapToPlay {
            return false;
        }
        post.state = if post.has_played { PlaybackState::Paused } else { PlaybackState::Ready };
        true
    }

    /// Take a post out of the playing set without touching its player
    /// (load error on a playing post, eviction, unregister).
    pub fn release(&mut self, posts: &mut PostTable, id: &PostId) {
        self.playing.shift_remove(id);
        if self.focused.as_ref() == Some(id) {
            self.assign_focus(posts, None);
        }
    }

    /// Forget a post that is already gone from the table.
    pub fn forget(&mut self, id: &PostId) {
        self.playing.shift_remove(id);
        if self.focused.as_ref() == Some(id) {
            self.focused = None;
        }
    }

    pub fn reset(&mut self) {
        self.playing.clear();
        self.focused = None;
        self.suspended = false;
    }
}

/// First slot holder that is actually playing.
fn first_playing(playing: &IndexSet<PostId>, posts: &PostTable) -> Option<PostId> {
    playing
        .iter()
        .find(|id| posts.state(id) == Some(PlaybackState::Playing))
        .cloned()
}
