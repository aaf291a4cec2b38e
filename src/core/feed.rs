//! Feed facade: owns every component and exposes the container API.
//!
//! **Architecture**: one `Feed` per visible feed, mutated through `&mut self`
//! from the host's event loop. Nothing here blocks; every wait is a [`Task`]
//! parked in [`Timers`] and run from `tick()`.
//!
//! ```text
//! register_post ─► PostTable + VisibilityTracker
//! on_scroll / on_layout ─► measure ─► reconcile ─► enqueue near posts
//!                                  └► unload sweep ─► eviction ─► pump
//! tick ─► PumpPreload | PreloadPoll | ReadinessPoll | PlayRetry
//!         | HealthCheck | ReloadAfterError
//! ```
//!
//! # Generations
//!
//! `reload_feed()` bumps the generation instead of hunting down pending
//! work. Every task and every in-flight preload carries the generation it was
//! issued under; a task from an older generation is discarded unapplied.

use std::rc::Rc;
use std::time::Duration;

use log::{debug, info, trace, warn};
use serde::Serialize;

use crate::config::{ConcurrencyPolicy, FeedSettings};
use crate::core::clock::{TimerId, Timers};
use crate::core::event_bus::{EventBus, FeedEvent};
use crate::core::eviction::EvictionManager;
use crate::core::player::PlayerHandle;
use crate::core::posts::{Post, PostTable};
use crate::core::preload::PreloadQueue;
use crate::core::retry::{LoadVerdict, RetryController};
use crate::core::scheduler::{Directive, PlaybackScheduler};
use crate::core::visibility::{VisibilityRecord, VisibilityTracker};
use crate::entities::{
    Clock, LayoutProvider, MediaError, MediaErrorKind, MediaHost, MediaSource, PlaybackError, PlaybackState,
    PostId, Quality, ViewRef,
};

/// Priority distance for posts the scheduler wants right now
const PRIORITY_DISTANCE: f64 = -1.0;
/// Queued hover loads go ahead of scheduler targets
const HOVER_DISTANCE: f64 = -2.0;

/// Deferred work. Each variant carries the generation it was issued under.
#[derive(Debug, Clone, PartialEq)]
enum Task {
    PumpPreload { generation: u64 },
    PreloadPoll { post_id: PostId, generation: u64 },
    ReadinessPoll { post_id: PostId, generation: u64 },
    PlayRetry { post_id: PostId, generation: u64 },
    HealthCheck { generation: u64 },
    ReloadAfterError { post_id: PostId, generation: u64 },
}

impl Task {
    fn generation(&self) -> u64 {
        match self {
            Task::PumpPreload { generation }
            | Task::PreloadPoll { generation, .. }
            | Task::ReadinessPoll { generation, .. }
            | Task::PlayRetry { generation, .. }
            | Task::HealthCheck { generation }
            | Task::ReloadAfterError { generation, .. } => *generation,
        }
    }
}

/// Snapshot for diagnostics and the demo binary.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeedStats {
    pub posts: usize,
    pub idle: usize,
    pub preloading: usize,
    pub ready: usize,
    pub starting: usize,
    pub playing: usize,
    pub paused: usize,
    pub unloaded: usize,
    pub tap_to_play: usize,
    pub failed: usize,
    pub active_preloads: usize,
    pub queued_preloads: usize,
    pub generation: u64,
    /// Most posts seen in Playing at once
    pub peak_playing: usize,
    pub load_errors: u64,
    pub permanent_failures: u64,
    pub unloads: u64,
    pub evictions: u64,
    pub stale_discarded: u64,
}

#[derive(Debug, Default)]
struct Counters {
    peak_playing: usize,
    load_errors: u64,
    permanent_failures: u64,
    unloads: u64,
    evictions: u64,
    stale_discarded: u64,
}

pub struct Feed {
    settings: FeedSettings,
    host: Box<dyn MediaHost>,
    clock: Rc<dyn Clock>,
    posts: PostTable,
    tracker: VisibilityTracker,
    scheduler: PlaybackScheduler,
    preload: PreloadQueue,
    eviction: EvictionManager,
    retry: RetryController,
    timers: Timers<Task>,
    events: EventBus,
    generation: u64,
    hd_mode: bool,
    host_visible: bool,
    pump_timer: Option<TimerId>,
    health_timer: Option<TimerId>,
    counters: Counters,
}

impl std::fmt::Debug for Feed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feed")
            .field("posts", &self.posts.len())
            .field("generation", &self.generation)
            .field("hd_mode", &self.hd_mode)
            .field("host_visible", &self.host_visible)
            .field("pending_tasks", &self.timers.len())
            .finish()
    }
}

impl Feed {
    pub fn new<H, C>(settings: FeedSettings, host: H, clock: C) -> Self
    where
        H: MediaHost + 'static,
        C: Clock + 'static,
    {
        let settings = settings.sanitized();
        info!(
            "Feed: max {} videos, {} preloads, exclusive audio {}, hd {}",
            settings.max_concurrent_videos,
            settings.max_simultaneous_preloads,
            settings.exclusive_audio,
            settings.hd_mode
        );
        Self {
            host: Box::new(host),
            clock: Rc::new(clock),
            posts: PostTable::new(),
            tracker: VisibilityTracker::new(settings.visibility_threshold),
            scheduler: PlaybackScheduler::new(&settings.policy(), settings.exclusive_audio),
            preload: PreloadQueue::from_settings(&settings),
            eviction: EvictionManager::from_settings(&settings),
            retry: RetryController::from_settings(&settings),
            timers: Timers::new(),
            events: EventBus::new(),
            generation: 0,
            hd_mode: settings.hd_mode,
            host_visible: true,
            pump_timer: None,
            health_timer: None,
            counters: Counters::default(),
            settings,
        }
    }

    fn now(&self) -> Duration {
        self.clock.now()
    }

    fn schedule(&mut self, delay: Duration, task: Task) -> TimerId {
        let now = self.now();
        self.timers.schedule(now, delay, task)
    }

    // ========== Registration ==========

    /// Add a post at the end of the feed. `source: None` registers a post
    /// without media (never preloaded or played). False if the id exists.
    pub fn register_post(&mut self, post_id: PostId, view: ViewRef, source: Option<MediaSource>) -> bool {
        if self.posts.contains(&post_id) {
            debug!("Feed: {} already registered", post_id);
            return false;
        }
        let post = Post::new(post_id.clone(), view, source, self.generation, self.retry.load_ladder());
        if !post.has_source() {
            debug!("Feed: {} registered without media", post_id);
        }
        self.posts.insert(post);
        self.tracker.observe(post_id, view);
        self.ensure_health_check();
        true
    }

    /// Destroy a post's player and forget it everywhere. False for unknown ids.
    pub fn unregister_post(&mut self, post_id: &PostId) -> bool {
        let Some(mut post) = self.posts.remove(post_id) else {
            return false;
        };
        self.teardown_post(&mut post);
        debug!("Feed: unregistered {}", post_id);
        self.reconcile();
        self.pump();
        true
    }

    fn teardown_post(&mut self, post: &mut Post) {
        self.scheduler.forget(&post.id);
        self.tracker.unobserve(&post.id);
        self.preload.remove(&post.id);
        self.release_in_flight(&post.id);
        if let Some(player) = post.player.as_mut() {
            player.destroy();
        }
    }

    fn release_in_flight(&mut self, post_id: &PostId) {
        if let Some(generation) = self.preload.in_flight(post_id).map(|f| f.generation) {
            self.preload.finish(post_id, generation);
        }
    }

    fn ensure_health_check(&mut self) {
        if self.health_timer.is_some_and(|id| self.timers.is_pending(id)) {
            return;
        }
        let generation = self.generation;
        let interval = self.retry.health_interval();
        self.health_timer = Some(self.schedule(interval, Task::HealthCheck { generation }));
    }

    // ========== Container API ==========

    /// Manual preload (hover/click). Bypasses pacing, not the concurrency gate.
    pub fn request_hover_load(&mut self, post_id: &PostId) -> bool {
        let Some(post) = self.posts.get(post_id) else {
            return false;
        };
        if !self.needs_preload(post) {
            return false;
        }
        if self.preload.is_paused() || !self.preload.has_capacity() {
            debug!("Feed: hover load {} queued behind the gate", post_id);
            self.preload.enqueue(post_id.clone(), HOVER_DISTANCE);
            return true;
        }
        debug!("Feed: hover load {}", post_id);
        self.preload.remove(post_id);
        self.launch(post_id);
        true
    }

    pub fn set_concurrency_policy(&mut self, policy: ConcurrencyPolicy) {
        self.settings.max_concurrent_videos = policy.max_concurrent_videos.max(1);
        self.settings.autoplay_threshold = policy.autoplay_threshold;
        self.settings.unload_distance_px = policy.unload_distance;
        self.scheduler.set_policy(&policy);
        self.eviction.set_unload_distance(policy.unload_distance);
        info!(
            "Feed: policy max {} videos, threshold {:.2}, unload at {:.0}px",
            policy.max_concurrent_videos, policy.autoplay_threshold, policy.unload_distance
        );
        self.reconcile();
    }

    pub fn set_exclusive_audio(&mut self, enabled: bool) {
        self.settings.exclusive_audio = enabled;
        self.scheduler.set_exclusive_audio(&mut self.posts, enabled);
        self.reconcile();
    }

    /// HD mode: high renditions for new loads, tighter preload band and
    /// unload distance (applied immediately). The play cap is unchanged;
    /// only exclusive audio limits playback to one post.
    pub fn set_hd_mode(&mut self, enabled: bool) {
        if self.hd_mode == enabled {
            return;
        }
        self.hd_mode = enabled;
        self.settings.hd_mode = enabled;
        self.preload.set_hd_mode(enabled);
        self.eviction.set_hd_mode(enabled);
        self.preload.prune(&self.tracker);
        self.unload_far();
        info!("Feed: hd mode {}", if enabled { "on" } else { "off" });
    }

    /// Pause everything and stop autoplay until `resume_all`.
    pub fn pause_all(&mut self) {
        let directives = self.scheduler.pause_all(&mut self.posts);
        self.apply(directives);
    }

    pub fn resume_all(&mut self) {
        self.scheduler.resume_all();
        self.reconcile();
    }

    /// User tapped a click-to-play post.
    pub fn request_play(&mut self, post_id: &PostId) -> bool {
        if !self.scheduler.request_play(&mut self.posts, post_id) {
            return false;
        }
        if let Some(state) = self.posts.state(post_id) {
            self.emit_state(post_id, state);
        }
        self.reconcile();
        true
    }

    /// Host view shown/hidden (background tab). Hidden stops all preloading.
    pub fn set_host_visible(&mut self, visible: bool) {
        self.host_visible = visible;
        self.preload.set_paused(!visible);
        if visible {
            self.pump();
        }
    }

    /// Drop every post and start a new generation (filter change). Pending
    /// tasks of the old generation are discarded when they come due.
    pub fn reload_feed(&mut self) {
        self.generation += 1;
        self.teardown_all();
        self.pump_timer = None;
        self.health_timer = None;
        info!("Feed: reloaded, generation {}", self.generation);
    }

    /// Full teardown: posts, timers, subscribers.
    pub fn cleanup(&mut self) {
        self.generation += 1;
        self.teardown_all();
        self.timers.clear();
        self.pump_timer = None;
        self.health_timer = None;
        self.events.clear();
        info!("Feed: cleaned up");
    }

    fn teardown_all(&mut self) {
        for mut post in self.posts.drain() {
            if let Some(player) = post.player.as_mut() {
                player.destroy();
            }
        }
        self.tracker.clear();
        self.preload.reset();
        self.scheduler.reset();
    }

    // ========== Viewport ==========

    pub fn on_scroll(&mut self, scroll_y: f64, layout: &dyn LayoutProvider) {
        let now = self.now();
        let velocity = self.preload.record_scroll(scroll_y, now);
        trace!("Feed: scroll y={:.0} v={:.2}px/ms", scroll_y, velocity);
        self.refresh(layout);
    }

    pub fn on_layout(&mut self, layout: &dyn LayoutProvider) {
        self.refresh(layout);
    }

    fn refresh(&mut self, layout: &dyn LayoutProvider) {
        self.tracker.measure(layout);
        let batch = self.tracker.take_batch();
        if !batch.is_empty() {
            trace!("Feed: {} visibility changes", batch.len());
        }
        // Ratios can cross the autoplay threshold inside one bucket step
        self.reconcile();

        self.enqueue_near();
        let pruned = self.preload.prune(&self.tracker);
        if pruned > 0 {
            trace!("Feed: pruned {} queued preloads", pruned);
        }
        self.preload.mark_cancellations(&self.tracker);

        let now = self.now();
        if self.eviction.sweep_due(now) {
            self.unload_far();
        }
        self.evict_overflow();
        self.pump();
    }

    fn needs_preload(&self, post: &Post) -> bool {
        post.has_source()
            && !post.is_failed()
            && !post.has_live_player()
            // Preloading without a live player: waiting out a load retry
            && post.state != PlaybackState::Preloading
            && !self.preload.is_in_flight(&post.id)
    }

    fn enqueue_near(&mut self) {
        let band = self.preload.band_px();
        let wanted: Vec<(PostId, f64)> = self
            .posts
            .iter()
            .filter(|p| self.needs_preload(p))
            .filter_map(|p| {
                let distance = self.tracker.record(&p.id)?.distance_px;
                (distance <= band).then(|| (p.id.clone(), distance))
            })
            .collect();
        for (post_id, distance) in wanted {
            self.preload.enqueue(post_id, distance);
        }
    }

    fn unload_far(&mut self) {
        let unloaded = self.eviction.unload_far(&mut self.posts, &self.tracker);
        for post_id in unloaded {
            self.counters.unloads += 1;
            self.emit_state(&post_id, PlaybackState::Unloaded);
        }
    }

    fn evict_overflow(&mut self) {
        let victims = self.eviction.eviction_victims(&self.posts, &self.tracker);
        for post_id in victims {
            let Some(mut post) = self.posts.remove(&post_id) else {
                continue;
            };
            self.teardown_post(&mut post);
            self.counters.evictions += 1;
            debug!("Feed: evicted {}", post_id);
            self.events.emit(FeedEvent::PostEvicted { post_id });
        }
    }

    // ========== Scheduling ==========

    fn reconcile(&mut self) {
        let now = self.now();
        let directives = self.scheduler.reconcile(&mut self.posts, &self.tracker, &self.retry, now);
        self.apply(directives);
    }

    fn apply(&mut self, directives: Vec<Directive>) {
        let generation = self.generation;
        let mut wants_pump = false;
        for directive in directives {
            match directive {
                Directive::Notify(post_id, state) => {
                    self.emit_state(&post_id, state);
                    if state == PlaybackState::Playing {
                        let playing = self.posts.iter().filter(|p| p.state == PlaybackState::Playing).count();
                        self.counters.peak_playing = self.counters.peak_playing.max(playing);
                    }
                }
                Directive::WaitReady(post_id) => {
                    let delay = self.retry.readiness_poll();
                    self.schedule(delay, Task::ReadinessPoll { post_id, generation });
                }
                Directive::RetryPlay(post_id, delay) => {
                    self.schedule(delay, Task::PlayRetry { post_id, generation });
                }
                Directive::Preload(post_id) => {
                    let wanted = self.posts.get(&post_id).is_some_and(|p| self.needs_preload(p));
                    if wanted {
                        self.preload.enqueue(post_id, PRIORITY_DISTANCE);
                        wants_pump = true;
                    }
                }
            }
        }
        if wants_pump {
            self.pump();
        }
    }

    fn emit_state(&self, post_id: &PostId, state: PlaybackState) {
        self.events.emit(FeedEvent::PlaybackStateChanged { post_id: post_id.clone(), state });
    }

    /// Set a state outside the scheduler; emits only on change.
    fn set_state(&mut self, post_id: &PostId, state: PlaybackState) {
        let Some(post) = self.posts.get_mut(post_id) else { return };
        if post.state == state {
            return;
        }
        post.state = state;
        self.emit_state(post_id, state);
    }

    // ========== Preload pipeline ==========

    /// Start the next preload unless pacing is in effect.
    fn pump(&mut self) {
        if self.pump_timer.is_some_and(|id| self.timers.is_pending(id)) {
            return;
        }
        self.pump_now();
    }

    fn pump_now(&mut self) {
        let Some(post_id) = self.preload.dequeue_next(&self.posts, &self.tracker) else {
            return;
        };
        self.launch(&post_id);
    }

    /// Start a preload and re-arm pacing.
    fn launch(&mut self, post_id: &PostId) {
        self.start_preload(post_id);

        let delay = self.preload.pacing_delay();
        let generation = self.generation;
        if let Some(old) = self.pump_timer.take() {
            self.timers.cancel(old);
        }
        self.pump_timer = Some(self.schedule(delay, Task::PumpPreload { generation }));
    }

    /// Create (or reload) the player and start polling it.
    fn start_preload(&mut self, post_id: &PostId) {
        let quality = if self.hd_mode { Quality::High } else { Quality::Standard };
        let now = self.now();
        let generation = self.generation;

        let Some(post) = self.posts.get_mut(post_id) else { return };
        let Some(source) = post.source.clone() else { return };
        let reuse = post.player.as_ref().is_some_and(|p| !p.is_destroyed());
        if reuse {
            if let Some(player) = post.player.as_mut() {
                player.reload();
            }
        } else {
            match self.host.create(post_id, &source, quality) {
                Ok(element) => post.player = Some(PlayerHandle::preload(element)),
                Err(e) => {
                    warn!("Feed: {} could not create media: {}", post_id, e);
                    let kind = match e {
                        MediaError::Load(kind) => kind,
                        MediaError::Rejected(_) => MediaErrorKind::Unsupported,
                    };
                    self.handle_load_error(post_id, kind);
                    return;
                }
            }
        }
        post.readiness = None;
        post.play_retry = None;

        self.preload.begin(post_id.clone(), generation, now);
        self.set_state(post_id, PlaybackState::Preloading);
        debug!("Feed: preloading {} ({:?}, {} active)", post_id, quality, self.preload.active());

        let poll = Duration::from_millis(self.settings.preload_poll_ms);
        self.schedule(poll, Task::PreloadPoll { post_id: post_id.clone(), generation });
    }

    fn on_preload_poll(&mut self, post_id: &PostId, generation: u64) -> Result<(), PlaybackError> {
        let Some(flight) = self.preload.in_flight(post_id).copied() else {
            // Finished through another path (unregister, eviction)
            return Ok(());
        };
        if flight.generation != generation {
            return Err(PlaybackError::StaleOperation { issued: generation, current: flight.generation });
        }
        let Some(post) = self.posts.get(post_id) else {
            self.preload.finish(post_id, generation);
            return Err(PlaybackError::UnknownPost(post_id.clone()));
        };
        let Some(player) = post.player.as_ref() else {
            self.preload.finish(post_id, generation);
            return Ok(());
        };

        if let Some(kind) = player.error() {
            self.preload.finish(post_id, generation);
            self.handle_load_error(post_id, kind);
            self.pump();
            return Ok(());
        }
        if player.can_play() {
            self.preload.finish(post_id, generation);
            self.on_preload_ready(post_id, flight.cancelled);
            self.pump();
            return Ok(());
        }

        let timeout = Duration::from_millis(self.settings.preload_timeout_ms);
        if self.now().saturating_sub(flight.started_at) >= timeout {
            self.preload.finish(post_id, generation);
            self.handle_load_error(post_id, MediaErrorKind::Timeout);
            self.pump();
            return Ok(());
        }

        let poll = Duration::from_millis(self.settings.preload_poll_ms);
        self.schedule(poll, Task::PreloadPoll { post_id: post_id.clone(), generation });
        Ok(())
    }

    fn on_preload_ready(&mut self, post_id: &PostId, cancelled: bool) {
        // Scrolled back before the load finished: keep it
        let cancelled = cancelled && self.tracker.distance(post_id) > self.preload.cancel_distance();
        let Some(post) = self.posts.get_mut(post_id) else { return };
        let Some(player) = post.player.as_mut() else { return };
        player.mark_loaded();
        post.load_retry.reset();

        if cancelled {
            player.unload();
            self.counters.unloads += 1;
            debug!("Feed: {} ready after leaving the band, unloaded", post_id);
            self.set_state(post_id, PlaybackState::Unloaded);
            return;
        }
        self.set_state(post_id, PlaybackState::Ready);
        self.reconcile();
    }

    // ========== Failures ==========

    fn handle_load_error(&mut self, post_id: &PostId, kind: MediaErrorKind) {
        let held_slot = self.posts.state(post_id).is_some_and(|s| s.holds_play_slot());
        if held_slot {
            self.scheduler.release(&mut self.posts, post_id);
        }
        let Some(post) = self.posts.get_mut(post_id) else { return };
        if post.is_failed() {
            return;
        }
        if let Some(player) = post.player.as_mut() {
            player.pause();
        }
        post.play_retry = None;
        post.readiness = None;

        self.counters.load_errors += 1;
        let verdict = self.retry.on_load_error(&mut post.load_retry, post_id);
        let retry = post.load_retries();
        self.events.emit(FeedEvent::LoadError { post_id: post_id.clone(), kind, retry });

        match verdict {
            LoadVerdict::RetryAfter(delay) => {
                warn!("Feed: {} load error ({}), retry {} in {}ms", post_id, kind, retry, delay.as_millis());
                self.set_state(post_id, PlaybackState::Preloading);
                let generation = self.generation;
                self.schedule(delay, Task::ReloadAfterError { post_id: post_id.clone(), generation });
            }
            LoadVerdict::PermanentFailure => self.mark_failed(post_id),
        }

        if held_slot {
            self.reconcile();
        }
    }

    /// Destroy the player, keep the post (and its index) as a placeholder.
    fn mark_failed(&mut self, post_id: &PostId) {
        self.preload.remove(post_id);
        self.release_in_flight(post_id);
        let Some(post) = self.posts.get_mut(post_id) else { return };
        if let Some(mut player) = post.player.take() {
            player.destroy();
        }
        self.counters.permanent_failures += 1;
        warn!("Feed: {} permanently failed, showing placeholder", post_id);
        self.set_state(post_id, PlaybackState::Failed);
        self.events.emit(FeedEvent::PermanentFailure { post_id: post_id.clone() });
    }

    fn on_reload_after_error(&mut self, post_id: &PostId, generation: u64) -> Result<(), PlaybackError> {
        let Some(post) = self.posts.get(post_id) else {
            return Err(PlaybackError::UnknownPost(post_id.clone()));
        };
        if post.state != PlaybackState::Preloading || self.preload.is_in_flight(post_id) {
            return Ok(());
        }
        if self.preload.is_paused() || !self.preload.has_capacity() {
            let delay = self.preload.pacing_delay();
            trace!("Feed: {} reload waits for a preload slot", post_id);
            self.schedule(delay, Task::ReloadAfterError { post_id: post_id.clone(), generation });
            return Ok(());
        }
        self.start_preload(post_id);
        Ok(())
    }

    fn on_health_check(&mut self) {
        let errors = {
            let posts = &self.posts;
            let preload = &self.preload;
            self.retry.scan_errors(posts, |id| {
                preload.is_in_flight(id) || posts.state(id) == Some(PlaybackState::Preloading)
            })
        };
        for (post_id, kind) in errors {
            self.handle_load_error(&post_id, kind);
        }
        let generation = self.generation;
        let interval = self.retry.health_interval();
        self.health_timer = Some(self.schedule(interval, Task::HealthCheck { generation }));
    }

    // ========== Timer dispatch ==========

    /// Run every task that is due. Call from the host's timer/frame callback.
    /// Returns the number of tasks run (including discarded ones).
    pub fn tick(&mut self) -> usize {
        let now = self.now();
        let mut ran = 0;
        while let Some(task) = self.timers.pop_due(now) {
            ran += 1;
            if let Err(e) = self.run_task(task) {
                match e {
                    PlaybackError::StaleOperation { .. } => {
                        self.counters.stale_discarded += 1;
                        trace!("Feed: discarded task: {}", e);
                    }
                    PlaybackError::UnknownPost(_) => trace!("Feed: task skipped: {}", e),
                    _ => warn!("Feed: task failed: {}", e),
                }
            }
        }
        ran
    }

    fn run_task(&mut self, task: Task) -> Result<(), PlaybackError> {
        let issued = task.generation();
        if issued != self.generation {
            return Err(PlaybackError::StaleOperation { issued, current: self.generation });
        }
        let now = self.now();
        match task {
            Task::PumpPreload { .. } => {
                self.pump_timer = None;
                self.pump();
            }
            Task::PreloadPoll { post_id, generation } => self.on_preload_poll(&post_id, generation)?,
            Task::ReadinessPoll { post_id, .. } => {
                let directives = self.scheduler.on_readiness_poll(&mut self.posts, &post_id, &self.retry, now);
                self.apply(directives);
            }
            Task::PlayRetry { post_id, .. } => {
                let directives = self.scheduler.on_play_retry(&mut self.posts, &post_id, &self.retry, now);
                self.apply(directives);
            }
            Task::HealthCheck { .. } => self.on_health_check(),
            Task::ReloadAfterError { post_id, generation } => self.on_reload_after_error(&post_id, generation)?,
        }
        Ok(())
    }

    /// When the next task comes due, for hosts that sleep between ticks.
    pub fn next_due(&self) -> Option<Duration> {
        self.timers.next_due()
    }

    // ========== Queries ==========

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn settings(&self) -> &FeedSettings {
        &self.settings
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn hd_mode(&self) -> bool {
        self.hd_mode
    }

    pub fn len(&self) -> usize {
        self.posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }

    pub fn state(&self, post_id: &PostId) -> Option<PlaybackState> {
        self.posts.state(post_id)
    }

    /// Feed index of a post.
    pub fn position(&self, post_id: &PostId) -> Option<usize> {
        self.posts.index_of(post_id)
    }

    pub fn visibility(&self, post_id: &PostId) -> Option<&VisibilityRecord> {
        self.tracker.record(post_id)
    }

    /// Posts currently playing, in feed order.
    pub fn playing(&self) -> Vec<PostId> {
        self.posts
            .iter()
            .filter(|p| p.state == PlaybackState::Playing)
            .map(|p| p.id.clone())
            .collect()
    }

    /// Posts whose player is unmuted.
    pub fn audible(&self) -> Vec<PostId> {
        self.posts.iter().filter(|p| !p.muted()).map(|p| p.id.clone()).collect()
    }

    pub fn active_preloads(&self) -> usize {
        self.preload.active()
    }

    pub fn stats(&self) -> FeedStats {
        let mut stats = FeedStats {
            posts: self.posts.len(),
            active_preloads: self.preload.active(),
            queued_preloads: self.preload.len(),
            generation: self.generation,
            peak_playing: self.counters.peak_playing,
            load_errors: self.counters.load_errors,
            permanent_failures: self.counters.permanent_failures,
            unloads: self.counters.unloads,
            evictions: self.counters.evictions,
            stale_discarded: self.counters.stale_discarded,
            ..FeedStats::default()
        };
        for post in self.posts.iter() {
            let slot = match post.state {
                PlaybackState::Idle => &mut stats.idle,
                PlaybackState::Preloading => &mut stats.preloading,
                PlaybackState::Ready => &mut stats.ready,
                PlaybackState::Starting => &mut stats.starting,
                PlaybackState::Playing => &mut stats.playing,
                PlaybackState::Paused => &mut stats.paused,
                PlaybackState::Unloaded => &mut stats.unloaded,
                PlaybackState::TapToPlay => &mut stats.tap_to_play,
                PlaybackState::Failed => &mut stats.failed,
            };
            *slot += 1;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::sim::{SimBehavior, SimHost, SimLayout};
    use std::sync::{Arc, Mutex};

    struct Harness {
        feed: Feed,
        host: SimHost,
        clock: Arc<ManualClock>,
        layout: SimLayout,
    }

    fn id(i: usize) -> PostId {
        PostId::new(format!("p{i}"))
    }

    /// `count` posts of 400px in an 800px viewport: two fully visible at a time.
    fn harness(settings: FeedSettings, count: usize) -> Harness {
        let clock = Arc::new(ManualClock::new());
        let host = SimHost::new(clock.clone());
        let mut feed = Feed::new(settings, host.clone(), clock.clone());
        for i in 0..count {
            let source = MediaSource::new(format!("{i}.mp4")).with_hd(format!("{i}_hd.mp4"));
            feed.register_post(id(i), ViewRef(i as u64), Some(source));
        }
        Harness { feed, host, clock, layout: SimLayout::new(count, 400.0, 0.0, 800.0) }
    }

    impl Harness {
        fn layout(&mut self) {
            self.feed.on_layout(&self.layout);
        }

        fn scroll(&mut self, y: f64) {
            self.layout.scroll_to(y);
            let y = self.layout.scroll_y();
            self.feed.on_scroll(y, &self.layout);
        }

        /// Advance virtual time in 10ms steps.
        fn run(&mut self, ms: u64) {
            for _ in 0..ms / 10 {
                self.clock.advance(Duration::from_millis(10));
                self.feed.tick();
            }
        }

        fn slot_holders(&self) -> usize {
            let s = self.feed.stats();
            s.starting + s.playing
        }
    }

    #[test]
    fn test_scroll_moves_playback_to_visible_pair() {
        let mut h = harness(FeedSettings::default(), 20);
        h.layout();
        h.run(2000);
        assert_eq!(h.feed.playing(), vec![id(0), id(1)]);

        h.scroll(800.0);
        h.run(1000);
        assert_eq!(h.feed.playing(), vec![id(2), id(3)]);
        assert_eq!(h.feed.state(&id(0)), Some(PlaybackState::Paused));
        assert_eq!(h.feed.state(&id(1)), Some(PlaybackState::Paused));
        assert!(h.feed.stats().peak_playing <= 2);
    }

    #[test]
    fn test_concurrency_bound_under_random_scrolling() {
        let mut h = harness(FeedSettings::default(), 40);
        h.layout();
        let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;
        for _ in 0..200 {
            seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
            let y = ((seed >> 33) % 15_000) as f64;
            h.scroll(y);
            assert!(h.slot_holders() <= 2);
            h.run(((seed >> 20) % 400) + 10);
            assert!(h.slot_holders() <= 2);
        }
        assert!(h.feed.stats().peak_playing <= 2);
    }

    #[test]
    fn test_load_failure_backs_off_then_fails_in_place() {
        let mut h = harness(FeedSettings::default(), 6);
        h.host.set_behavior(&id(0), SimBehavior { fail_loads: u32::MAX, ..SimBehavior::default() });

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let clock = h.clock.clone();
        h.feed.events().subscribe(move |e| {
            if let FeedEvent::LoadError { .. } = e {
                sink.lock().unwrap().push(clock.now());
            }
        });

        h.layout();
        h.run(40_000);

        let times = seen.lock().unwrap().clone();
        assert_eq!(times.len(), 6);
        let expected = [1000u64, 2000, 4000, 8000, 16_000];
        for (pair, delay) in times.windows(2).zip(expected) {
            let gap = (pair[1] - pair[0]).as_millis() as u64;
            assert!(gap >= delay && gap < delay + 600, "gap {} for delay {}", gap, delay);
        }

        assert_eq!(h.feed.state(&id(0)), Some(PlaybackState::Failed));
        assert_eq!(h.feed.position(&id(0)), Some(0));
        assert_eq!(h.host.probe(&id(0)).unwrap().destroys, 1);
        assert_eq!(h.feed.stats().permanent_failures, 1);
        let failures = h
            .feed
            .events()
            .poll()
            .into_iter()
            .filter(|e| matches!(e, FeedEvent::PermanentFailure { .. }))
            .count();
        assert_eq!(failures, 1);
        // Neighbour keeps playing
        assert!(h.feed.playing().contains(&id(1)));
    }

    #[test]
    fn test_rejected_autoplay_falls_back_to_tap_to_play() {
        let mut h = harness(FeedSettings::default(), 4);
        h.host.set_behavior(&id(0), SimBehavior { reject_plays: 5, ..SimBehavior::default() });
        h.layout();
        h.run(6000);
        assert_eq!(h.feed.state(&id(0)), Some(PlaybackState::TapToPlay));
        assert_eq!(h.feed.playing(), vec![id(1)]);

        // Sixth play() succeeds once the user asks
        assert!(h.feed.request_play(&id(0)));
        h.run(100);
        assert!(h.feed.playing().contains(&id(0)));
    }

    #[test]
    fn test_stalled_preload_never_takes_a_slot() {
        let mut h = harness(FeedSettings::default(), 4);
        h.host.set_behavior(&id(0), SimBehavior { never_ready: true, ..SimBehavior::default() });
        h.layout();
        h.run(1000);
        // Metadata only: never reaches Ready, so it never takes a slot
        assert_eq!(h.feed.state(&id(0)), Some(PlaybackState::Preloading));
        assert_eq!(h.feed.playing(), vec![id(1)]);
        assert_eq!(h.host.probe(&id(0)).unwrap().play_calls, 0);
    }

    #[test]
    fn test_stale_generation_is_discarded() {
        let mut h = harness(FeedSettings::default(), 3);
        h.layout();
        assert_eq!(h.feed.active_preloads(), 1);

        h.feed.reload_feed();
        assert!(h.feed.register_post(id(0), ViewRef(0), Some(MediaSource::new("0.mp4"))));
        h.run(1000);

        let stats = h.feed.stats();
        assert!(stats.stale_discarded >= 2);
        assert_eq!(stats.generation, 1);
        assert_eq!(h.feed.state(&id(0)), Some(PlaybackState::Idle));
        assert_eq!(h.feed.active_preloads(), 0);
        assert_eq!(h.host.probe(&id(0)).unwrap().creates, 1);
    }

    #[test]
    fn test_hidden_host_pauses_preloading() {
        let mut h = harness(FeedSettings::default(), 10);
        h.feed.set_host_visible(false);
        h.layout();
        h.run(1000);
        assert_eq!(h.host.total_creates(), 0);
        assert!(h.feed.playing().is_empty());

        h.feed.set_host_visible(true);
        h.run(2000);
        assert_eq!(h.feed.playing(), vec![id(0), id(1)]);
    }

    #[test]
    fn test_eviction_keeps_visible_posts() {
        let settings = FeedSettings { target_working_set: 4, ..FeedSettings::default() };
        let mut h = harness(settings, 10);
        h.layout();
        assert_eq!(h.feed.len(), 4);
        for i in 0..4 {
            assert!(h.feed.state(&id(i)).is_some());
        }
        let evicted = h
            .feed
            .events()
            .poll()
            .into_iter()
            .filter(|e| matches!(e, FeedEvent::PostEvicted { .. }))
            .count();
        assert_eq!(evicted, 6);
        assert_eq!(h.feed.stats().evictions, 6);
    }

    #[test]
    fn test_hover_load_starts_immediately() {
        let mut h = harness(FeedSettings::default(), 10);
        assert!(h.feed.request_hover_load(&id(3)));
        assert_eq!(h.feed.active_preloads(), 1);
        assert_eq!(h.host.probe(&id(3)).unwrap().creates, 1);
        assert!(!h.feed.request_hover_load(&id(3)));
        assert!(!h.feed.request_hover_load(&PostId::new("missing")));
    }

    #[test]
    fn test_preload_cancelled_mid_flight_unloads_on_ready() {
        let mut h = harness(FeedSettings::default(), 20);
        h.host.set_default_behavior(SimBehavior { load_latency_ms: 1000, ..SimBehavior::default() });
        assert!(h.feed.request_hover_load(&id(5)));
        h.scroll(6000.0);
        h.run(1500);
        assert_eq!(h.feed.state(&id(5)), Some(PlaybackState::Unloaded));
        assert_eq!(h.host.probe(&id(5)).unwrap().releases, 1);
    }

    #[test]
    fn test_cancelled_preload_kept_when_scrolled_back() {
        let mut h = harness(FeedSettings::default(), 20);
        h.host.set_default_behavior(SimBehavior { load_latency_ms: 1000, ..SimBehavior::default() });
        assert!(h.feed.request_hover_load(&id(5)));
        h.scroll(6000.0);
        h.run(200);
        h.scroll(1600.0);
        h.run(1500);
        assert!(h.feed.playing().contains(&id(5)));
        assert_eq!(h.host.probe(&id(5)).unwrap().releases, 0);
    }

    #[test]
    fn test_hover_load_jumps_the_queue() {
        let mut h = harness(FeedSettings::default(), 10);
        h.layout();
        // p0 took the pacing slot, p1 waits in the queue
        assert!(h.host.probe(&id(1)).is_none());
        assert!(h.feed.request_hover_load(&id(3)));
        assert_eq!(h.host.probe(&id(3)).unwrap().creates, 1);
        assert!(h.host.probe(&id(1)).is_none());

        // Gate full: the next hover is queued ahead of nearer posts
        assert!(h.feed.request_hover_load(&id(4)));
        assert!(h.host.probe(&id(4)).is_none());
        h.run(400);
        assert_eq!(h.host.probe(&id(4)).unwrap().creates, 1);
    }

    #[test]
    fn test_playback_follows_threshold_within_one_ratio_step() {
        let mut h = harness(FeedSettings::default(), 20);
        h.layout();
        h.run(2000);
        h.scroll(180.0);
        h.run(1000);
        assert_eq!(h.feed.playing(), vec![id(0), id(1)]);

        // p0 0.55 -> 0.45 and p2 0.45 -> 0.55: same 0.2 step for both
        h.scroll(220.0);
        h.run(3000);
        assert_eq!(h.feed.playing(), vec![id(1), id(2)]);
        assert_eq!(h.feed.state(&id(0)), Some(PlaybackState::Paused));
    }

    #[test]
    fn test_far_posts_unload_and_reload_on_return() {
        let mut h = harness(FeedSettings::default(), 20);
        h.layout();
        h.run(2000);
        // Walk down so the unload sweep runs past its throttle
        for step in 1..=10 {
            h.scroll(step as f64 * 400.0);
            h.run(600);
        }
        assert_eq!(h.feed.state(&id(0)), Some(PlaybackState::Unloaded));
        assert_eq!(h.host.probe(&id(0)).unwrap().releases, 1);

        h.scroll(0.0);
        h.run(2000);
        assert!(h.feed.playing().contains(&id(0)));
        assert!(h.host.probe(&id(0)).unwrap().loads >= 2);
    }

    #[test]
    fn test_exclusive_audio_single_audible() {
        let settings = FeedSettings { exclusive_audio: true, ..FeedSettings::default() };
        let mut h = harness(settings, 20);
        h.layout();
        h.run(2000);
        assert_eq!(h.feed.audible(), vec![id(0)]);
        for y in [800.0, 200.0, 1600.0, 0.0] {
            h.scroll(y);
            h.run(1000);
            assert!(h.feed.audible().len() <= 1);
        }
        assert_eq!(h.host.peak_audible(), 1);

        h.feed.set_exclusive_audio(false);
        assert!(h.feed.audible().is_empty());
        assert_eq!(h.host.audible(), 0);
    }

    #[test]
    fn test_pause_all_and_resume_all() {
        let mut h = harness(FeedSettings::default(), 6);
        h.layout();
        h.run(2000);
        h.feed.pause_all();
        assert!(h.feed.playing().is_empty());
        h.scroll(10.0);
        h.run(500);
        assert!(h.feed.playing().is_empty());
        h.feed.resume_all();
        assert_eq!(h.feed.playing().len(), 2);
    }

    #[test]
    fn test_policy_change_demotes_extra() {
        let mut h = harness(FeedSettings::default(), 6);
        h.layout();
        h.run(2000);
        assert_eq!(h.feed.playing().len(), 2);
        h.feed.set_concurrency_policy(ConcurrencyPolicy {
            max_concurrent_videos: 1,
            autoplay_threshold: 0.5,
            unload_distance: 2000.0,
        });
        assert_eq!(h.feed.playing(), vec![id(0)]);
    }

    #[test]
    fn test_unregister_releases_everything() {
        let mut h = harness(FeedSettings::default(), 6);
        h.layout();
        h.run(2000);
        assert!(h.feed.unregister_post(&id(0)));
        assert!(!h.feed.unregister_post(&id(0)));
        assert_eq!(h.feed.state(&id(0)), None);
        assert_eq!(h.host.probe(&id(0)).unwrap().destroys, 1);
        assert_eq!(h.feed.playing(), vec![id(1)]);
    }

    #[test]
    fn test_hd_mode_requests_high_rendition() {
        let settings = FeedSettings { hd_mode: true, ..FeedSettings::default() };
        let mut h = harness(settings, 4);
        h.layout();
        let probe = h.host.probe(&id(0)).unwrap();
        assert_eq!(probe.quality, Some(Quality::High));
        assert_eq!(probe.url, "0_hd.mp4");

        // HD does not narrow the play cap
        h.run(2000);
        assert_eq!(h.feed.playing(), vec![id(0), id(1)]);
    }

    #[test]
    fn test_post_without_source_is_ignored() {
        let mut h = harness(FeedSettings::default(), 0);
        h.layout = SimLayout::new(2, 400.0, 0.0, 800.0);
        h.feed.register_post(id(0), ViewRef(0), None);
        h.feed.register_post(id(1), ViewRef(1), Some(MediaSource::new("1.mp4")));
        h.layout();
        h.run(1000);
        assert_eq!(h.feed.state(&id(0)), Some(PlaybackState::Idle));
        assert!(h.host.probe(&id(0)).is_none());
        assert_eq!(h.feed.playing(), vec![id(1)]);
    }

    #[test]
    fn test_cleanup_tears_down() {
        let mut h = harness(FeedSettings::default(), 6);
        h.feed.events().subscribe(|_| {});
        h.layout();
        h.run(2000);
        h.feed.cleanup();
        assert!(h.feed.is_empty());
        assert!(h.feed.next_due().is_none());
        assert!(!h.feed.events().has_subscribers());
        for i in 0..6 {
            if let Some(probe) = h.host.probe(&id(i)) {
                assert_eq!(probe.destroys, probe.creates);
            }
        }
    }
}
