//! Simulated host: a vertical list layout and scriptable media elements.
//!
//! Used by the demo binary and by unit tests. Everything runs off an injected
//! [`Clock`], so a `ManualClock` makes load latency and playback position
//! fully deterministic.
//!
//! `SimHost` is a cheap handle over shared state: clone it before handing it
//! to a feed and keep the clone to inspect per-post [`SimProbe`] counters.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::Duration;

use log::trace;
use serde::Serialize;

use crate::entities::{
    Clock, LayoutProvider, MediaElement, MediaError, MediaErrorKind, MediaHost, MediaSource, PostId, Quality,
    ReadyState, Rect, ViewRef,
};

// ========== Layout ==========

/// Fixed-height items stacked vertically; view `i` is item `i`.
#[derive(Debug, Clone)]
pub struct SimLayout {
    count: usize,
    item_height: f64,
    gap: f64,
    width: f64,
    viewport_height: f64,
    scroll_y: f64,
    hidden: HashSet<ViewRef>,
}

impl SimLayout {
    pub fn new(count: usize, item_height: f64, gap: f64, viewport_height: f64) -> Self {
        Self {
            count,
            item_height,
            gap,
            width: 400.0,
            viewport_height,
            scroll_y: 0.0,
            hidden: HashSet::new(),
        }
    }

    pub fn scroll_to(&mut self, y: f64) {
        self.scroll_y = y.clamp(0.0, self.max_scroll());
    }

    pub fn scroll_y(&self) -> f64 {
        self.scroll_y
    }

    pub fn max_scroll(&self) -> f64 {
        (self.content_height() - self.viewport_height).max(0.0)
    }

    pub fn content_height(&self) -> f64 {
        self.count as f64 * (self.item_height + self.gap)
    }

    /// Append items (infinite scroll page load).
    pub fn extend(&mut self, more: usize) {
        self.count += more;
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Simulate a view that is not laid out yet.
    pub fn hide_view(&mut self, view: ViewRef) {
        self.hidden.insert(view);
    }

    pub fn show_view(&mut self, view: ViewRef) {
        self.hidden.remove(&view);
    }
}

impl LayoutProvider for SimLayout {
    fn viewport(&self) -> Rect {
        Rect::new(0.0, self.scroll_y, self.width, self.viewport_height)
    }

    fn bounds(&self, view: ViewRef) -> Option<Rect> {
        let index = view.0 as usize;
        if index >= self.count || self.hidden.contains(&view) {
            return None;
        }
        let top = index as f64 * (self.item_height + self.gap);
        Some(Rect::new(0.0, top, self.width, self.item_height))
    }
}

// ========== Media ==========

/// Scripted behaviour of one post's media.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimBehavior {
    /// Time from load() to HaveEnoughData
    pub load_latency_ms: u64,
    /// The first N loads end in `error_kind` (u32::MAX: always)
    pub fail_loads: u32,
    pub error_kind: MediaErrorKind,
    /// The first N play() calls are rejected
    pub reject_plays: u32,
    /// Stalls at HaveMetadata forever
    pub never_ready: bool,
    /// create() itself fails
    pub fail_create: bool,
}

impl Default for SimBehavior {
    fn default() -> Self {
        Self {
            load_latency_ms: 300,
            fail_loads: 0,
            error_kind: MediaErrorKind::Network,
            reject_plays: 0,
            never_ready: false,
            fail_create: false,
        }
    }
}

/// Observable counters for one post.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimProbe {
    pub creates: u32,
    pub loads: u32,
    pub releases: u32,
    pub destroys: u32,
    pub play_calls: u32,
    pub plays: u32,
    pub muted: bool,
    pub playing: bool,
    pub quality: Option<Quality>,
    pub url: String,
}

impl Default for SimProbe {
    fn default() -> Self {
        Self {
            creates: 0,
            loads: 0,
            releases: 0,
            destroys: 0,
            play_calls: 0,
            plays: 0,
            muted: true,
            playing: false,
            quality: None,
            url: String::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Registry {
    default_behavior: SimBehavior,
    behaviors: HashMap<PostId, SimBehavior>,
    probes: HashMap<PostId, SimProbe>,
    /// Elements alive and unmuted right now
    audible: HashSet<PostId>,
    peak_audible: usize,
}

impl Registry {
    fn behavior(&self, id: &PostId) -> SimBehavior {
        self.behaviors.get(id).copied().unwrap_or(self.default_behavior)
    }
}

#[derive(Clone)]
pub struct SimHost {
    registry: Rc<RefCell<Registry>>,
    clock: Rc<dyn Clock>,
}

impl std::fmt::Debug for SimHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimHost")
            .field("posts", &self.registry.borrow().probes.len())
            .finish()
    }
}

impl SimHost {
    pub fn new<C: Clock + 'static>(clock: C) -> Self {
        Self {
            registry: Rc::new(RefCell::new(Registry::default())),
            clock: Rc::new(clock),
        }
    }

    /// Behaviour for posts without an explicit override.
    pub fn set_default_behavior(&self, behavior: SimBehavior) {
        self.registry.borrow_mut().default_behavior = behavior;
    }

    pub fn set_behavior(&self, post_id: &PostId, behavior: SimBehavior) {
        self.registry.borrow_mut().behaviors.insert(post_id.clone(), behavior);
    }

    pub fn probe(&self, post_id: &PostId) -> Option<SimProbe> {
        self.registry.borrow().probes.get(post_id).cloned()
    }

    /// Unmuted elements right now.
    pub fn audible(&self) -> usize {
        self.registry.borrow().audible.len()
    }

    /// Highest number of simultaneously unmuted elements ever seen.
    pub fn peak_audible(&self) -> usize {
        self.registry.borrow().peak_audible
    }

    pub fn total_creates(&self) -> u32 {
        self.registry.borrow().probes.values().map(|p| p.creates).sum()
    }
}

impl MediaHost for SimHost {
    fn create(
        &mut self,
        post_id: &PostId,
        source: &MediaSource,
        quality: Quality,
    ) -> Result<Box<dyn MediaElement>, MediaError> {
        let mut reg = self.registry.borrow_mut();
        let behavior = reg.behavior(post_id);
        if behavior.fail_create {
            return Err(MediaError::Load(MediaErrorKind::Unsupported));
        }
        let probe = reg.probes.entry(post_id.clone()).or_default();
        probe.creates += 1;
        probe.quality = Some(quality);
        probe.url = source.url_for(quality).to_string();
        trace!("SimHost: created element for {} ({})", post_id, probe.url);

        Ok(Box::new(SimElement {
            post_id: post_id.clone(),
            registry: Rc::clone(&self.registry),
            clock: Rc::clone(&self.clock),
            load_started: None,
            load_number: 0,
            position: 0.0,
            playing_since: None,
        }))
    }
}

struct SimElement {
    post_id: PostId,
    registry: Rc<RefCell<Registry>>,
    clock: Rc<dyn Clock>,
    /// None: never loaded, released or destroyed
    load_started: Option<Duration>,
    /// Per-post load ordinal of the current load
    load_number: u32,
    position: f64,
    playing_since: Option<Duration>,
}

impl SimElement {
    fn behavior(&self) -> SimBehavior {
        self.registry.borrow().behavior(&self.post_id)
    }

    fn with_probe(&self, f: impl FnOnce(&mut SimProbe)) {
        let mut reg = self.registry.borrow_mut();
        f(reg.probes.entry(self.post_id.clone()).or_default());
    }

    fn elapsed(&self) -> Option<Duration> {
        self.load_started.map(|t| self.clock.now().saturating_sub(t))
    }

    fn load_failing(&self) -> bool {
        let b = self.behavior();
        self.load_number <= b.fail_loads
            && self.elapsed().is_some_and(|e| e >= Duration::from_millis(b.load_latency_ms))
    }

    fn set_audible(&self, audible: bool) {
        let mut reg = self.registry.borrow_mut();
        if audible {
            reg.audible.insert(self.post_id.clone());
            reg.peak_audible = reg.peak_audible.max(reg.audible.len());
        } else {
            reg.audible.remove(&self.post_id);
        }
    }

    fn stop_clock(&mut self) {
        if let Some(since) = self.playing_since.take() {
            self.position += self.clock.now().saturating_sub(since).as_secs_f64();
        }
    }
}

impl MediaElement for SimElement {
    fn load(&mut self) {
        self.load_started = Some(self.clock.now());
        let mut number = 0;
        self.with_probe(|p| {
            p.loads += 1;
            number = p.loads;
        });
        self.load_number = number;
    }

    fn ready_state(&self) -> ReadyState {
        let Some(elapsed) = self.elapsed() else {
            return ReadyState::HaveNothing;
        };
        if self.load_failing() {
            return ReadyState::HaveNothing;
        }
        let b = self.behavior();
        let latency = Duration::from_millis(b.load_latency_ms);
        if elapsed >= latency {
            if b.never_ready { ReadyState::HaveMetadata } else { ReadyState::HaveEnoughData }
        } else if elapsed >= latency / 2 {
            ReadyState::HaveMetadata
        } else {
            ReadyState::HaveNothing
        }
    }

    fn play(&mut self) -> Result<(), MediaError> {
        let reject = self.behavior().reject_plays;
        let mut calls = 0;
        self.with_probe(|p| {
            p.play_calls += 1;
            calls = p.play_calls;
        });
        if calls <= reject {
            return Err(MediaError::Rejected("autoplay blocked".to_string()));
        }
        if self.playing_since.is_none() {
            self.playing_since = Some(self.clock.now());
        }
        self.with_probe(|p| {
            p.plays += 1;
            p.playing = true;
        });
        Ok(())
    }

    fn pause(&mut self) {
        self.stop_clock();
        self.with_probe(|p| p.playing = false);
    }

    fn set_muted(&mut self, muted: bool) {
        self.with_probe(|p| p.muted = muted);
        self.set_audible(!muted);
    }

    fn current_time(&self) -> f64 {
        let running = self
            .playing_since
            .map(|since| self.clock.now().saturating_sub(since).as_secs_f64())
            .unwrap_or(0.0);
        self.position + running
    }

    fn seek(&mut self, secs: f64) {
        self.position = secs.max(0.0);
        if self.playing_since.is_some() {
            self.playing_since = Some(self.clock.now());
        }
    }

    fn release(&mut self) {
        self.stop_clock();
        self.load_started = None;
        self.with_probe(|p| {
            p.releases += 1;
            p.playing = false;
        });
    }

    fn destroy(&mut self) {
        self.stop_clock();
        self.load_started = None;
        self.set_audible(false);
        self.with_probe(|p| {
            p.destroys += 1;
            p.playing = false;
            p.muted = true;
        });
    }

    fn error(&self) -> Option<MediaErrorKind> {
        self.load_failing().then(|| self.behavior().error_kind)
    }
}
