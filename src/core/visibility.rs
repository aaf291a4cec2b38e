//! Visibility tracker: intersection ratio and viewport distance per post.
//!
//! Host-agnostic replacement for a browser intersection observer. On every
//! scroll/resize/layout tick the feed calls `measure()` with the host's
//! `LayoutProvider`; the tracker refreshes every observed record and queues an
//! event for each post whose intersection state moved past the configured
//! threshold step. `take_batch()` hands the queued events to the scheduler.
//!
//! Distances are refreshed on every measure even when no event is emitted:
//! the preload queue and eviction manager read them through `record()`.

use indexmap::IndexMap;
use log::trace;

use crate::entities::{LayoutProvider, PostId, ViewRef};

/// Snapshot of one post's relation to the viewport.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct VisibilityRecord {
    pub post_id: PostId,
    /// Visible fraction of the element, 0..=1
    pub intersection_ratio: f32,
    /// Gap between element and viewport along the scroll axis (0 when intersecting)
    pub distance_px: f64,
    pub is_intersecting: bool,
}

impl VisibilityRecord {
    fn unmeasured(post_id: PostId) -> Self {
        Self {
            post_id,
            intersection_ratio: 0.0,
            distance_px: 0.0,
            is_intersecting: false,
        }
    }
}

/// What changed for a post since its last reported record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum VisibilityChange {
    Enter,
    Exit,
    Ratio,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct VisibilityEvent {
    pub change: VisibilityChange,
    pub record: VisibilityRecord,
}

#[derive(Debug)]
struct Observation {
    view: ViewRef,
    current: VisibilityRecord,
    /// Last record that produced an event; None until the first measure
    reported: Option<VisibilityRecord>,
}

#[derive(Debug)]
pub struct VisibilityTracker {
    threshold: f32,
    observed: IndexMap<PostId, Observation>,
    pending: Vec<VisibilityEvent>,
}

impl VisibilityTracker {
    /// `threshold` is the ratio step that counts as a change (e.g. 0.2).
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold: threshold.clamp(0.01, 1.0),
            observed: IndexMap::new(),
            pending: Vec::new(),
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Begin tracking. No-op (false) if already observed.
    pub fn observe(&mut self, post_id: PostId, view: ViewRef) -> bool {
        if self.observed.contains_key(&post_id) {
            trace!("VisibilityTracker: {} already observed", post_id);
            return false;
        }
        let current = VisibilityRecord::unmeasured(post_id.clone());
        self.observed.insert(post_id, Observation { view, current, reported: None });
        true
    }

    /// Stop tracking and drop any queued events for the post.
    pub fn unobserve(&mut self, post_id: &PostId) -> bool {
        self.pending.retain(|e| &e.record.post_id != post_id);
        self.observed.shift_remove(post_id).is_some()
    }

    pub fn is_observed(&self, post_id: &PostId) -> bool {
        self.observed.contains_key(post_id)
    }

    pub fn len(&self) -> usize {
        self.observed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observed.is_empty()
    }

    /// Refresh every observed record and queue change events.
    /// Returns the number of events queued by this call.
    pub fn measure(&mut self, layout: &dyn LayoutProvider) -> usize {
        let viewport = layout.viewport();
        let threshold = self.threshold;
        let mut queued = 0;

        for (post_id, obs) in self.observed.iter_mut() {
            obs.current = match layout.bounds(obs.view) {
                Some(rect) => {
                    let ratio = rect.visible_ratio(&viewport);
                    VisibilityRecord {
                        post_id: post_id.clone(),
                        intersection_ratio: ratio,
                        distance_px: rect.vertical_distance(&viewport),
                        is_intersecting: ratio > 0.0,
                    }
                }
                // Not laid out yet: treat as adjacent rather than far away
                None => VisibilityRecord::unmeasured(post_id.clone()),
            };

            let change = match &obs.reported {
                None if obs.current.is_intersecting => Some(VisibilityChange::Enter),
                None => Some(VisibilityChange::Exit),
                Some(prev) => classify(prev, &obs.current, threshold),
            };

            if let Some(change) = change {
                obs.reported = Some(obs.current.clone());
                self.pending.push(VisibilityEvent { change, record: obs.current.clone() });
                queued += 1;
            }
        }

        if queued > 0 {
            trace!("VisibilityTracker: {} change(s) queued", queued);
        }
        queued
    }

    /// Drain queued events.
    pub fn take_batch(&mut self) -> Vec<VisibilityEvent> {
        std::mem::take(&mut self.pending)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Latest record for a post (distance always current).
    pub fn record(&self, post_id: &PostId) -> Option<&VisibilityRecord> {
        self.observed.get(post_id).map(|o| &o.current)
    }

    pub fn records(&self) -> impl Iterator<Item = &VisibilityRecord> {
        self.observed.values().map(|o| &o.current)
    }

    /// Distance used for ordering; unknown posts count as adjacent.
    pub fn distance(&self, post_id: &PostId) -> f64 {
        self.record(post_id).map(|r| r.distance_px).unwrap_or(0.0)
    }

    pub fn is_intersecting(&self, post_id: &PostId) -> bool {
        self.record(post_id).is_some_and(|r| r.is_intersecting)
    }

    pub fn clear(&mut self) {
        self.observed.clear();
        self.pending.clear();
    }
}

fn bucket(ratio: f32, threshold: f32) -> u32 {
    (ratio / threshold).floor() as u32
}

fn classify(prev: &VisibilityRecord, cur: &VisibilityRecord, threshold: f32) -> Option<VisibilityChange> {
    match (prev.is_intersecting, cur.is_intersecting) {
        (false, true) => Some(VisibilityChange::Enter),
        (true, false) => Some(VisibilityChange::Exit),
        (true, true) => {
            let moved = bucket(prev.intersection_ratio, threshold) != bucket(cur.intersection_ratio, threshold);
            // Full visibility is its own step even when 1.0 is not a multiple
            let full = (prev.intersection_ratio >= 1.0) != (cur.intersection_ratio >= 1.0);
            (moved || full).then_some(VisibilityChange::Ratio)
        }
        (false, false) => None,
    }
}
