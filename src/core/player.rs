//! Player handle: thin state wrapper around one host media element.
//!
//! **Why**: the host element knows nothing about feed policy. The handle keeps
//! the flags the scheduler reasons about (loaded / playing / unloaded / muted),
//! remembers the resume position across pause and unload, and makes every
//! teardown call idempotent.
//!
//! **Used by**: Scheduler (play/pause/mute), Preload pipeline (create/reload),
//! Eviction manager (unload/destroy), Retry controller (error probe).
//!
//! # Lifecycle
//!
//! `preload()` -> loading -> ready (`mark_loaded`) -> playing | paused
//! `unload()` releases buffers, keeps the source; `reload()` starts over.
//! `destroy()` is terminal; every later call is a no-op.

use log::{debug, trace};

use crate::entities::{MediaElement, MediaErrorKind, PlaybackError, ReadyState};

pub struct PlayerHandle {
    element: Box<dyn MediaElement>,
    is_loaded: bool,
    is_playing: bool,
    is_unloaded: bool,
    muted: bool,
    destroyed: bool,
    /// Position to restore after unload/reload
    resume_at: f64,
    /// Seek owed to the element once it is ready again
    pending_seek: bool,
}

impl std::fmt::Debug for PlayerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerHandle")
            .field("is_loaded", &self.is_loaded)
            .field("is_playing", &self.is_playing)
            .field("is_unloaded", &self.is_unloaded)
            .field("muted", &self.muted)
            .field("destroyed", &self.destroyed)
            .field("resume_at", &self.resume_at)
            .finish()
    }
}

impl PlayerHandle {
    /// Wrap a freshly created element and start loading it, muted.
    pub fn preload(mut element: Box<dyn MediaElement>) -> Self {
        element.set_muted(true);
        element.load();
        Self {
            element,
            is_loaded: false,
            is_playing: false,
            is_unloaded: false,
            muted: true,
            destroyed: false,
            resume_at: 0.0,
            pending_seek: false,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.is_loaded
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing
    }

    pub fn is_unloaded(&self) -> bool {
        self.is_unloaded
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn muted(&self) -> bool {
        self.muted
    }

    /// Holding (or fetching) buffers: neither unloaded nor destroyed.
    pub fn is_live(&self) -> bool {
        !self.is_unloaded && !self.destroyed
    }

    pub fn ready_state(&self) -> ReadyState {
        if !self.is_live() {
            return ReadyState::HaveNothing;
        }
        self.element.ready_state()
    }

    /// Element can produce frames right now.
    pub fn can_play(&self) -> bool {
        self.ready_state().can_play()
    }

    pub fn error(&self) -> Option<MediaErrorKind> {
        if !self.is_live() {
            return None;
        }
        self.element.error()
    }

    pub fn resume_position(&self) -> f64 {
        self.resume_at
    }

    /// Record that the element reached a playable state; restores the resume
    /// position owed from a previous unload.
    pub fn mark_loaded(&mut self) {
        if !self.is_live() || self.is_loaded {
            return;
        }
        self.is_loaded = true;
        if self.pending_seek {
            self.element.seek(self.resume_at);
            self.pending_seek = false;
        }
    }

    pub fn play(&mut self) -> Result<(), PlaybackError> {
        if !self.can_play() {
            return Err(PlaybackError::NotReady);
        }
        if self.is_playing {
            return Ok(());
        }
        self.element.play()?;
        self.is_playing = true;
        Ok(())
    }

    /// Pause and remember where we were. Never releases resources.
    pub fn pause(&mut self) {
        if !self.is_playing || self.destroyed {
            return;
        }
        self.element.pause();
        self.resume_at = self.element.current_time();
        self.is_playing = false;
    }

    pub fn seek(&mut self, secs: f64) {
        if !self.is_live() {
            return;
        }
        self.element.seek(secs);
        self.resume_at = secs;
    }

    pub fn set_muted(&mut self, muted: bool) {
        if self.muted == muted || self.destroyed {
            return;
        }
        self.element.set_muted(muted);
        self.muted = muted;
    }

    /// Release buffers but keep the source. Returns false when there was
    /// nothing to release (already unloaded or destroyed).
    pub fn unload(&mut self) -> bool {
        if !self.is_live() {
            return false;
        }
        if self.is_playing {
            self.pause();
        }
        self.element.release();
        self.is_loaded = false;
        self.is_unloaded = true;
        self.pending_seek = self.resume_at > 0.0;
        debug!("PlayerHandle: unloaded (resume at {:.2}s)", self.resume_at);
        true
    }

    /// Start loading again after an unload or a load error.
    pub fn reload(&mut self) {
        if self.destroyed {
            return;
        }
        if self.is_loaded && self.resume_at > 0.0 {
            self.pending_seek = true;
        }
        self.element.load();
        self.is_unloaded = false;
        self.is_loaded = false;
        self.is_playing = false;
        trace!("PlayerHandle: reload requested");
    }

    /// Terminal teardown. Idempotent.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        if self.is_playing {
            self.element.pause();
        }
        self.element.destroy();
        self.destroyed = true;
        self.is_playing = false;
        self.is_loaded = false;
        self.is_unloaded = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::MediaError;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Calls {
        loads: u32,
        releases: u32,
        destroys: u32,
        seeks: Vec<f64>,
        muted: Vec<bool>,
    }

    struct StubElement {
        ready: ReadyState,
        time: f64,
        calls: Rc<RefCell<Calls>>,
    }

    impl MediaElement for StubElement {
        fn load(&mut self) {
            self.calls.borrow_mut().loads += 1;
        }
        fn ready_state(&self) -> ReadyState {
            self.ready
        }
        fn play(&mut self) -> Result<(), MediaError> {
            Ok(())
        }
        fn pause(&mut self) {}
        fn set_muted(&mut self, muted: bool) {
            self.calls.borrow_mut().muted.push(muted);
        }
        fn current_time(&self) -> f64 {
            self.time
        }
        fn seek(&mut self, secs: f64) {
            self.calls.borrow_mut().seeks.push(secs);
        }
        fn release(&mut self) {
            self.calls.borrow_mut().releases += 1;
        }
        fn destroy(&mut self) {
            self.calls.borrow_mut().destroys += 1;
        }
        fn error(&self) -> Option<MediaErrorKind> {
            None
        }
    }

    fn handle(ready: ReadyState) -> (PlayerHandle, Rc<RefCell<Calls>>) {
        let calls = Rc::new(RefCell::new(Calls::default()));
        let element = StubElement { ready, time: 3.5, calls: Rc::clone(&calls) };
        (PlayerHandle::preload(Box::new(element)), calls)
    }

    #[test]
    fn test_preload_starts_muted_and_loading() {
        let (h, calls) = handle(ReadyState::HaveMetadata);
        assert!(h.muted());
        assert!(!h.is_loaded());
        assert_eq!(calls.borrow().loads, 1);
        assert_eq!(calls.borrow().muted, vec![true]);
    }

    #[test]
    fn test_play_refused_when_not_ready() {
        let (mut h, _) = handle(ReadyState::HaveCurrentData);
        assert_eq!(h.play(), Err(PlaybackError::NotReady));
        assert!(!h.is_playing());
    }

    #[test]
    fn test_pause_keeps_position() {
        let (mut h, calls) = handle(ReadyState::HaveEnoughData);
        h.mark_loaded();
        h.play().unwrap();
        h.pause();
        assert!(!h.is_playing());
        assert_eq!(h.resume_position(), 3.5);
        assert_eq!(calls.borrow().releases, 0);
    }

    #[test]
    fn test_unload_is_idempotent() {
        let (mut h, calls) = handle(ReadyState::HaveEnoughData);
        h.mark_loaded();
        assert!(h.unload());
        assert!(!h.unload());
        assert!(!h.unload());
        assert_eq!(calls.borrow().releases, 1);
        assert!(h.is_unloaded());
        assert_eq!(h.ready_state(), ReadyState::HaveNothing);
    }

    #[test]
    fn test_reload_restores_position() {
        let (mut h, calls) = handle(ReadyState::HaveEnoughData);
        h.mark_loaded();
        h.play().unwrap();
        assert!(h.unload());
        h.reload();
        assert!(!h.is_unloaded());
        h.mark_loaded();
        assert_eq!(calls.borrow().seeks, vec![3.5]);
        assert_eq!(calls.borrow().loads, 2);
    }

    #[test]
    fn test_destroy_is_terminal() {
        let (mut h, calls) = handle(ReadyState::HaveEnoughData);
        h.destroy();
        h.destroy();
        h.reload();
        assert!(!h.unload());
        assert_eq!(calls.borrow().destroys, 1);
        assert_eq!(calls.borrow().loads, 1);
        assert!(h.is_destroyed());
    }
}
