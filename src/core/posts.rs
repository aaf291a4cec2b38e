//! Post records and the id-keyed table that owns them.
//!
//! The table is the single owner of post lifetime. Scheduler, tracker and
//! queue only hold `PostId`s and look them up here; a missing id means the
//! post was destroyed and the caller silently does nothing.
//!
//! `IndexMap` keeps registration order, which is the feed order: a failed
//! post keeps its index, and ties in the scheduler fall back to it.

use indexmap::IndexMap;

use crate::core::player::PlayerHandle;
use crate::core::retry::{ReadinessWait, RetryLadder};
use crate::entities::{MediaSource, PlaybackState, PostId, ViewRef};

/// One feed entry.
#[derive(Debug)]
pub struct Post {
    pub id: PostId,
    pub view: ViewRef,
    pub source: Option<MediaSource>,
    /// None until the first preload starts; None again after permanent failure
    pub player: Option<PlayerHandle>,
    pub state: PlaybackState,
    /// Feed generation this post was registered under
    pub generation: u64,
    pub(crate) load_retry: RetryLadder,
    pub(crate) play_retry: Option<RetryLadder>,
    pub(crate) readiness: Option<ReadinessWait>,
    /// Played at least once (selects the resume ladder)
    pub(crate) has_played: bool,
}

impl Post {
    pub fn new(id: PostId, view: ViewRef, source: Option<MediaSource>, generation: u64, load_retry: RetryLadder) -> Self {
        Self {
            id,
            view,
            source,
            player: None,
            state: PlaybackState::Idle,
            generation,
            load_retry,
            play_retry: None,
            readiness: None,
            has_played: false,
        }
    }

    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    pub fn is_failed(&self) -> bool {
        self.state == PlaybackState::Failed
    }

    /// Player exists and holds (or is fetching) buffers.
    pub fn has_live_player(&self) -> bool {
        self.player.as_ref().is_some_and(|p| p.is_live())
    }

    /// Loaded and not unloaded: eligible for a video unload.
    pub fn is_loaded(&self) -> bool {
        self.player.as_ref().is_some_and(|p| p.is_loaded() && !p.is_unloaded())
    }

    pub fn muted(&self) -> bool {
        self.player.as_ref().map(|p| p.muted()).unwrap_or(true)
    }

    pub fn load_retries(&self) -> u32 {
        self.load_retry.retries()
    }
}

/// Registration-ordered post table.
#[derive(Debug, Default)]
pub struct PostTable {
    posts: IndexMap<PostId, Post>,
}

impl PostTable {
    pub fn new() -> Self {
        Self { posts: IndexMap::new() }
    }

    /// Insert a post. Returns false (and leaves the table alone) if the id exists.
    pub fn insert(&mut self, post: Post) -> bool {
        if self.posts.contains_key(&post.id) {
            return false;
        }
        self.posts.insert(post.id.clone(), post);
        true
    }

    /// Remove a post, keeping the order of the rest.
    pub fn remove(&mut self, id: &PostId) -> Option<Post> {
        self.posts.shift_remove(id)
    }

    pub fn get(&self, id: &PostId) -> Option<&Post> {
        self.posts.get(id)
    }

    pub fn get_mut(&mut self, id: &PostId) -> Option<&mut Post> {
        self.posts.get_mut(id)
    }

    pub fn contains(&self, id: &PostId) -> bool {
        self.posts.contains_key(id)
    }

    /// Feed position of a post.
    pub fn index_of(&self, id: &PostId) -> Option<usize> {
        self.posts.get_index_of(id)
    }

    pub fn state(&self, id: &PostId) -> Option<PlaybackState> {
        self.posts.get(id).map(|p| p.state)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Post> {
        self.posts.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Post> {
        self.posts.values_mut()
    }

    pub fn ids(&self) -> Vec<PostId> {
        self.posts.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }

    /// Remove every post, handing them back for teardown.
    pub fn drain(&mut self) -> Vec<Post> {
        self.posts.drain(..).map(|(_, post)| post).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::retry::Backoff;
    use std::time::Duration;

    fn post(id: &str, n: u64) -> Post {
        let ladder = RetryLadder::new(5, Backoff::Linear { step: Duration::from_secs(1) });
        Post::new(PostId::new(id), ViewRef(n), Some(MediaSource::new(format!("{id}.mp4"))), 0, ladder)
    }

    #[test]
    fn test_insert_rejects_duplicates() {
        let mut table = PostTable::new();
        assert!(table.insert(post("a", 0)));
        assert!(!table.insert(post("a", 1)));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&PostId::new("a")).map(|p| p.view), Some(ViewRef(0)));
    }

    #[test]
    fn test_remove_keeps_order() {
        let mut table = PostTable::new();
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            table.insert(post(id, i as u64));
        }
        table.remove(&PostId::new("b"));
        assert_eq!(table.index_of(&PostId::new("c")), Some(1));
        assert!(table.get(&PostId::new("b")).is_none());
    }

    #[test]
    fn test_fresh_post_flags() {
        let p = post("a", 0);
        assert_eq!(p.state, PlaybackState::Idle);
        assert!(p.has_source());
        assert!(!p.is_loaded());
        assert!(!p.has_live_player());
        assert!(p.muted());
    }
}
