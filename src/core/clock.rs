//! Clocks and the delayed-task queue.
//!
//! Every wait in the engine (preload pacing, readiness polling, retry backoff,
//! health checks) is a task token parked in [`Timers`] until its due time.
//! The feed drains due tasks in `tick()`, so a test can swap in a
//! [`ManualClock`] and step virtual time instead of sleeping.
//!
//! # Usage
//! ```ignore
//! let id = timers.schedule(clock.now(), Duration::from_millis(150), Task::Pump);
//! // later, from the host's frame/timer callback:
//! while let Some(task) = timers.pop_due(clock.now()) {
//!     run(task);
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::trace;

use crate::entities::Clock;

/// Wall clock backed by `Instant`.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Virtual clock, advanced explicitly. Millisecond resolution.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self { now_ms: AtomicU64::new(0) }
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms.fetch_add(by.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn set(&self, at: Duration) {
        self.now_ms.store(at.as_millis() as u64, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.now_ms.load(Ordering::Relaxed))
    }
}

/// Handle returned by [`Timers::schedule`], used to cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// Due-time ordered task queue.
///
/// Tasks due at the same instant fire in scheduling order.
#[derive(Debug)]
pub struct Timers<T> {
    queue: BTreeMap<(Duration, u64), T>,
    /// id -> due time, for O(log n) cancel
    index: HashMap<u64, Duration>,
    next_id: u64,
}

impl<T> Default for Timers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Timers<T> {
    pub fn new() -> Self {
        Self {
            queue: BTreeMap::new(),
            index: HashMap::new(),
            next_id: 0,
        }
    }

    /// Park `task` until `now + delay`.
    pub fn schedule(&mut self, now: Duration, delay: Duration, task: T) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        let due = now + delay;
        self.queue.insert((due, id), task);
        self.index.insert(id, due);
        trace!("Timers: scheduled #{} due at {}ms", id, due.as_millis());
        TimerId(id)
    }

    /// Drop a pending task. Returns false if it already fired or was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        let Some(due) = self.index.remove(&id.0) else {
            return false;
        };
        self.queue.remove(&(due, id.0)).is_some()
    }

    /// Pop the earliest task whose due time is <= `now`.
    pub fn pop_due(&mut self, now: Duration) -> Option<T> {
        let (&(due, id), _) = self.queue.first_key_value()?;
        if due > now {
            return None;
        }
        self.index.remove(&id);
        self.queue.remove(&(due, id))
    }

    /// Due time of the next pending task.
    pub fn next_due(&self) -> Option<Duration> {
        self.queue.keys().next().map(|&(due, _)| due)
    }

    pub fn is_pending(&self, id: TimerId) -> bool {
        self.index.contains_key(&id.0)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.index.clear();
    }
}
