//! Error / retry controller.
//!
//! Two independent ladders, both plain state machines carrying an attempt
//! counter (no recursion):
//!
//! - **Play start**: `play()` rejected or readiness wait timed out.
//!   Initial autoplay: 5 attempts, 200ms doubling (capped 1600ms).
//!   Resume: 3 attempts, 0 / 500 / 1000ms.
//!   Exhaustion -> click-to-play affordance.
//! - **Load**: media error seen by the periodic health check.
//!   5 retries at 1s, 2s, 4s, 8s, 16s. The error after the 5th retry is
//!   terminal (permanent failure placeholder).

use std::time::Duration;

use log::debug;

use crate::config::FeedSettings;
use crate::core::posts::PostTable;
use crate::entities::{MediaErrorKind, PostId};

/// Delay curve between retries. `delay(n)` is the wait before retry `n` (1-based).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// initial, initial*2, initial*4, ... capped at `max`
    Exponential { initial: Duration, max: Duration },
    /// step, step*2, step*3, ...
    Linear { step: Duration },
}

impl Backoff {
    pub fn delay(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        match *self {
            Backoff::Exponential { initial, max } => {
                let factor = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
                initial.saturating_mul(factor).min(max)
            }
            Backoff::Linear { step } => step.saturating_mul(retry),
        }
    }
}

/// Outcome of recording a failure on a ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after this delay
    Retry(Duration),
    /// No attempts left
    Exhausted,
}

/// Bounded retry state: `(retries used, max retries, backoff)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryLadder {
    retries: u32,
    max_retries: u32,
    backoff: Backoff,
}

impl RetryLadder {
    pub fn new(max_retries: u32, backoff: Backoff) -> Self {
        Self { retries: 0, max_retries, backoff }
    }

    /// Ladder allowing `attempts` tries in total (first one immediate).
    pub fn with_attempts(attempts: u32, backoff: Backoff) -> Self {
        Self::new(attempts.saturating_sub(1), backoff)
    }

    pub fn record_failure(&mut self) -> RetryDecision {
        if self.retries >= self.max_retries {
            return RetryDecision::Exhausted;
        }
        self.retries += 1;
        RetryDecision::Retry(self.backoff.delay(self.retries))
    }

    /// Retries already scheduled.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Attempts made so far, counting the initial one.
    pub fn attempts(&self) -> u32 {
        self.retries + 1
    }

    pub fn is_exhausted(&self) -> bool {
        self.retries >= self.max_retries
    }

    pub fn reset(&mut self) {
        self.retries = 0;
    }
}

/// Which play ladder a start attempt uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayPath {
    /// First autoplay of a freshly loaded post
    Initial,
    /// Resuming a post that played before
    Resume,
}

/// Bounded wait for a handle to become playable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadinessWait {
    deadline: Duration,
}

/// Result of one readiness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Ready,
    Pending,
    TimedOut,
}

impl ReadinessWait {
    pub fn start(now: Duration, timeout: Duration) -> Self {
        Self { deadline: now + timeout }
    }

    pub fn check(&self, now: Duration, ready: bool) -> WaitStatus {
        if ready {
            WaitStatus::Ready
        } else if now >= self.deadline {
            WaitStatus::TimedOut
        } else {
            WaitStatus::Pending
        }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }
}

/// Verdict for a detected load error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadVerdict {
    RetryAfter(Duration),
    PermanentFailure,
}

/// Ladder factory and health-check scanner, configured from settings.
#[derive(Debug, Clone)]
pub struct RetryController {
    initial_attempts: u32,
    initial_backoff: Backoff,
    resume_attempts: u32,
    resume_backoff: Backoff,
    load_retries: u32,
    load_backoff: Backoff,
    readiness_timeout: Duration,
    readiness_poll: Duration,
    health_interval: Duration,
}

impl RetryController {
    pub fn from_settings(s: &FeedSettings) -> Self {
        Self {
            initial_attempts: s.play_max_attempts,
            initial_backoff: Backoff::Exponential {
                initial: Duration::from_millis(s.play_retry_initial_ms),
                max: Duration::from_millis(s.play_retry_max_ms),
            },
            resume_attempts: s.resume_max_attempts,
            resume_backoff: Backoff::Linear {
                step: Duration::from_millis(s.resume_retry_step_ms),
            },
            load_retries: s.load_max_retries,
            load_backoff: Backoff::Exponential {
                initial: Duration::from_millis(s.load_retry_initial_ms),
                max: Duration::from_millis(s.load_retry_max_ms),
            },
            readiness_timeout: Duration::from_millis(s.readiness_timeout_ms),
            readiness_poll: Duration::from_millis(s.readiness_poll_ms),
            health_interval: Duration::from_millis(s.health_check_interval_ms),
        }
    }

    pub fn play_ladder(&self, path: PlayPath) -> RetryLadder {
        match path {
            PlayPath::Initial => RetryLadder::with_attempts(self.initial_attempts, self.initial_backoff),
            PlayPath::Resume => RetryLadder::with_attempts(self.resume_attempts, self.resume_backoff),
        }
    }

    pub fn load_ladder(&self) -> RetryLadder {
        RetryLadder::new(self.load_retries, self.load_backoff)
    }

    pub fn readiness_wait(&self, now: Duration) -> ReadinessWait {
        ReadinessWait::start(now, self.readiness_timeout)
    }

    pub fn readiness_poll(&self) -> Duration {
        self.readiness_poll
    }

    pub fn health_interval(&self) -> Duration {
        self.health_interval
    }

    /// Advance a post's load ladder after an error.
    pub fn on_load_error(&self, ladder: &mut RetryLadder, post_id: &PostId) -> LoadVerdict {
        match ladder.record_failure() {
            RetryDecision::Retry(delay) => {
                debug!(
                    "RetryController: {} load retry {}/{} in {}ms",
                    post_id,
                    ladder.retries(),
                    self.load_retries,
                    delay.as_millis()
                );
                LoadVerdict::RetryAfter(delay)
            }
            RetryDecision::Exhausted => LoadVerdict::PermanentFailure,
        }
    }

    /// Posts whose live handle currently reports a media error.
    ///
    /// `skip` excludes posts whose errors are observed elsewhere (in-flight
    /// preloads are checked by their own poll).
    pub fn scan_errors(&self, posts: &PostTable, skip: impl Fn(&PostId) -> bool) -> Vec<(PostId, MediaErrorKind)> {
        posts
            .iter()
            .filter(|post| !skip(&post.id))
            .filter_map(|post| {
                let kind = post.player.as_ref()?.error()?;
                Some((post.id.clone(), kind))
            })
            .collect()
    }
}
