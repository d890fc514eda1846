//! Bounded, fixed-interval polling.
//!
//! Every wait in the workflow (readiness, volume binding, tunnel startup) is
//! a wait with a fixed sleep and an iteration cap, not exponential backoff.
//! The outer CI job timeout is the only other bound.

use std::future::Future;
use std::time::Duration;

use tracing::trace;

/// What a single poll attempt observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Ready,
    Pending,
}

/// How a poll loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResult {
    Ready { attempts: u32 },
    Exhausted { attempts: u32 },
}

impl PollResult {
    pub fn is_ready(&self) -> bool {
        matches!(self, PollResult::Ready { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            PollResult::Ready { attempts } | PollResult::Exhausted { attempts } => *attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poller {
    retries: u32,
    interval: Duration,
}

impl Poller {
    /// `retries == 0` still makes one attempt.
    pub fn new(retries: u32, interval: Duration) -> Self {
        Self {
            retries: retries.max(1),
            interval,
        }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Worst-case time spent sleeping.
    pub fn budget(&self) -> Duration {
        self.interval * self.retries.saturating_sub(1)
    }

    /// Call `attempt` (1-based) until it reports ready or retries run out,
    /// sleeping `interval` between attempts.
    pub async fn poll<F, Fut>(&self, mut attempt: F) -> PollResult
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = PollOutcome>,
    {
        for n in 1..=self.retries {
            if attempt(n).await == PollOutcome::Ready {
                return PollResult::Ready { attempts: n };
            }
            trace!(attempt = n, retries = self.retries, "not ready yet");
            if n < self.retries {
                tokio::time::sleep(self.interval).await;
            }
        }
        PollResult::Exhausted {
            attempts: self.retries,
        }
    }
}
