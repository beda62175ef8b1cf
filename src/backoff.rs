//! Exponential backoff policy shared by the feed connection and metadata lookups.

use rand::Rng;
use std::time::Duration;

/// Parameters of an exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub base: Duration,
    /// Growth factor applied to the previous delay.
    pub multiplier: f64,
    /// Upper bound on any delay, jitter included.
    pub max: Duration,
    /// Extra random fraction (0.0..=1.0) added on top of each delay.
    pub jitter: f64,
}

impl RetryPolicy {
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            multiplier: 2.0,
            max,
            jitter: 0.0,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    /// Delay to wait after a failure, given the delay used after the previous one.
    ///
    /// The result is never shorter than `previous` and never longer than `max`.
    pub fn next_delay(&self, previous: Option<Duration>) -> Duration {
        let raw = match previous {
            None => self.base,
            Some(prev) => prev.mul_f64(self.multiplier).max(prev),
        };
        let jittered = if self.jitter > 0.0 {
            let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
            raw + raw.mul_f64(extra)
        } else {
            raw
        };
        jittered.min(self.max)
    }
}

/// Stateful backoff for a retry loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            current: None,
        }
    }

    /// Advance and return the next delay.
    pub fn next_delay(&mut self) -> Duration {
        let next = self.policy.next_delay(self.current);
        self.current = Some(next);
        next
    }

    /// Forget previous failures.
    pub fn reset(&mut self) {
        self.current = None;
    }

    pub fn current(&self) -> Option<Duration> {
        self.current
    }
}
