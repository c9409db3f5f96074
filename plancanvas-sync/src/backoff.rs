//! Reconnect delays: `base * 2^attempt`, capped at `max`, plus uniform jitter.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: Duration) -> Self {
        Self {
            base,
            max,
            jitter,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, advancing the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }

    /// Delay for the current attempt without jitter.
    pub fn ceiling(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(31));
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Back to the first attempt after a successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
