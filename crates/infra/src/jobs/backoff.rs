//! Retry backoff policy.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff with additive jitter.
///
/// `delay(n) = min(base * 2^(n-1), max) + jitter`, where jitter is a random
/// amount in `[0, jitter * delay]`. The jittered value is clamped to `max`
/// again, so no delay ever exceeds the ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt.
    pub base: Duration,
    /// Ceiling for any delay.
    pub max: Duration,
    /// Jitter factor (0.0-1.0) added on top of the exponential delay.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            ..Default::default()
        }
    }

    /// Policy that retries immediately (tests, manual drains).
    pub fn immediate() -> Self {
        Self {
            base: Duration::ZERO,
            max: Duration::ZERO,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Un-jittered delay for a given attempt number (1-indexed).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        2_u32
            .checked_pow(attempt - 1)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Jittered delay drawn from the supplied RNG.
    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.base_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if delay.is_zero() || jitter == 0.0 {
            return delay;
        }

        let jitter_ms = (delay.as_millis() as f64 * jitter) as u64;
        if jitter_ms == 0 {
            return delay;
        }

        let extra = Duration::from_millis(rng.random_range(0..=jitter_ms));
        (delay + extra).min(self.max)
    }

    /// Jittered delay using the thread-local RNG.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, &mut rand::rng())
    }
}
