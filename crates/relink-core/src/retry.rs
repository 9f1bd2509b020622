use std::time::Duration;

use rand::Rng;

const MAX_EXPONENT: u32 = 64;

/// Exponential reconnect backoff with a cap and additive uniform jitter.
///
/// The policy never tracks attempts itself; callers pass the 0-based
/// attempt they are scheduling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
    factor: f64,
    jitter_max_ms: u64,
}

impl BackoffPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64, factor: f64, jitter_max_ms: u64) -> Self {
        let factor = if factor.is_finite() && factor >= 1.0 {
            factor
        } else {
            1.0
        };
        Self {
            base_delay_ms,
            max_delay_ms,
            factor,
            jitter_max_ms,
        }
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    pub fn jitter_max_ms(&self) -> u64 {
        self.jitter_max_ms
    }

    /// `min(max_delay, base_delay * factor^attempt)` in milliseconds, before jitter.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> u64 {
        let exponent = attempt.min(MAX_EXPONENT) as i32;
        let scaled = self.base_delay_ms as f64 * self.factor.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay_ms as f64 {
            return self.max_delay_ms;
        }
        (scaled as u64).min(self.max_delay_ms)
    }

    /// Delay for `attempt` with an explicit jitter amount (clamped to the policy maximum).
    pub fn delay_with_jitter(
        &self,
        attempt: u32,
        retry_after_hint_ms: Option<u64>,
        jitter_ms: u64,
    ) -> Duration {
        let calculated = self.base_delay_for_attempt(attempt);
        let hinted = retry_after_hint_ms.unwrap_or(0);
        let bounded = calculated.max(hinted).min(self.max_delay_ms);
        Duration::from_millis(bounded.saturating_add(jitter_ms.min(self.jitter_max_ms)))
    }

    /// Delay for `attempt` with jitter drawn uniformly from `0..=jitter_max`.
    pub fn delay_for_attempt<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        retry_after_hint_ms: Option<u64>,
        rng: &mut R,
    ) -> Duration {
        let jitter = if self.jitter_max_ms == 0 {
            0
        } else {
            rng.gen_range(0..=self.jitter_max_ms)
        };
        self.delay_with_jitter(attempt, retry_after_hint_ms, jitter)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(2_000, 60_000, 2.0, 1_000)
    }
}
