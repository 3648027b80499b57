//! Retry policy and backoff calculation.
//!
//! The portable half of the retry machinery: how many attempts, how long to
//! wait between them. The async executor that sleeps, honors cancellation
//! and classifies errors lives in the `distill` crate and is shared by the
//! fetcher and the map/reduce stages.
//!
//! Delay before retry `n` (1-based):
//!
//! ```text
//! min(cap, base × 2^(n-1)) × (1 + (2r - 1) × jitter)     r ∈ [0, 1)
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;
pub const DEFAULT_BASE_DELAY_MS: u64 = 800;
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_JITTER: f64 = 0.2;

/// Bounded exponential backoff with jitter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total tries, the first one included. At least 1.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Symmetric jitter range, 0.0–1.0.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries once and never waits.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter: 0.0,
        }
    }

    /// Whether another attempt is allowed after `attempt` (1-based) failed.
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }

    /// Delay before retry `retry` (1-based) without jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(31);
        let ms = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Delay before retry `retry` (1-based). `random` is a sample from
    /// `[0, 1)`; the result deviates from [`base_delay`](Self::base_delay)
    /// by at most `±jitter`.
    pub fn delay(&self, retry: u32, random: f64) -> Duration {
        let base = self.base_delay(retry).as_millis() as f64;
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = 1.0 + (random.clamp(0.0, 1.0) * 2.0 - 1.0) * jitter;
        Duration::from_millis((base * factor).round().max(0.0) as u64)
    }

    /// Sum of the un-jittered delays a caller waits through when every one
    /// of `max_attempts` attempts fails.
    pub fn total_base_delay(&self) -> Duration {
        (1..self.max_attempts.max(1)).map(|n| self.base_delay(n)).sum()
    }
}
