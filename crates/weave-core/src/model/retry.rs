use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How often a failed task is re-attempted. A task runs at most `limit + 1` times.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,
}

impl RetryPolicy {
    pub fn limit(limit: u32) -> Self {
        Self {
            limit,
            backoff: None,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.limit.saturating_add(1)
    }

    /// Delay before retry number `retry` (0 for the first retry). Zero without backoff.
    pub fn delay_before(&self, retry: u32) -> Duration {
        match &self.backoff {
            Some(backoff) => backoff.delay(retry, &mut rand::thread_rng()),
            None => Duration::ZERO,
        }
    }
}

/// Exponential backoff with a cap and symmetric jitter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    pub initial_interval_ms: u64,
    pub multiplier: f64,
    pub max_interval_ms: u64,
    pub jitter_percent: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_interval_ms: 1_000,
            multiplier: 2.0,
            max_interval_ms: 60_000,
            jitter_percent: 0.25,
        }
    }
}

impl Backoff {
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exp = self.multiplier.powi(retry.min(i32::MAX as u32) as i32);
        let raw = self.initial_interval_ms as f64 * exp;
        let bounded = raw.min(self.max_interval_ms as f64).max(0.0);
        Duration::from_millis(bounded.round() as u64)
    }

    pub fn delay<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let base_ms = self.base_delay(retry).as_millis() as f64;
        let spread = self.jitter_percent.max(0.0);
        let scalar = if spread > 0.0 {
            rng.gen_range(-spread..=spread)
        } else {
            0.0
        };
        Duration::from_millis((base_ms * (1.0 + scalar)).max(0.0).round() as u64)
    }
}
