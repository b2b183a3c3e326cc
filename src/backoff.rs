//! Retry backoff
//!
//! Delay schedules shared by the batch dispatcher (between job attempts)
//! and the orchestrator (bounded wait before falling off a rate-limited
//! primary tier). Fixed or exponential growth with an upper cap, plus
//! optional jitter so synchronized workers spread out.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// Delay schedule for retries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    pub kind: BackoffKind,
    pub initial_ms: u64,
    pub multiplier: f32,
    pub max_ms: u64,
    pub jitter: bool,
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            initial_ms: delay.as_millis() as u64,
            multiplier: 1.0,
            max_ms: delay.as_millis() as u64,
            jitter: false,
        }
    }

    pub fn exponential(initial: Duration, multiplier: f32, max: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            initial_ms: initial.as_millis() as u64,
            multiplier,
            max_ms: max.as_millis() as u64,
            jitter: true,
        }
    }

    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Base delay before retrying after `attempt` failures (0-based), before
    /// jitter.
    fn base_delay_ms(&self, attempt: u32) -> u64 {
        match self.kind {
            BackoffKind::Fixed => self.initial_ms,
            BackoffKind::Exponential => {
                let mult = self.multiplier.powi(attempt as i32);
                let ms = (self.initial_ms as f64 * mult as f64) as u64;
                ms.min(self.max_ms)
            }
        }
    }

    /// Delay before retrying after `attempt` failures, with up to 30%
    /// additive jitter when enabled.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let mut ms = self.base_delay_ms(attempt);
        if self.jitter {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            let jitter = rng.gen_range(0.0..0.3);
            ms += (ms as f64 * jitter) as u64;
        }
        Duration::from_millis(ms)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(
            Duration::from_millis(2_000),
            2.0,
            Duration::from_secs(60),
        )
    }
}
