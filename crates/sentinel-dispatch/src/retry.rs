//! Backoff policy for redelivered jobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff with jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Base delay for the first retry.
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,
    /// Cap applied after exponentiation.
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
    /// Jitter factor in `[0.0, 1.0]`; the delay is scaled by a random value
    /// in `[1 - jitter, 1 + jitter]`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_base_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_jitter() -> f64 {
    0.3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

/// Delay before retry number `attempt` (1-based: the delay after the first
/// failure is `delay_for_attempt(cfg, 1)`).
pub fn delay_for_attempt(config: &RetryConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let raw = config
        .base_delay
        .saturating_mul(2u32.saturating_pow(exp))
        .min(config.max_delay);
    let jitter = config.jitter.clamp(0.0, 1.0);
    let factor = 1.0 - jitter + rand::random::<f64>() * 2.0 * jitter;
    raw.mul_f64(factor).min(config.max_delay)
}
