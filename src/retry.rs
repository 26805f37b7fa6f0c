use rand::Rng;
use std::time::Duration;

use crate::config;

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_base: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_base: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl From<&config::RetryConfig> for RetryConfig {
    fn from(cfg: &config::RetryConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(cfg.initial_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            backoff_base: cfg.backoff_base,
            jitter_factor: cfg.jitter_factor,
        }
    }
}

/// Retry policy for failed token refreshes
#[derive(Debug, Clone)]
pub enum RetryPolicy {
    /// Exponential backoff with configuration
    ExponentialBackoff(RetryConfig),
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::ExponentialBackoff(RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), jittered and capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Self::ExponentialBackoff(cfg) => {
                let exp = cfg.backoff_base.max(1.0).powi(attempt.min(32) as i32);
                let base_ms = cfg.initial_delay.as_millis() as f64 * exp;
                let jitter = if cfg.jitter_factor > 0.0 {
                    rand::thread_rng().gen_range(1.0 - cfg.jitter_factor..=1.0 + cfg.jitter_factor)
                } else {
                    1.0
                };
                let delay = Duration::from_millis((base_ms * jitter) as u64);
                std::cmp::min(delay, cfg.max_delay)
            }
        }
    }
}
