//! Bounded retry with exponential backoff and jitter
//!
//! Shared by publish attempts and analytics report emission.

use std::time::Duration;

use rand::Rng;

use crate::config::DispatchConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first
    pub ceiling: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            ceiling: config.retry_ceiling,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
        }
    }

    /// Whether another attempt may follow the given 1-based attempt
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.ceiling
    }

    /// Delay to wait after the given 1-based failed attempt
    ///
    /// `base * 2^(attempt - 1)`, capped at `max_delay`. With jitter enabled
    /// the result is drawn uniformly from the upper half of that value.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let capped = 2u32
            .checked_pow(exponent)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay));

        if !self.jitter || capped.is_zero() {
            return capped;
        }

        let half = capped / 2;
        let spread = (capped - half).as_millis() as u64;
        half + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }
}
