//! Serializable retry policy settings.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lowest accepted `max_attempts`.
pub const MIN_ATTEMPTS: u32 = 1;
/// Highest accepted `max_attempts`.
pub const MAX_ATTEMPTS: u32 = 16;

/// Jitter strategy to prevent thundering herd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    #[default]
    None,
    /// Random from 0 to delay
    Full,
    /// Half fixed, half random
    Equal,
}

impl JitterStrategy {
    /// Applies jitter to a delay.
    #[must_use]
    pub fn apply(self, delay: Duration) -> Duration {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        match self {
            Self::None => delay,
            Self::Full => {
                if millis == 0 {
                    delay
                } else {
                    Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
                }
            }
            Self::Equal => {
                let half = millis / 2;
                if half == 0 {
                    delay
                } else {
                    Duration::from_millis(half + rand::thread_rng().gen_range(0..=half))
                }
            }
        }
    }
}

/// Data part of a retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first; clamped to `[1, 16]`.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Optional cap on the computed delay.
    pub max_delay_ms: Option<u64>,
    /// delay = base * 2^attempt when set.
    pub use_exponential_backoff: bool,
    /// Jitter applied after backoff.
    pub jitter: JitterStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: None,
            use_exponential_backoff: false,
            jitter: JitterStrategy::None,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = Some(delay);
        self
    }

    /// Enables or disables exponential backoff.
    #[must_use]
    pub fn with_exponential_backoff(mut self, enabled: bool) -> Self {
        self.use_exponential_backoff = enabled;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// `max_attempts` clamped to `[MIN_ATTEMPTS, MAX_ATTEMPTS]`.
    #[must_use]
    pub fn effective_max_attempts(&self) -> u32 {
        self.max_attempts.clamp(MIN_ATTEMPTS, MAX_ATTEMPTS)
    }

    /// Delay after the failed attempt `attempt_index`, without jitter.
    #[must_use]
    pub fn backoff_delay(&self, attempt_index: u32) -> Duration {
        let base = self.base_delay_ms;
        let delay = if self.use_exponential_backoff {
            base.saturating_mul(2u64.saturating_pow(attempt_index))
        } else {
            base
        };
        let delay = self.max_delay_ms.map_or(delay, |max| delay.min(max));
        Duration::from_millis(delay)
    }

    /// Delay after the failed attempt `attempt_index`, with jitter.
    #[must_use]
    pub fn calculate_delay(&self, attempt_index: u32) -> Duration {
        self.jitter.apply(self.backoff_delay(attempt_index))
    }
}
