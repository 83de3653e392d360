//! Exponential backoff for event delivery.

use std::time::Duration;

use crate::config::DeliveryConfig;

/// Doubling delay with a ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
}

impl Backoff {
    /// Start at `initial`, never exceed `max`.
    #[must_use]
    pub const fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Backoff configured for delivery.
    #[must_use]
    pub const fn from_config(config: &DeliveryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_initial_ms),
            Duration::from_millis(config.backoff_max_ms),
        )
    }

    /// Delay after the `failures`-th consecutive failure (1-based).
    #[must_use]
    pub fn delay(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1_u32 << shift)
            .map_or(self.max, |d| d.min(self.max))
    }
}
