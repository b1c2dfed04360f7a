//! Fetch Backoff Policy
//!
//! Exponential backoff with jitter for failed upstream fetches. Delays start
//! at `base * multiplier`, grow by `multiplier` per consecutive failure, and
//! cap at `base * max_factor`. There is no attempt limit: a poller with
//! subscribers keeps trying.

use std::time::Duration;

use rand::Rng;

/// Configuration for fetch backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Growth per consecutive failure (e.g., 2.0 doubles the delay).
    pub multiplier: f64,
    /// Cap as a multiple of the poll interval.
    pub max_factor: u32,
    /// Jitter as a fraction (e.g., 0.1 = ±10% randomization).
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            multiplier: 2.0,
            max_factor: 8,
            jitter_factor: 0.1,
        }
    }
}

/// Backoff state for one poller.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use market_feed_hub::application::services::poller::backoff::{BackoffConfig, BackoffPolicy};
///
/// let config = BackoffConfig { jitter_factor: 0.0, ..BackoffConfig::default() };
/// let mut policy = BackoffPolicy::new(Duration::from_secs(30), config);
///
/// assert_eq!(policy.next_delay(), Duration::from_secs(60));
/// assert_eq!(policy.next_delay(), Duration::from_secs(120));
///
/// // Successful fetch
/// assert_eq!(policy.reset(), Duration::from_secs(30));
/// ```
#[derive(Debug)]
pub struct BackoffPolicy {
    config: BackoffConfig,
    base: Duration,
    current_delay: Duration,
    failures: u32,
}

impl BackoffPolicy {
    /// Create a policy around the poll interval `base`.
    #[must_use]
    pub const fn new(base: Duration, config: BackoffConfig) -> Self {
        Self {
            config,
            base,
            current_delay: base,
            failures: 0,
        }
    }

    /// Record a failure and get the delay before the next attempt.
    #[must_use]
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);

        #[allow(clippy::cast_precision_loss)]
        let scaled = (self.current_delay.as_millis() as f64 * self.config.multiplier).round();
        let next_millis = if scaled.is_finite() && scaled > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                scaled as u128
            }
        } else {
            0
        };
        let capped = next_millis.min(self.max_delay().as_millis());
        self.current_delay = Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX));

        self.apply_jitter(self.current_delay)
    }

    /// Record a success; returns the poll interval.
    pub const fn reset(&mut self) -> Duration {
        self.current_delay = self.base;
        self.failures = 0;
        self.base
    }

    /// Consecutive failures since the last success.
    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.failures
    }

    /// Un-jittered delay currently in effect.
    #[must_use]
    pub const fn current_delay(&self) -> Duration {
        self.current_delay
    }

    /// Largest delay the policy will produce before jitter.
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        self.base.saturating_mul(self.config.max_factor.max(1))
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted_u64 = adjusted_millis as u64;
        Duration::from_millis(adjusted_u64)
    }
}
