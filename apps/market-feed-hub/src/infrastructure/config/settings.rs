//! Hub Configuration Settings
//!
//! Configuration types for the feed hub, loaded from environment variables.

use std::time::Duration;

use crate::application::services::hub::{HubSettings, PollIntervals};
use crate::application::services::poller::backoff::BackoffConfig;

/// Default CoinGecko REST base.
pub const DEFAULT_COINGECKO_BASE_URL: &str = "https://api.coingecko.com/api/v3";

/// Default NewsAPI REST base.
pub const DEFAULT_NEWS_API_BASE_URL: &str = "https://newsapi.org/v2";

/// Upstream API key. Redacted in debug output.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    /// Wrap a key.
    #[must_use]
    pub const fn new(key: String) -> Self {
        Self(key)
    }

    /// Get the key.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey([REDACTED])")
    }
}

/// Server port settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// WebSocket client port.
    pub ws_port: u16,
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            ws_port: 8000,
            health_port: 8082,
        }
    }
}

/// Upstream HTTP API settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamSettings {
    /// CoinGecko REST base URL.
    pub coingecko_base_url: String,
    /// CoinGecko key, sent as `x-cg-demo-api-key` when set.
    pub coingecko_api_key: Option<ApiKey>,
    /// NewsAPI REST base URL.
    pub news_api_base_url: String,
    /// NewsAPI key. Without it the news feed reports `NotConfigured`.
    pub news_api_key: Option<ApiKey>,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            coingecko_base_url: DEFAULT_COINGECKO_BASE_URL.to_string(),
            coingecko_api_key: None,
            news_api_base_url: DEFAULT_NEWS_API_BASE_URL.to_string(),
            news_api_key: None,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Complete hub configuration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HubConfig {
    /// Server port settings.
    pub server: ServerSettings,
    /// Upstream API settings.
    pub upstream: UpstreamSettings,
    /// Poll intervals, backoff and queue sizing.
    pub hub: HubSettings,
}

impl HubConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a value parses but is out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// Unparseable numbers fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a value parses but is out of range.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let defaults = Self::default();

        let server = ServerSettings {
            ws_port: env.parse("FEED_HUB_WS_PORT", defaults.server.ws_port),
            health_port: env.parse("FEED_HUB_HEALTH_PORT", defaults.server.health_port),
        };

        let upstream = UpstreamSettings {
            coingecko_base_url: env
                .string("COINGECKO_BASE_URL")
                .unwrap_or(defaults.upstream.coingecko_base_url),
            coingecko_api_key: env.string("COINGECKO_API_KEY").map(ApiKey::new),
            news_api_base_url: env
                .string("NEWS_API_BASE_URL")
                .unwrap_or(defaults.upstream.news_api_base_url),
            news_api_key: env.string("NEWS_API_KEY").map(ApiKey::new),
            timeout: env.secs("FEED_HUB_UPSTREAM_TIMEOUT_SECS", defaults.upstream.timeout),
        };

        let intervals = PollIntervals {
            price: env.secs("FEED_HUB_PRICE_POLL_SECS", defaults.hub.intervals.price),
            indicators: env.secs(
                "FEED_HUB_INDICATORS_POLL_SECS",
                defaults.hub.intervals.indicators,
            ),
            news: env.secs("FEED_HUB_NEWS_POLL_SECS", defaults.hub.intervals.news),
        };
        let backoff = BackoffConfig {
            multiplier: env.parse("FEED_HUB_BACKOFF_MULTIPLIER", defaults.hub.backoff.multiplier),
            max_factor: env.parse("FEED_HUB_BACKOFF_MAX_FACTOR", defaults.hub.backoff.max_factor),
            jitter_factor: env.parse("FEED_HUB_BACKOFF_JITTER", defaults.hub.backoff.jitter_factor),
        };
        let hub = HubSettings {
            intervals,
            backoff,
            outbound_capacity: env.parse(
                "FEED_HUB_OUTBOUND_CAPACITY",
                defaults.hub.outbound_capacity,
            ),
        };

        let config = Self {
            server,
            upstream,
            hub,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns the first offending variable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = &self.hub.intervals;
        for (key, value) in [
            ("FEED_HUB_PRICE_POLL_SECS", intervals.price),
            ("FEED_HUB_INDICATORS_POLL_SECS", intervals.indicators),
            ("FEED_HUB_NEWS_POLL_SECS", intervals.news),
            ("FEED_HUB_UPSTREAM_TIMEOUT_SECS", self.upstream.timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Zero(key.to_string()));
            }
        }
        if self.hub.outbound_capacity == 0 {
            return Err(ConfigError::Zero("FEED_HUB_OUTBOUND_CAPACITY".to_string()));
        }
        if self.hub.backoff.max_factor == 0 {
            return Err(ConfigError::Zero("FEED_HUB_BACKOFF_MAX_FACTOR".to_string()));
        }
        if !(self.hub.backoff.multiplier >= 1.0) {
            return Err(ConfigError::OutOfRange {
                key: "FEED_HUB_BACKOFF_MULTIPLIER".to_string(),
                expected: "at least 1.0",
            });
        }
        if !(0.0..1.0).contains(&self.hub.backoff.jitter_factor) {
            return Err(ConfigError::OutOfRange {
                key: "FEED_HUB_BACKOFF_JITTER".to_string(),
                expected: "in [0.0, 1.0)",
            });
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Value must be positive.
    #[error("environment variable {0} must be greater than zero")]
    Zero(String),
    /// Value outside its accepted range.
    #[error("environment variable {key} must be {expected}")]
    OutOfRange {
        /// Variable name.
        key: String,
        /// Accepted range.
        expected: &'static str,
    },
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.string(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        self.string(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }
}
