//! Configuration Module
//!
//! Environment-driven configuration for the hub and its servers.

mod settings;

pub use settings::{
    ApiKey, ConfigError, DEFAULT_COINGECKO_BASE_URL, DEFAULT_NEWS_API_BASE_URL, HubConfig,
    ServerSettings, UpstreamSettings,
};
