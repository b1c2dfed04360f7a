//! OpenTelemetry Tracing Integration
//!
//! Structured logging for the hub, with optional OTLP span export.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Full filter override; when set, the defaults and the
//!   verbosity switches below are ignored
//! - `FEED_HUB_VERBOSE_POLLERS`: Per-tick poller and subscription logs at debug
//! - `FEED_HUB_VERBOSE_WS`: Per-connection WebSocket logs at debug
//! - `OTEL_ENABLED`: Set to "false" to disable span export (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: http://localhost:4318)
//! - `OTEL_SERVICE_NAME`: Service name for traces (default: market-feed-hub)
//! - `DEPLOYMENT_ENVIRONMENT`: Resource attribute (default: development)
//!
//! # Usage
//!
//! ```ignore
//! use market_feed_hub::infrastructure::telemetry;
//!
//! // Initialize at startup (returns guard that must be kept alive)
//! let _guard = telemetry::init();
//!
//! // Spans from the hub and servers now reach the exporter
//! tracing::info!(port = 8000, "WebSocket server listening");
//! ```

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_SERVICE_NAME: &str = "market-feed-hub";
const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4318";
const DEFAULT_ENVIRONMENT: &str = "development";

/// Levels used when `RUST_LOG` is unset. Transport crates stay quiet.
const BASE_DIRECTIVES: [&str; 5] = [
    "market_feed_hub=info",
    "reqwest=warn",
    "hyper=warn",
    "h2=warn",
    "tungstenite=warn",
];

/// Poller lifecycle, fetch outcomes and subscribe/unsubscribe traffic.
const POLLER_DIRECTIVES: [&str; 3] = [
    "market_feed_hub::application::services::poller=debug",
    "market_feed_hub::application::services::hub=debug",
    "market_feed_hub::infrastructure::metrics=debug",
];

const WS_DIRECTIVES: [&str; 1] = ["market_feed_hub::infrastructure::ws=debug"];

/// Guard that shuts down OpenTelemetry when dropped.
pub struct TelemetryGuard {
    tracer_provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("Failed to shutdown OpenTelemetry tracer provider: {e}");
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Whether spans are exported over OTLP.
    pub enabled: bool,
    /// OTLP exporter endpoint.
    pub otlp_endpoint: String,
    /// Service name for traces.
    pub service_name: String,
    /// `deployment.environment.name` resource attribute.
    pub environment: String,
    /// Raw `RUST_LOG`, overriding every default directive.
    pub log_filter: Option<String>,
    /// Debug logs for pollers and subscription changes.
    pub verbose_pollers: bool,
    /// Debug logs for WebSocket sessions.
    pub verbose_ws: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            otlp_endpoint: DEFAULT_OTLP_ENDPOINT.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            environment: DEFAULT_ENVIRONMENT.to_string(),
            log_filter: None,
            verbose_pollers: false,
            verbose_ws: false,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let flag = |key: &str| {
            get(key).is_some_and(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        };
        let defaults = Self::default();

        Self {
            enabled: get("OTEL_ENABLED").is_none_or(|v| v.to_lowercase() != "false"),
            otlp_endpoint: get("OTEL_EXPORTER_OTLP_ENDPOINT").unwrap_or(defaults.otlp_endpoint),
            service_name: get("OTEL_SERVICE_NAME").unwrap_or(defaults.service_name),
            environment: get("DEPLOYMENT_ENVIRONMENT").unwrap_or(defaults.environment),
            log_filter: get("RUST_LOG"),
            verbose_pollers: flag("FEED_HUB_VERBOSE_POLLERS"),
            verbose_ws: flag("FEED_HUB_VERBOSE_WS"),
        }
    }

    /// Filter string handed to [`EnvFilter`].
    #[must_use]
    pub fn filter_spec(&self) -> String {
        if let Some(spec) = &self.log_filter {
            return spec.clone();
        }

        let mut directives: Vec<&str> = BASE_DIRECTIVES.to_vec();
        if self.verbose_pollers {
            directives.extend(POLLER_DIRECTIVES);
        }
        if self.verbose_ws {
            directives.extend(WS_DIRECTIVES);
        }
        directives.join(",")
    }

    /// Resource attributes attached to every exported span, besides the
    /// service name.
    #[must_use]
    pub fn resource_attributes(&self) -> Vec<KeyValue> {
        vec![
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            KeyValue::new("deployment.environment.name", self.environment.clone()),
            KeyValue::new("hub.feeds", feed_names()),
        ]
    }
}

fn feed_names() -> String {
    crate::domain::feed::FeedType::all()
        .iter()
        .map(|feed| feed.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/// Initialize telemetry with default configuration from environment.
///
/// Returns a guard that must be kept alive for the duration of the program.
/// When the guard is dropped, OpenTelemetry will be properly shut down.
#[must_use]
pub fn init() -> TelemetryGuard {
    init_with_config(TelemetryConfig::from_env())
}

/// Initialize telemetry with custom configuration.
///
/// Returns a guard that must be kept alive for the duration of the program.
#[must_use]
#[allow(clippy::expect_used)]
pub fn init_with_config(config: TelemetryConfig) -> TelemetryGuard {
    // Invalid directives in a user RUST_LOG are skipped, not fatal.
    let env_filter = EnvFilter::new(config.filter_spec());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if !config.enabled {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();

        return TelemetryGuard {
            tracer_provider: None,
        };
    }

    let otlp_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.otlp_endpoint)
        .build()
        .expect("Failed to create OTLP exporter");

    let resource = Resource::builder()
        .with_service_name(config.service_name.clone())
        .with_attributes(config.resource_attributes())
        .build();

    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(otlp_exporter)
        .with_resource(resource)
        .build();

    let tracer = tracer_provider.tracer(config.service_name);
    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .init();

    TelemetryGuard {
        tracer_provider: Some(tracer_provider),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tracing_subscriber::filter::Directive;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> TelemetryConfig {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        TelemetryConfig::from_lookup(|key| map.get(key).cloned())
    }

    fn attribute(config: &TelemetryConfig, key: &str) -> Option<String> {
        config
            .resource_attributes()
            .into_iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| kv.value.as_str().into_owned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(config_from(&[]), TelemetryConfig::default());
    }

    #[test]
    fn otel_disabled_only_by_false() {
        assert!(!config_from(&[("OTEL_ENABLED", "FALSE")]).enabled);
        assert!(config_from(&[("OTEL_ENABLED", "0")]).enabled);
    }

    #[test]
    fn every_default_directive_parses() {
        for raw in BASE_DIRECTIVES
            .iter()
            .chain(&POLLER_DIRECTIVES)
            .chain(&WS_DIRECTIVES)
        {
            assert!(raw.parse::<Directive>().is_ok(), "{raw}");
        }
    }

    #[test]
    fn default_filter_keeps_pollers_at_info() {
        let spec = TelemetryConfig::default().filter_spec();
        assert!(spec.starts_with("market_feed_hub=info"));
        assert!(!spec.contains("poller=debug"));
        assert!(!spec.contains("ws=debug"));
    }

    #[test]
    fn verbosity_switches_add_module_directives() {
        let config = config_from(&[
            ("FEED_HUB_VERBOSE_POLLERS", "true"),
            ("FEED_HUB_VERBOSE_WS", "1"),
        ]);
        let spec = config.filter_spec();

        assert!(spec.contains("market_feed_hub::application::services::poller=debug"));
        assert!(spec.contains("market_feed_hub::infrastructure::ws=debug"));
    }

    #[test]
    fn rust_log_overrides_everything() {
        let config = config_from(&[
            ("RUST_LOG", "market_feed_hub=trace"),
            ("FEED_HUB_VERBOSE_POLLERS", "true"),
        ]);
        assert_eq!(config.filter_spec(), "market_feed_hub=trace");
    }

    #[test]
    fn resource_carries_version_environment_and_feeds() {
        let config = config_from(&[("DEPLOYMENT_ENVIRONMENT", "staging")]);

        assert_eq!(
            attribute(&config, "service.version").as_deref(),
            Some(env!("CARGO_PKG_VERSION"))
        );
        assert_eq!(
            attribute(&config, "deployment.environment.name").as_deref(),
            Some("staging")
        );
        assert_eq!(
            attribute(&config, "hub.feeds").as_deref(),
            Some("price_updates,technical_indicators,news_updates,alerts,portfolio_updates")
        );
    }

    #[test]
    fn disabled_guard_drops_cleanly() {
        let guard = TelemetryGuard {
            tracer_provider: None,
        };
        drop(guard);
    }
}
