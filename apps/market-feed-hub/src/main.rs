//! Market Feed Hub Binary
//!
//! Starts the WebSocket hub, its upstream pollers, and the health server.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-feed-hub
//! ```
//!
//! # Environment Variables
//!
//! All optional:
//! - `FEED_HUB_WS_PORT`: WebSocket port (default: 8000)
//! - `FEED_HUB_HEALTH_PORT`: Health check HTTP port (default: 8082)
//! - `FEED_HUB_PRICE_POLL_SECS` / `FEED_HUB_INDICATORS_POLL_SECS` /
//!   `FEED_HUB_NEWS_POLL_SECS`: Poll intervals (default: 30 / 120 / 300)
//! - `FEED_HUB_OUTBOUND_CAPACITY`: Per-connection queue size (default: 64)
//! - `FEED_HUB_BACKOFF_MULTIPLIER`, `FEED_HUB_BACKOFF_MAX_FACTOR`,
//!   `FEED_HUB_BACKOFF_JITTER`: Fetch failure backoff (default: 2.0, 8, 0.1)
//! - `COINGECKO_BASE_URL`, `COINGECKO_API_KEY`: Price source
//! - `NEWS_API_BASE_URL`, `NEWS_API_KEY`: News source (news is disabled without a key)
//! - `FEED_HUB_UPSTREAM_TIMEOUT_SECS`: Upstream request timeout (default: 10)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `OTEL_SERVICE_NAME`: Service name (default: market-feed-hub)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use market_feed_hub::infrastructure::telemetry;
use market_feed_hub::{
    HealthServer, HealthServerState, HubConfig, SubscriptionHub, TelemetryEventSink,
    UpstreamFetcher, WsServer, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Market Feed Hub");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = HubConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let fetcher = Arc::new(UpstreamFetcher::new(&config.upstream)?);
    let hub = SubscriptionHub::start(config.hub, fetcher, Arc::new(TelemetryEventSink));

    // Initialize health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&hub),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );

    let ws_server = WsServer::new(
        config.server.ws_port,
        Arc::clone(&hub),
        shutdown_token.clone(),
    );

    // Spawn health server
    let health_task = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    // Spawn WebSocket server
    let ws_task = tokio::spawn(async move {
        if let Err(e) = ws_server.run().await {
            tracing::error!(error = %e, "WebSocket server error");
        }
    });

    tracing::info!("Feed hub ready");

    await_shutdown(shutdown_token).await;

    hub.shutdown();

    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        let _ = tokio::join!(health_task, ws_task);
    })
    .await;
    if drained.is_err() {
        tracing::warn!("Servers did not stop within the shutdown timeout");
    }

    tracing::info!("Feed hub stopped");
    Ok(())
}

/// Log the parsed configuration.
fn log_config(config: &HubConfig) {
    tracing::info!(
        ws_port = config.server.ws_port,
        health_port = config.server.health_port,
        price_poll_secs = config.hub.intervals.price.as_secs(),
        indicators_poll_secs = config.hub.intervals.indicators.as_secs(),
        news_poll_secs = config.hub.intervals.news.as_secs(),
        outbound_capacity = config.hub.outbound_capacity,
        "Configuration loaded"
    );
    tracing::debug!(
        coingecko = %config.upstream.coingecko_base_url,
        newsapi = %config.upstream.news_api_base_url,
        news_enabled = config.upstream.news_api_key.is_some(),
        "Upstream endpoints"
    );
    if config.upstream.news_api_key.is_none() {
        tracing::warn!("NEWS_API_KEY not set; news_updates subscribers will receive nothing");
    }
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
