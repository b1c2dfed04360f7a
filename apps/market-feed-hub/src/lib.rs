#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Market Feed Hub - Real-time Market Data Distribution
//!
//! Accepts many WebSocket clients, tracks which feeds each one wants, and
//! keeps exactly one upstream poller per (feed type, instrument) pair while
//! anyone is interested. Every poll result is fanned out to the subscribed
//! clients through bounded per-connection queues.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core types with no I/O
//!   - `feed`: Feed types, strategy table, instrument and feed keys
//!   - `snapshot`: Price, indicator, news and injected payloads
//!   - `indicators`: RSI, MACD, SMA and the signal rules
//!   - `subscription`: Connection registry and outbound queues
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Snapshot fetcher and hub event sink
//!   - `services`: Subscription hub, pollers, fan-out router
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `upstream`: CoinGecko and NewsAPI fetchers
//!   - `ws`: WebSocket client server
//!   - `config`: Environment configuration
//!   - `health`: Health check and metrics endpoint
//!
//! # Data Flow
//!
//! ```text
//! CoinGecko ──┐     ┌──────────┐     ┌──────────┐     ┌───────────┐
//!             ├────►│ Pollers  │────►│  Fan-out │────►│ Outbound  │──► Client 1
//! NewsAPI ────┘     │ (1/key)  │     │  Router  │     │  Queues   │──► Client N
//!                   └──────────┘     └──────────┘     └───────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core hub types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::feed::{
    Cadence, FeedKey, FeedScope, FeedStrategy, FeedType, InstrumentKey, Polling, ValidationError,
};
pub use domain::snapshot::{FeedUpdate, PriceSnapshot, Snapshot};
pub use domain::subscription::{ConnectionId, ConnectionRegistry, OutboundReceiver};

// Ports
pub use application::ports::{
    FetchError, HubEventSink, NoopEventSink, SnapshotFetcher, StopReason,
};

// Hub
pub use application::services::hub::{
    ClientConnection, HubError, HubSettings, HubStats, PollIntervals, SharedSubscriptionHub,
    SubscriptionHub,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, HubConfig, ServerSettings, UpstreamSettings};

// Servers
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};
pub use infrastructure::ws::{WsServer, WsServerError};

// Upstream
pub use infrastructure::upstream::UpstreamFetcher;

// Metrics
pub use infrastructure::metrics::{TelemetryEventSink, init_metrics};

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
