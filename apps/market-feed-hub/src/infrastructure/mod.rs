//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus the servers that expose the hub.

/// Environment-driven configuration.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation and the telemetry event sink.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;

/// CoinGecko and NewsAPI snapshot fetchers.
pub mod upstream;

/// WebSocket server for browser clients.
pub mod ws;
