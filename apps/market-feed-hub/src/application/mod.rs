//! Application Layer - Hub orchestration and port definitions.
//!
//! This layer wires the domain registry to upstream fetchers and downstream
//! transports through the ports defined here.

/// Port interfaces for upstream fetchers and observability.
pub mod ports;

/// Hub, poller and fan-out services.
pub mod services;
