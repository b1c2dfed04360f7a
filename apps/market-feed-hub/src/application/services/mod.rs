//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `hub`: the public subscription facade and poller lifecycle
//! - `poller`: one upstream polling task per active feed key
//! - `fanout`: non-blocking delivery to subscriber queues

/// Fan-out of published snapshots to subscriber queues.
pub mod fanout;

/// Subscription hub facade.
pub mod hub;

/// Upstream polling tasks and the poller table.
pub mod poller;
