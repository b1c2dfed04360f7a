//! Domain Layer - Feed identities, payloads and subscription bookkeeping.
//!
//! Pure in-memory types with no I/O. Everything here is usable without a
//! runtime.

/// Feed types, instrument keys and the feed strategy table.
pub mod feed;

/// Technical indicator math.
pub mod indicators;

/// Feed-specific snapshot payloads.
pub mod snapshot;

/// Connection registry and reverse subscription index.
pub mod subscription;
