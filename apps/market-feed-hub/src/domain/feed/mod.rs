//! Feed Types and Keys
//!
//! Domain types identifying a data stream: the closed set of feed types,
//! instrument keys, and the `(feed type, instrument)` pair used as the unit
//! of subscription and of upstream polling.
//!
//! # Strategy Table
//!
//! Each feed type maps to a [`FeedStrategy`] describing whether it is
//! instrument-scoped, whether it has an upstream poller, and whether a newer
//! undelivered update may supersede an older one in a client queue.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Maximum accepted length of an instrument key.
const MAX_INSTRUMENT_LEN: usize = 64;

// =============================================================================
// Validation Errors
// =============================================================================

/// Client-visible validation failure, raised before any state is touched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Feed type name is not one of the known feeds.
    #[error("unknown feed type: {0}")]
    UnknownFeedType(String),
    /// Instrument key is empty, too long, or contains invalid characters.
    #[error("malformed instrument key: {0:?}")]
    MalformedInstrument(String),
    /// Instrument-scoped feed subscribed without any instruments.
    #[error("feed {0} requires at least one instrument")]
    MissingInstruments(FeedType),
}

// =============================================================================
// Feed Type
// =============================================================================

/// Data feed a client can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedType {
    /// Spot price, 24h change, volume and market cap per instrument.
    PriceUpdates,
    /// Indicator values and derived signal per instrument.
    TechnicalIndicators,
    /// Global news batches.
    NewsUpdates,
    /// Per-user alerts injected by an alert evaluator.
    Alerts,
    /// Per-user portfolio updates injected by a collaborator.
    PortfolioUpdates,
}

impl FeedType {
    /// Get all feed types.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::PriceUpdates,
            Self::TechnicalIndicators,
            Self::NewsUpdates,
            Self::Alerts,
            Self::PortfolioUpdates,
        ]
    }

    /// Wire name of the feed type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PriceUpdates => "price_updates",
            Self::TechnicalIndicators => "technical_indicators",
            Self::NewsUpdates => "news_updates",
            Self::Alerts => "alerts",
            Self::PortfolioUpdates => "portfolio_updates",
        }
    }

    /// Strategy entry for this feed type.
    #[must_use]
    pub const fn strategy(self) -> FeedStrategy {
        match self {
            Self::PriceUpdates => FeedStrategy {
                scope: FeedScope::PerInstrument,
                polling: Polling::Upstream(Cadence::Price),
                conflate: true,
            },
            Self::TechnicalIndicators => FeedStrategy {
                scope: FeedScope::PerInstrument,
                polling: Polling::Upstream(Cadence::Indicators),
                conflate: true,
            },
            Self::NewsUpdates => FeedStrategy {
                scope: FeedScope::Global,
                polling: Polling::Upstream(Cadence::News),
                conflate: false,
            },
            Self::Alerts | Self::PortfolioUpdates => FeedStrategy {
                scope: FeedScope::Global,
                polling: Polling::PushOnly,
                conflate: false,
            },
        }
    }

    /// Whether subscriptions to this feed name individual instruments.
    #[must_use]
    pub const fn is_instrument_scoped(self) -> bool {
        matches!(self.strategy().scope, FeedScope::PerInstrument)
    }

    /// Whether keys of this feed are served by an upstream poller.
    #[must_use]
    pub const fn is_polled(self) -> bool {
        matches!(self.strategy().polling, Polling::Upstream(_))
    }
}

impl fmt::Display for FeedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|feed| feed.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownFeedType(s.to_string()))
    }
}

// =============================================================================
// Strategy Table
// =============================================================================

/// Whether a feed is keyed per instrument or served under the wildcard key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedScope {
    /// One key per instrument.
    PerInstrument,
    /// Single wildcard key for all subscribers.
    Global,
}

/// How updates for a feed are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polling {
    /// A poller fetches from upstream on the interval configured for the
    /// cadence.
    Upstream(Cadence),
    /// Updates are injected directly; no poller exists.
    PushOnly,
}

/// Which configured poll interval a polled feed runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Spot prices.
    Price,
    /// Indicator recomputation.
    Indicators,
    /// Headline search.
    News,
}

/// Per-feed behavior switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedStrategy {
    /// Instrument scoping.
    pub scope: FeedScope,
    /// Update source.
    pub polling: Polling,
    /// Newer undelivered update replaces an older one for the same key.
    pub conflate: bool,
}

// =============================================================================
// Instrument Key
// =============================================================================

/// Opaque instrument identifier (e.g. a CoinGecko coin id).
///
/// The empty key is the wildcard used by feeds that are not
/// instrument-scoped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstrumentKey(String);

impl InstrumentKey {
    /// The wildcard key.
    #[must_use]
    pub const fn wildcard() -> Self {
        Self(String::new())
    }

    /// Parse and normalize a client-supplied instrument key.
    ///
    /// Keys are trimmed and lowercased; they must be 1..=64 characters of
    /// ASCII alphanumerics, `-`, `_` or `.`.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::MalformedInstrument`] for anything else.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let key = raw.trim().to_ascii_lowercase();
        let valid = !key.is_empty()
            && key.len() <= MAX_INSTRUMENT_LEN
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

        if valid {
            Ok(Self(key))
        } else {
            Err(ValidationError::MalformedInstrument(raw.to_string()))
        }
    }

    /// Whether this is the wildcard key.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_wildcard() {
            f.write_str("*")
        } else {
            f.write_str(&self.0)
        }
    }
}

// =============================================================================
// Feed Key
// =============================================================================

/// `(feed type, instrument)` pair identifying one stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeedKey {
    /// Feed type.
    pub feed_type: FeedType,
    /// Instrument, or the wildcard for global feeds.
    pub instrument: InstrumentKey,
}

impl FeedKey {
    /// Build a key, forcing the wildcard for feeds that are not
    /// instrument-scoped.
    #[must_use]
    pub fn new(feed_type: FeedType, instrument: InstrumentKey) -> Self {
        let instrument = if feed_type.is_instrument_scoped() {
            instrument
        } else {
            InstrumentKey::wildcard()
        };
        Self {
            feed_type,
            instrument,
        }
    }

    /// Wildcard key for a global feed.
    #[must_use]
    pub const fn global(feed_type: FeedType) -> Self {
        Self {
            feed_type,
            instrument: InstrumentKey::wildcard(),
        }
    }

    /// Build the set of keys for a subscription request.
    ///
    /// Instrument-scoped feeds need at least one instrument; other feeds
    /// ignore the instruments and yield the single wildcard key.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] for malformed instruments or a missing
    /// instrument list.
    pub fn expand<S: AsRef<str>>(
        feed_type: FeedType,
        instruments: &[S],
    ) -> Result<Vec<Self>, ValidationError> {
        if !feed_type.is_instrument_scoped() {
            return Ok(vec![Self::global(feed_type)]);
        }

        if instruments.is_empty() {
            return Err(ValidationError::MissingInstruments(feed_type));
        }

        let mut keys: Vec<Self> = instruments
            .iter()
            .map(|raw| InstrumentKey::parse(raw.as_ref()).map(|i| Self::new(feed_type, i)))
            .collect::<Result<_, _>>()?;
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// Strategy entry of the key's feed type.
    #[must_use]
    pub const fn strategy(&self) -> FeedStrategy {
        self.feed_type.strategy()
    }
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.feed_type, self.instrument)
    }
}

// =============================================================================
// Tests
// =============================================================================
