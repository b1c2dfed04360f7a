//! Snapshot Payloads
//!
//! Feed-specific payloads carried from a fetch to every subscriber. The
//! registry and router never look inside a [`Snapshot`]; only the transport
//! and the indicator math do.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::feed::FeedKey;

// =============================================================================
// Price
// =============================================================================

/// Spot price with 24h statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    /// Spot price in USD.
    pub price: Decimal,
    /// Price change over 24 hours, in percent.
    pub price_change_24h: Decimal,
    /// Traded volume over 24 hours, in USD.
    pub volume_24h: Decimal,
    /// Market capitalization in USD.
    pub market_cap: Decimal,
}

// =============================================================================
// Indicators
// =============================================================================

/// Latest MACD(12, 26, 9) values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacdValue {
    /// MACD line.
    pub macd: Decimal,
    /// Signal line.
    pub signal: Decimal,
    /// MACD minus signal.
    pub histogram: Decimal,
}

/// Overall direction derived from the individual indicator signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    /// Majority of signals say buy.
    Bullish,
    /// Majority of signals say sell.
    Bearish,
    /// No signals, or no majority.
    Neutral,
}

/// Direction of a single recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Buy.
    Buy,
    /// Sell.
    Sell,
}

/// Confidence attached to a single recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// Weak signal (moving-average cross).
    Low,
    /// Oscillator or MACD signal.
    Medium,
}

/// One indicator's recommendation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    /// Buy or sell.
    #[serde(rename = "type")]
    pub action: Action,
    /// Human-readable reason.
    pub reason: String,
    /// Confidence.
    pub strength: Confidence,
}

/// Aggregated trading signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalSummary {
    /// Majority direction.
    pub sentiment: Sentiment,
    /// Share of signals agreeing with the majority, 0..=100, two places.
    pub strength: Decimal,
    /// Individual recommendations in evaluation order.
    pub recommendations: Vec<Recommendation>,
}

/// Indicator values and the derived signal for one instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    /// Latest close used for the calculation.
    pub last_price: Decimal,
    /// RSI(14), if enough history.
    pub rsi: Option<Decimal>,
    /// MACD(12, 26, 9), if enough history.
    pub macd: Option<MacdValue>,
    /// 20-period simple moving average.
    pub sma_20: Option<Decimal>,
    /// 50-period simple moving average.
    pub sma_50: Option<Decimal>,
    /// Derived signal.
    pub signal: SignalSummary,
}

// =============================================================================
// News
// =============================================================================

/// One news article.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsArticle {
    /// Headline.
    pub title: String,
    /// Summary, truncated.
    pub description: String,
    /// Link to the article.
    pub url: String,
    /// Publisher name.
    pub source: String,
    /// Optional image link.
    pub image_url: Option<String>,
    /// Publication time.
    pub published_at: DateTime<Utc>,
}

/// Articles published since the previous fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsBatch {
    /// Articles, newest first.
    pub articles: Vec<NewsArticle>,
}

// =============================================================================
// Snapshot
// =============================================================================

/// Feed-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Snapshot {
    /// Price feed payload.
    Price(PriceSnapshot),
    /// Indicator feed payload.
    Indicators(IndicatorSnapshot),
    /// News feed payload.
    News(NewsBatch),
    /// Alert payload injected by an alert evaluator.
    Alert(serde_json::Value),
    /// Portfolio payload injected by a collaborator.
    Portfolio(serde_json::Value),
}

impl Snapshot {
    /// Whether delivering this snapshot would carry nothing new.
    ///
    /// Only news batches can be empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::News(batch) if batch.articles.is_empty())
    }
}

/// A snapshot addressed to one feed key, as queued to a connection.
#[derive(Debug, Clone)]
pub struct FeedUpdate {
    /// Stream the update belongs to.
    pub key: FeedKey,
    /// Shared payload; one allocation per publish regardless of fan-out.
    pub snapshot: Arc<Snapshot>,
    /// Time the snapshot was produced.
    pub timestamp: DateTime<Utc>,
}

impl FeedUpdate {
    /// Create an update stamped with the current time.
    #[must_use]
    pub fn now(key: FeedKey, snapshot: Arc<Snapshot>) -> Self {
        Self {
            key,
            snapshot,
            timestamp: Utc::now(),
        }
    }
}
