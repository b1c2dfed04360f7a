//! WebSocket Wire Messages
//!
//! JSON frames exchanged with browser clients. Every frame is an object with
//! a `type` tag.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::feed::FeedType;
use crate::domain::snapshot::{
    FeedUpdate, IndicatorSnapshot, NewsArticle, PriceSnapshot, Snapshot,
};

/// Frame sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Subscribe to a feed, optionally for a list of coins.
    Subscribe {
        /// Feed type name, e.g. `price_updates`.
        subscription_type: String,
        /// Coin ids for instrument-scoped feeds.
        #[serde(default)]
        coins: Vec<String>,
    },
    /// Unsubscribe from some or all coins of a feed.
    Unsubscribe {
        /// Feed type name.
        subscription_type: String,
        /// Coins to drop; absent or empty drops the whole feed.
        #[serde(default)]
        coins: Option<Vec<String>>,
    },
    /// Keepalive.
    Ping,
    /// Latest known prices.
    GetCurrentPrices {
        /// Coin ids.
        #[serde(default)]
        coins: Vec<String>,
    },
}

/// Frame sent to a client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage<'a> {
    /// First frame after the upgrade.
    ConnectionEstablished {
        /// Id from the request path.
        client_id: String,
        /// Hub connection id.
        connection_id: String,
        /// Feed types a client may subscribe to.
        available_subscriptions: Vec<FeedType>,
        /// Server time.
        timestamp: DateTime<Utc>,
    },
    /// Reply to `subscribe`.
    SubscriptionConfirmed {
        /// Feed subscribed to.
        subscription_type: FeedType,
        /// Coins now watched on that feed; absent for global feeds.
        #[serde(skip_serializing_if = "Option::is_none")]
        watched_coins: Option<Vec<String>>,
        /// Server time.
        timestamp: DateTime<Utc>,
    },
    /// Reply to `unsubscribe`.
    UnsubscriptionConfirmed {
        /// Feed unsubscribed from.
        subscription_type: FeedType,
        /// Coins dropped.
        removed: Vec<String>,
        /// Server time.
        timestamp: DateTime<Utc>,
    },
    /// Reply to `ping`.
    Pong {
        /// Server time.
        timestamp: DateTime<Utc>,
    },
    /// Reply to `get_current_prices`.
    CurrentPrices {
        /// Coin to latest price; coins without a poller are omitted.
        data: BTreeMap<String, PriceSnapshot>,
        /// Server time.
        timestamp: DateTime<Utc>,
    },
    /// Price feed update.
    PriceUpdate {
        /// Coin id.
        coin: &'a str,
        /// Latest price.
        data: &'a PriceSnapshot,
        /// Fetch time.
        timestamp: DateTime<Utc>,
    },
    /// Indicator feed update.
    TechnicalIndicatorsUpdate {
        /// Coin id.
        coin: &'a str,
        /// Latest indicators.
        indicators: &'a IndicatorSnapshot,
        /// Fetch time.
        timestamp: DateTime<Utc>,
    },
    /// New headlines.
    NewsUpdate {
        /// Articles not sent before.
        new_articles: &'a [NewsArticle],
        /// Article count.
        count: usize,
        /// Fetch time.
        timestamp: DateTime<Utc>,
    },
    /// User alert.
    Alert {
        /// Alert payload.
        data: &'a serde_json::Value,
        /// Injection time.
        timestamp: DateTime<Utc>,
    },
    /// User portfolio change.
    PortfolioUpdate {
        /// Portfolio payload.
        data: &'a serde_json::Value,
        /// Injection time.
        timestamp: DateTime<Utc>,
    },
    /// Request rejected.
    Error {
        /// Reason.
        message: String,
        /// Server time.
        timestamp: DateTime<Utc>,
    },
}

impl<'a> ServerMessage<'a> {
    /// Frame for a delivered feed update.
    #[must_use]
    pub fn from_update(update: &'a FeedUpdate) -> Self {
        let timestamp = update.timestamp;
        let coin = update.key.instrument.as_str();
        match update.snapshot.as_ref() {
            Snapshot::Price(data) => Self::PriceUpdate {
                coin,
                data,
                timestamp,
            },
            Snapshot::Indicators(indicators) => Self::TechnicalIndicatorsUpdate {
                coin,
                indicators,
                timestamp,
            },
            Snapshot::News(batch) => Self::NewsUpdate {
                new_articles: &batch.articles,
                count: batch.articles.len(),
                timestamp,
            },
            Snapshot::Alert(data) => Self::Alert { data, timestamp },
            Snapshot::Portfolio(data) => Self::PortfolioUpdate { data, timestamp },
        }
    }

    /// Rejection frame.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Serialize to a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if a payload fails to serialize.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
