//! Upstream Market Data Adapters
//!
//! HTTP implementations of [`SnapshotFetcher`]: CoinGecko for prices and
//! indicator input series, NewsAPI for headlines. [`UpstreamFetcher`]
//! dispatches on the feed type of the requested key.

mod coingecko;
mod newsapi;

use std::str::FromStr;

use async_trait::async_trait;
use rust_decimal::Decimal;

pub use coingecko::CoinGeckoClient;
pub use newsapi::{NEWS_KEYWORDS, NewsApiClient};

use crate::application::ports::{FetchError, SnapshotFetcher};
use crate::domain::feed::{FeedKey, FeedType};
use crate::domain::snapshot::Snapshot;
use crate::infrastructure::config::UpstreamSettings;

/// Snapshot fetcher backed by the public HTTP APIs.
#[derive(Debug)]
pub struct UpstreamFetcher {
    coingecko: CoinGeckoClient,
    news: NewsApiClient,
}

impl UpstreamFetcher {
    /// Build both clients from settings.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Network`] if an HTTP client cannot be built.
    pub fn new(settings: &UpstreamSettings) -> Result<Self, FetchError> {
        let http = build_http_client(settings)?;
        Ok(Self {
            coingecko: CoinGeckoClient::new(
                http.clone(),
                settings.coingecko_base_url.clone(),
                settings.coingecko_api_key.clone(),
            ),
            news: NewsApiClient::new(
                http,
                settings.news_api_base_url.clone(),
                settings.news_api_key.clone(),
            ),
        })
    }
}

#[async_trait]
impl SnapshotFetcher for UpstreamFetcher {
    async fn fetch(&self, key: &FeedKey) -> Result<Snapshot, FetchError> {
        match key.feed_type {
            FeedType::PriceUpdates => self
                .coingecko
                .fetch_price(&key.instrument)
                .await
                .map(Snapshot::Price),
            FeedType::TechnicalIndicators => self
                .coingecko
                .fetch_indicators(&key.instrument)
                .await
                .map(Snapshot::Indicators),
            FeedType::NewsUpdates => self.news.fetch_latest().await.map(Snapshot::News),
            FeedType::Alerts | FeedType::PortfolioUpdates => {
                Err(FetchError::Unsupported(key.feed_type.to_string()))
            }
        }
    }

    fn reset(&self, key: &FeedKey) {
        if key.feed_type == FeedType::NewsUpdates {
            self.news.reset_cursor();
        }
    }
}

fn build_http_client(settings: &UpstreamSettings) -> Result<reqwest::Client, FetchError> {
    reqwest::Client::builder()
        .timeout(settings.timeout)
        .user_agent(concat!("market-feed-hub/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| FetchError::Network(e.to_string()))
}

/// Classify a transport error.
fn transport_error(e: &reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else if e.is_decode() {
        FetchError::Parse(e.to_string())
    } else {
        FetchError::Network(e.to_string())
    }
}

/// Turn a non-success response into [`FetchError::Api`].
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, FetchError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(FetchError::Api {
        status: status.as_u16(),
        message: body,
    })
}

/// Exact decimal from a JSON number.
fn decimal_from_number(n: &serde_json::Number) -> Option<Decimal> {
    if let Some(i) = n.as_i64() {
        return Some(Decimal::from(i));
    }
    if let Some(u) = n.as_u64() {
        return Some(Decimal::from(u));
    }
    let text = n.to_string();
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}
