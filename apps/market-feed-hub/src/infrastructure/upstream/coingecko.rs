//! CoinGecko REST client.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::Deserialize;

use super::{check_status, decimal_from_number, transport_error};
use crate::application::ports::FetchError;
use crate::domain::feed::InstrumentKey;
use crate::domain::indicators;
use crate::domain::snapshot::{IndicatorSnapshot, PriceSnapshot};
use crate::infrastructure::config::ApiKey;

/// Days of daily closes fed to the indicator computation.
const HISTORY_DAYS: &str = "30";

const API_KEY_HEADER: &str = "x-cg-demo-api-key";

/// CoinGecko price and history client.
pub struct CoinGeckoClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<ApiKey>,
}

impl std::fmt::Debug for CoinGeckoClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoinGeckoClient")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct SimplePriceEntry {
    usd: Option<serde_json::Number>,
    usd_24h_change: Option<serde_json::Number>,
    usd_24h_vol: Option<serde_json::Number>,
    usd_market_cap: Option<serde_json::Number>,
}

#[derive(Deserialize)]
struct MarketChart {
    #[serde(default)]
    prices: Vec<(serde_json::Number, serde_json::Number)>,
}

impl CoinGeckoClient {
    /// Create a client against `base_url`.
    #[must_use]
    pub fn new(http: reqwest::Client, base_url: String, api_key: Option<ApiKey>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// Current USD price, 24h change, 24h volume and market cap.
    ///
    /// # Errors
    ///
    /// [`FetchError::NotFound`] when the coin id is unknown to CoinGecko.
    pub async fn fetch_price(&self, coin: &InstrumentKey) -> Result<PriceSnapshot, FetchError> {
        let url = format!("{}/simple/price", self.base_url);
        let response = self
            .get(&url)
            .query(&[
                ("ids", coin.as_str()),
                ("vs_currencies", "usd"),
                ("include_24hr_change", "true"),
                ("include_24hr_vol", "true"),
                ("include_market_cap", "true"),
            ])
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        let mut body: HashMap<String, SimplePriceEntry> = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| FetchError::Parse(e.to_string()))?;

        let entry = body
            .remove(coin.as_str())
            .ok_or_else(|| FetchError::NotFound(coin.to_string()))?;
        let price = entry
            .usd
            .as_ref()
            .and_then(decimal_from_number)
            .ok_or_else(|| FetchError::Parse(format!("missing usd price for {coin}")))?;

        let or_zero = |n: Option<serde_json::Number>| {
            n.as_ref()
                .and_then(decimal_from_number)
                .unwrap_or(Decimal::ZERO)
        };

        Ok(PriceSnapshot {
            price,
            price_change_24h: or_zero(entry.usd_24h_change),
            volume_24h: or_zero(entry.usd_24h_vol),
            market_cap: or_zero(entry.usd_market_cap),
        })
    }

    /// Indicator snapshot computed from 30 days of daily closes.
    ///
    /// # Errors
    ///
    /// [`FetchError::NotFound`] when CoinGecko returns no price history.
    pub async fn fetch_indicators(
        &self,
        coin: &InstrumentKey,
    ) -> Result<IndicatorSnapshot, FetchError> {
        let url = format!("{}/coins/{}/market_chart", self.base_url, coin.as_str());
        let response = self
            .get(&url)
            .query(&[
                ("vs_currency", "usd"),
                ("days", HISTORY_DAYS),
                ("interval", "daily"),
            ])
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        let response = match check_status(response).await {
            Err(FetchError::Api { status: 404, .. }) => {
                return Err(FetchError::NotFound(coin.to_string()));
            }
            other => other?,
        };

        let chart: MarketChart = response
            .json()
            .await
            .map_err(|e| FetchError::Parse(e.to_string()))?;

        let closes = chart
            .prices
            .iter()
            .map(|(_, price)| decimal_from_number(price))
            .collect::<Option<Vec<Decimal>>>()
            .ok_or_else(|| FetchError::Parse(format!("unreadable close in {coin} history")))?;
        indicators::analyze(&closes).ok_or_else(|| FetchError::NotFound(coin.to_string()))
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.http.get(url);
        match &self.api_key {
            Some(key) => request.header(API_KEY_HEADER, key.expose()),
            None => request,
        }
    }
}
