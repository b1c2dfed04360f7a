//! NewsAPI client.
//!
//! Polls `everything` for recent crypto headlines and keeps a cursor so each
//! call only returns articles newer than anything already returned. The
//! cursor belongs to the current news poller; a fresh poller starts from
//! [`NewsApiClient::reset_cursor`] and replays the lookback window.

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::Deserialize;

use super::{check_status, transport_error};
use crate::application::ports::FetchError;
use crate::domain::snapshot::{NewsArticle, NewsBatch};
use crate::infrastructure::config::ApiKey;

/// Search terms, OR-joined into the query.
pub const NEWS_KEYWORDS: [&str; 5] = [
    "bitcoin",
    "ethereum",
    "cryptocurrency",
    "crypto",
    "blockchain",
];

const LOOKBACK_HOURS: i64 = 2;
const PAGE_SIZE: &str = "10";
const DESCRIPTION_MAX_CHARS: usize = 300;

/// NewsAPI headline client.
pub struct NewsApiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<ApiKey>,
    cursor: Mutex<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for NewsApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewsApiClient")
            .field("base_url", &self.base_url)
            .field("configured", &self.api_key.is_some())
            .field("cursor", &*self.cursor.lock())
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct EverythingResponse {
    status: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    articles: Vec<RawArticle>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawArticle {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    url_to_image: Option<String>,
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    source: Option<RawSource>,
}

#[derive(Deserialize)]
struct RawSource {
    name: Option<String>,
}

impl NewsApiClient {
    /// Create a client against `base_url`.
    #[must_use]
    pub fn new(http: reqwest::Client, base_url: String, api_key: Option<ApiKey>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            cursor: Mutex::new(None),
        }
    }

    /// Publication time of the newest article returned so far.
    #[must_use]
    pub fn cursor(&self) -> Option<DateTime<Utc>> {
        *self.cursor.lock()
    }

    /// Forget the cursor so the next fetch returns the whole lookback window.
    pub fn reset_cursor(&self) {
        *self.cursor.lock() = None;
    }

    /// Articles from the last two hours that are newer than the cursor,
    /// newest first. The cursor only advances on success.
    ///
    /// # Errors
    ///
    /// [`FetchError::NotConfigured`] without an API key.
    pub async fn fetch_latest(&self) -> Result<NewsBatch, FetchError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| FetchError::NotConfigured("NEWS_API_KEY".to_string()))?;

        let from = (Utc::now() - ChronoDuration::hours(LOOKBACK_HOURS))
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        let query = NEWS_KEYWORDS.join(" OR ");

        let url = format!("{}/everything", self.base_url);
        let response = self
            .http
            .get(&url)
            .header("X-Api-Key", api_key.expose())
            .query(&[
                ("q", query.as_str()),
                ("from", from.as_str()),
                ("sortBy", "publishedAt"),
                ("language", "en"),
                ("pageSize", PAGE_SIZE),
            ])
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        let body: EverythingResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| FetchError::Parse(e.to_string()))?;

        if body.status != "ok" {
            return Err(FetchError::Api {
                status: 200,
                message: format!(
                    "{}: {}",
                    body.code.unwrap_or_default(),
                    body.message.unwrap_or_default()
                ),
            });
        }

        let mut cursor = self.cursor.lock();
        let mut articles: Vec<NewsArticle> = body
            .articles
            .into_iter()
            .filter_map(normalize)
            .filter(|article| cursor.is_none_or(|seen| article.published_at > seen))
            .collect();
        articles.sort_by(|a, b| b.published_at.cmp(&a.published_at));

        if let Some(newest) = articles.first() {
            *cursor = Some(newest.published_at);
        }

        Ok(NewsBatch { articles })
    }
}

/// Drop articles without a title, link or timestamp; trim the description.
fn normalize(raw: RawArticle) -> Option<NewsArticle> {
    let title = raw.title.filter(|t| !t.is_empty())?;
    let url = raw.url.filter(|u| !u.is_empty())?;
    let published_at = raw.published_at?;

    let description: String = raw
        .description
        .unwrap_or_default()
        .chars()
        .take(DESCRIPTION_MAX_CHARS)
        .collect();

    Some(NewsArticle {
        title,
        description,
        url,
        source: raw
            .source
            .and_then(|s| s.name)
            .unwrap_or_else(|| "Unknown".to_string()),
        image_url: raw.url_to_image.filter(|u| !u.is_empty()),
        published_at,
    })
}
