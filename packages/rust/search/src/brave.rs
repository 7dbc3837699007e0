//! Brave web search provider.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use briefengine_shared::{BriefError, ProviderError, Result, SearchConfig};

use crate::{RawResult, SearchProvider, SearchQuery};

/// User-Agent string for search requests.
const USER_AGENT: &str = concat!("briefengine/", env!("CARGO_PKG_VERSION"));

/// Brave wraps matched terms in `<strong>`; snippets go into a prompt as plain text.
static INLINE_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"</?[a-zA-Z][^>]*>").unwrap());

/// Client for the Brave Search web endpoint.
pub struct BraveSearch {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl BraveSearch {
    /// Build a client from the `[search]` config and the search credential.
    pub fn new(config: &SearchConfig, api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| BriefError::config(format!("failed to build search HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl SearchProvider for BraveSearch {
    fn name(&self) -> &str {
        "brave"
    }

    async fn search(&self, query: &SearchQuery) -> std::result::Result<Vec<RawResult>, ProviderError> {
        let count = query.count.to_string();
        let mut params: Vec<(&str, &str)> = vec![("q", query.text.as_str()), ("count", count.as_str())];
        if let Some(freshness) = &query.freshness {
            params.push(("freshness", freshness.as_str()));
        }

        let response = self
            .client
            .get(&self.endpoint)
            .header("Accept", "application/json")
            .header("X-Subscription-Token", &self.api_key)
            .query(&params)
            .send()
            .await
            .map_err(|e| ProviderError::transient(format!("search request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), truncate(&body, 200)));
        }

        let body: BraveResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::permanent(format!("invalid search response: {e}")))?;

        let results: Vec<RawResult> = body
            .web
            .map(|w| w.results)
            .unwrap_or_default()
            .into_iter()
            .map(BraveResult::into_raw)
            .collect();

        debug!(query = %query.text, results = results.len(), "brave search complete");
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct BraveResponse {
    #[serde(default)]
    web: Option<BraveWeb>,
}

#[derive(Debug, Deserialize)]
struct BraveWeb {
    #[serde(default)]
    results: Vec<BraveResult>,
}

#[derive(Debug, Deserialize)]
struct BraveResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    age: Option<String>,
    #[serde(default)]
    page_age: Option<String>,
    #[serde(default)]
    profile: Option<BraveProfile>,
    #[serde(default)]
    meta_url: Option<BraveMetaUrl>,
}

#[derive(Debug, Deserialize)]
struct BraveProfile {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BraveMetaUrl {
    #[serde(default)]
    hostname: Option<String>,
}

impl BraveResult {
    fn into_raw(self) -> RawResult {
        let source = self
            .profile
            .and_then(|p| p.name)
            .or_else(|| self.meta_url.and_then(|m| m.hostname))
            .filter(|s| !s.trim().is_empty());

        RawResult {
            title: strip_inline_tags(&self.title),
            url: self.url,
            source,
            published: self.page_age.as_deref().and_then(parse_page_age),
            age: self.age,
            snippet: strip_inline_tags(&self.description),
        }
    }
}

fn strip_inline_tags(text: &str) -> String {
    INLINE_TAG.replace_all(text, "").trim().to_string()
}

/// `page_age` arrives either as RFC 3339 or as a naive UTC timestamp.
fn parse_page_age(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
