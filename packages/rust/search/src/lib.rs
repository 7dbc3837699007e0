//! Search aggregation: the Search Aggregator stage.
//!
//! Each configured query runs independently against a [`SearchProvider`]
//! (bounded concurrency, per-query timeout). Failed queries are logged and
//! omitted; the stage only fails when every query fails or nothing usable
//! comes back. Results are filtered to those with an http(s) URL,
//! deduplicated by URL (first seen wins), ordered newest-first where a
//! publication time is known, and capped.

mod brave;

use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};
use url::Url;

use briefengine_shared::{BriefError, EvidenceItem, ProviderError, Result, RunType, with_timeout};

pub use brave::BraveSearch;

// ---------------------------------------------------------------------------
// Provider contract
// ---------------------------------------------------------------------------

/// One query as sent to a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub text: String,
    /// Provider recency window (`pd` = past day, `pw` = past week).
    pub freshness: Option<String>,
    /// Results requested.
    pub count: u32,
}

/// One result as returned by a provider, before URL filtering.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawResult {
    pub title: String,
    pub url: String,
    pub source: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub age: Option<String>,
    pub snippet: String,
}

/// A web search backend.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &str;

    /// Run one query. May fail or time out per call.
    async fn search(&self, query: &SearchQuery) -> std::result::Result<Vec<RawResult>, ProviderError>;
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Limits applied to one aggregation.
#[derive(Debug, Clone)]
pub struct AggregateOptions {
    /// Maximum queries in flight.
    pub concurrency: usize,
    /// Deadline per query.
    pub timeout: Duration,
    /// Results requested per query.
    pub results_per_query: u32,
    /// Recency window passed with every query.
    pub freshness: Option<String>,
    /// Evidence cap after deduplication.
    pub max_evidence: usize,
    /// Minimum spacing between query dispatches. Responses may still overlap.
    pub min_interval: Duration,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            concurrency: 3,
            timeout: Duration::from_secs(15),
            results_per_query: 8,
            freshness: None,
            max_evidence: 40,
            min_interval: Duration::from_millis(1200),
        }
    }
}

/// Merged, ordered evidence for one run, plus what was discarded along the way.
#[derive(Debug, Clone, Default)]
pub struct EvidenceSet {
    pub items: Vec<EvidenceItem>,
    /// Queries that returned successfully (possibly with zero results).
    pub queries_succeeded: usize,
    /// `(query, error)` for each degraded query.
    pub queries_failed: Vec<(String, String)>,
    /// Results dropped for a missing or non-http(s) URL.
    pub dropped_without_url: usize,
    /// Results dropped as duplicates of an earlier URL.
    pub duplicates: usize,
    /// Results dropped by the evidence cap.
    pub truncated: usize,
}

/// Recency window for the standard run types when a module does not set one.
pub fn default_freshness(run_type: &RunType) -> Option<String> {
    match run_type.as_str() {
        RunType::DAILY | RunType::FLASH => Some("pd".into()),
        RunType::WEEKLY => Some("pw".into()),
        _ => None,
    }
}

/// Execute every query and merge the results into one evidence set.
#[instrument(skip_all, fields(provider = provider.name(), queries = queries.len()))]
pub async fn aggregate(
    provider: Arc<dyn SearchProvider>,
    queries: &[String],
    opts: &AggregateOptions,
) -> Result<EvidenceSet> {
    if queries.is_empty() {
        return Err(BriefError::SearchUnavailable {
            message: "no search queries configured".into(),
        });
    }

    let start = Instant::now();
    let semaphore = Arc::new(Semaphore::new(opts.concurrency.max(1)));
    let pacer = pacer(opts.min_interval);
    let mut handles = Vec::with_capacity(queries.len());

    for text in queries {
        let provider = Arc::clone(&provider);
        let sem = Arc::clone(&semaphore);
        let pacer = pacer.clone();
        let query = SearchQuery {
            text: text.clone(),
            freshness: opts.freshness.clone(),
            count: opts.results_per_query,
        };
        let timeout = opts.timeout;

        handles.push(tokio::spawn(async move {
            let _permit = sem
                .acquire_owned()
                .await
                .map_err(|e| ProviderError::permanent(format!("search semaphore closed: {e}")))?;
            if let Some(pacer) = pacer {
                pacer.lock().await.tick().await;
            }
            with_timeout(timeout, provider.search(&query)).await
        }));
    }

    // join_all yields in spawn order, so merge order follows configuration order.
    let mut per_query: Vec<Vec<RawResult>> = Vec::with_capacity(queries.len());
    let mut set = EvidenceSet::default();

    for (text, joined) in queries.iter().zip(join_all(handles).await) {
        let outcome = match joined {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(e) => Err(format!("search task failed: {e}")),
        };

        match outcome {
            Ok(results) => {
                debug!(query = %text, results = results.len(), "query succeeded");
                set.queries_succeeded += 1;
                per_query.push(results);
            }
            Err(error) => {
                warn!(query = %text, %error, "search query failed, omitting");
                set.queries_failed.push((text.clone(), error));
            }
        }
    }

    if set.queries_succeeded == 0 {
        let last = set
            .queries_failed
            .last()
            .map(|(_, e)| e.as_str())
            .unwrap_or("unknown error");
        return Err(BriefError::SearchUnavailable {
            message: format!("all {} search queries failed (last error: {last})", queries.len()),
        });
    }

    merge_into(&mut set, per_query, opts.max_evidence);

    if set.items.is_empty() {
        return Err(BriefError::SearchUnavailable {
            message: "search returned no results with a usable URL".into(),
        });
    }

    info!(
        evidence = set.items.len(),
        succeeded = set.queries_succeeded,
        failed = set.queries_failed.len(),
        dropped_without_url = set.dropped_without_url,
        duplicates = set.duplicates,
        truncated = set.truncated,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "search aggregation complete"
    );

    Ok(set)
}

/// Shared dispatch clock; `None` when queries may start back to back.
fn pacer(min_interval: Duration) -> Option<Arc<Mutex<Interval>>> {
    if min_interval.is_zero() {
        return None;
    }
    let mut interval = tokio::time::interval(min_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(Arc::new(Mutex::new(interval)))
}

/// Filter, deduplicate, order, and cap per-query results (given in configuration order).
fn merge_into(set: &mut EvidenceSet, per_query: Vec<Vec<RawResult>>, max_evidence: usize) {
    let mut seen = HashSet::new();
    let mut items = Vec::new();

    for raw in per_query.into_iter().flatten() {
        let Some(url) = usable_url(&raw.url) else {
            set.dropped_without_url += 1;
            continue;
        };

        if !seen.insert(dedup_key(&url)) {
            set.duplicates += 1;
            continue;
        }

        items.push(EvidenceItem {
            title: non_empty(raw.title).unwrap_or_else(|| url.host_str().unwrap_or("untitled").to_string()),
            source: raw.source.or_else(|| url.host_str().map(str::to_string)),
            url: url.to_string(),
            published: raw.published,
            age: raw.age,
            snippet: raw.snippet,
        });
    }

    // Stable: dated items newest first, undated items keep their merge order after them.
    items.sort_by_key(|item| Reverse(item.published));

    if items.len() > max_evidence {
        set.truncated = items.len() - max_evidence;
        items.truncate(max_evidence);
    }

    set.items = items;
}

/// Parse an absolute http(s) URL with a host; anything else cannot be cited.
fn usable_url(raw: &str) -> Option<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let url = Url::parse(trimmed).ok()?;
    let web = matches!(url.scheme(), "http" | "https");
    (web && url.host_str().is_some_and(|h| !h.is_empty())).then_some(url)
}

/// Normalize a URL for deduplication (strip fragment and trailing slash).
fn dedup_key(url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);
    let mut s = normalized.to_string();
    if s.ends_with('/') && s.matches('/').count() > 3 {
        s.pop();
    }
    s
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
