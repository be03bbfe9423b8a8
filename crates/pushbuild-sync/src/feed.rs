//! Pushlog feed client.
//!
//! Queries `{base}/{branch}/json-pushes`, which answers with a JSON object
//! mapping push ids to `{date, changesets, user}`.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use pushbuild_config::FeedConfig;
use pushbuild_core::push::Push;
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

/// What to ask the pushlog for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedQuery {
    /// Pushes after a changeset (or the default window when `None`).
    After(Option<String>),
    /// The push containing this exact changeset.
    Containing(String),
    /// Pushes after `from`, up to and including `to` (or the tip).
    Range { from: String, to: Option<String> },
}

impl FeedQuery {
    fn params(&self) -> Vec<(&'static str, &str)> {
        match self {
            FeedQuery::After(None) => vec![],
            FeedQuery::After(Some(after)) => vec![("fromchange", after.as_str())],
            FeedQuery::Containing(changeset) => vec![("changeset", changeset.as_str())],
            FeedQuery::Range { from, to } => {
                let mut params = vec![("fromchange", from.as_str())];
                if let Some(to) = to {
                    params.push(("tochange", to.as_str()));
                }
                params
            }
        }
    }
}

/// Source of authoritative push records.
#[async_trait]
pub trait PushFeed: Send + Sync {
    /// Pushes for `branch` matching `query`, ordered by date then push id.
    ///
    /// Never fails: transient errors are retried and, once retries run out,
    /// reported as an empty result.
    async fn pushes(&self, branch: &str, query: &FeedQuery) -> Vec<Push>;
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("invalid pushlog response: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("cannot build query URL for branch {0}")]
    Url(String),
}

#[derive(Debug, Deserialize)]
struct RawPush {
    date: i64,
    #[serde(default)]
    changesets: Vec<String>,
}

/// Parse a json-pushes body into ordered pushes, stamped with `received`.
///
/// Entries with a non-numeric id, an empty changeset list or an out of range
/// date are dropped.
pub fn parse_pushes(
    branch: &str,
    body: &[u8],
    received: DateTime<Utc>,
) -> Result<Vec<Push>, FeedError> {
    let raw: HashMap<String, RawPush> = serde_json::from_slice(body)?;

    let mut pushes: Vec<Push> = raw
        .into_iter()
        .filter_map(|(id, raw)| {
            let id = id.parse::<u64>().ok()?;
            let date = Utc.timestamp_opt(raw.date, 0).single()?;
            Push::new(id, branch, raw.changesets, date, received)
        })
        .collect();
    pushes.sort_by_key(Push::order_key);

    Ok(pushes)
}

/// Run `op` up to `attempts` times, pausing `delay` between failures.
pub async fn with_retries<T, F, Fut>(attempts: u32, delay: Duration, mut op: F) -> Option<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, FeedError>>,
{
    for attempt in 1..=attempts {
        match op(attempt).await {
            Ok(value) => return Some(value),
            Err(e) => {
                debug!(attempt, attempts, error = %e, "Pushlog query failed");
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    None
}

/// HTTP client for the pushlog.
#[derive(Debug, Clone)]
pub struct ChangesetFeed {
    client: reqwest::Client,
    base_url: Url,
    retries: u32,
    retry_delay: Duration,
}

impl ChangesetFeed {
    /// Client whose requests give up after `config.request_timeout`, so a
    /// stalled server costs one retry rather than the whole worker.
    pub fn new(config: &FeedConfig) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: reqwest::Client, config: &FeedConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.clone(),
            retries: config.retries.max(1),
            retry_delay: config.retry_delay,
        }
    }

    /// URL for a pushlog query. Branch names may contain `/`.
    pub fn query_url(&self, branch: &str, query: &FeedQuery) -> Result<Url, FeedError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| FeedError::Url(branch.to_string()))?
            .pop_if_empty()
            .extend(branch.split('/').filter(|s| !s.is_empty()))
            .push("json-pushes");

        let params = query.params();
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        Ok(url)
    }

    async fn fetch(&self, url: &Url, branch: &str) -> Result<Vec<Push>, FeedError> {
        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(FeedError::Status(response.status().as_u16()));
        }
        let body = response.bytes().await?;
        parse_pushes(branch, &body, Utc::now())
    }
}

#[async_trait]
impl PushFeed for ChangesetFeed {
    async fn pushes(&self, branch: &str, query: &FeedQuery) -> Vec<Push> {
        let url = match self.query_url(branch, query) {
            Ok(url) => url,
            Err(e) => {
                warn!(branch = %branch, error = %e, "Invalid pushlog query");
                return Vec::new();
            }
        };

        match with_retries(self.retries, self.retry_delay, |_| self.fetch(&url, branch)).await {
            Some(pushes) => pushes,
            None => {
                warn!(
                    branch = %branch,
                    url = %url,
                    attempts = self.retries,
                    "Giving up on pushlog query"
                );
                Vec::new()
            }
        }
    }
}
