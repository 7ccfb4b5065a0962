use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::parser::{parse_feed, Entry, ParsedFeed};
use super::transport::{FetchError, FetchOutcome, Transport, Validators};

/// How long a feed stays quiet after each kind of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Transport, HTTP status and parse failures
    pub error: Duration,
    /// Documents whose entries lack publication times
    pub missing_timestamp: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            error: Duration::from_secs(24 * 60 * 60),
            missing_timestamp: Duration::from_secs(6 * 60 * 60),
        }
    }
}

/// Fetch state of a single feed. Exactly one holds at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedState {
    Active,
    /// No network calls until `until`; lifted by the first fetch after it
    Paused { until: DateTime<Utc> },
    /// Server answered 410; never fetched again
    Gone,
}

/// Display attributes of the feed itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedMetadata {
    pub title: String,
    pub subtitle: String,
    pub link: String,
    pub description: String,
}

impl FeedMetadata {
    /// Sentinel shown before the first successful fetch and after a 410.
    pub fn placeholder(url: &str) -> Self {
        Self {
            title: format!("Feed not found - {url}"),
            subtitle: String::new(),
            link: url.to_string(),
            description: String::new(),
        }
    }

    fn from_parsed(parsed: &ParsedFeed, url: &str) -> Self {
        let description = parsed.description.clone().unwrap_or_default();
        Self {
            title: parsed
                .title
                .clone()
                .unwrap_or_else(|| format!("Untitled feed - {url}")),
            subtitle: description.clone(),
            link: parsed.link.clone().unwrap_or_else(|| url.to_string()),
            description,
        }
    }
}

/// One subscribed feed and everything needed to decide what is new in it.
///
/// Novelty follows a timestamp watermark: an entry is new when its
/// publication time is strictly later than the watermark, and the watermark
/// then moves to the latest entry returned. A new feed starts with the
/// watermark at its creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feed {
    url: String,
    #[serde(default)]
    validators: Validators,
    watermark: DateTime<Utc>,
    state: FeedState,
    metadata: FeedMetadata,
}

impl Feed {
    pub fn new(url: &str) -> Self {
        Self::with_watermark(url, Utc::now())
    }

    pub fn with_watermark(url: &str, watermark: DateTime<Utc>) -> Self {
        Self {
            url: url.to_string(),
            validators: Validators::default(),
            watermark,
            state: FeedState::Active,
            metadata: FeedMetadata::placeholder(url),
        }
    }

    /// Current fetch address (follows permanent redirects).
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn metadata(&self) -> &FeedMetadata {
        &self.metadata
    }

    pub fn state(&self) -> FeedState {
        self.state
    }

    pub fn watermark(&self) -> DateTime<Utc> {
        self.watermark
    }

    pub fn validators(&self) -> &Validators {
        &self.validators
    }

    /// Performs one conditional fetch and returns the entries not seen before.
    ///
    /// # Arguments
    ///
    /// * `transport` - Performs the GET, sending the stored validators
    /// * `backoff` - How long to pause after each kind of failure
    ///
    /// # Returns
    ///
    /// Entries published strictly after the watermark, in document order.
    /// Empty when the feed is paused or gone, or the server answered 304.
    ///
    /// # Errors
    ///
    /// Returns the [`FetchError`] of a failed attempt. The feed is paused
    /// before returning, so errors are data for the caller to report.
    ///
    /// # Behavior
    ///
    /// - A pause that has expired is lifted before fetching
    /// - 301/308 redirect chains move the fetch address for good
    /// - 410 marks the feed gone and restores placeholder metadata
    /// - Metadata is refreshed from every parsed document
    /// - Any undated entry pauses the feed for `backoff.missing_timestamp`
    ///   without touching validators or watermark
    /// - On success the watermark moves to the newest returned entry
    pub async fn fetch_new_entries(
        &mut self,
        transport: &dyn Transport,
        backoff: &Backoff,
    ) -> Result<Vec<Entry>, FetchError> {
        self.fetch_at(transport, backoff, Utc::now()).await
    }

    pub(crate) async fn fetch_at(
        &mut self,
        transport: &dyn Transport,
        backoff: &Backoff,
        now: DateTime<Utc>,
    ) -> Result<Vec<Entry>, FetchError> {
        match self.state {
            FeedState::Gone => return Ok(Vec::new()),
            FeedState::Paused { until } if now < until => {
                tracing::trace!(feed = %self.url, until = %until, "Feed paused, skipping fetch");
                return Ok(Vec::new());
            }
            FeedState::Paused { .. } => {
                tracing::debug!(feed = %self.url, "Pause expired, resuming fetches");
                self.state = FeedState::Active;
            }
            FeedState::Active => {}
        }

        let response = match transport.fetch(&self.url, &self.validators).await {
            Ok(response) => response,
            Err(e) => {
                self.pause(now, backoff.error);
                tracing::warn!(feed = %self.url, error = %e, "Fetch failed, pausing feed");
                return Err(e);
            }
        };

        if let Some(target) = response.permanent_redirect {
            tracing::info!(from = %self.url, to = %target, "Feed moved permanently");
            self.url = target;
        }

        let body = match response.outcome {
            FetchOutcome::Fetched(body) => body,
            // The watermark stays put: a later update may still carry
            // entries dated before now.
            FetchOutcome::NotModified => return Ok(Vec::new()),
            FetchOutcome::Gone => {
                tracing::info!(feed = %self.url, "Feed is gone, disabling");
                self.state = FeedState::Gone;
                self.metadata = FeedMetadata::placeholder(&self.url);
                return Ok(Vec::new());
            }
        };

        let parsed = match parse_feed(&body) {
            Ok(parsed) => parsed,
            Err(e) => {
                let err = FetchError::from(e);
                self.pause(now, backoff.error);
                tracing::warn!(feed = %self.url, error = %err, "Unparseable feed, pausing");
                return Err(err);
            }
        };

        self.metadata = FeedMetadata::from_parsed(&parsed, &self.url);

        let undated = parsed
            .entries
            .iter()
            .filter(|e| e.published.is_none())
            .count();
        if undated > 0 {
            self.pause(now, backoff.missing_timestamp);
            tracing::warn!(feed = %self.url, undated = undated, "Entries without timestamps, pausing");
            return Err(FetchError::MissingTimestamp(undated));
        }

        self.validators = response.validators;
        let entries = select_new(parsed.entries, self.watermark);
        if let Some(latest) = entries.iter().filter_map(|e| e.published).max() {
            self.watermark = latest;
        }

        if !entries.is_empty() {
            tracing::debug!(feed = %self.url, new = entries.len(), "New entries");
        }
        Ok(entries)
    }

    fn pause(&mut self, now: DateTime<Utc>, duration: Duration) {
        let until = TimeDelta::from_std(duration)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.state = FeedState::Paused { until };
    }
}

/// Entries published strictly after `watermark`, in their original order.
pub fn select_new(entries: Vec<Entry>, watermark: DateTime<Utc>) -> Vec<Entry> {
    entries
        .into_iter()
        .filter(|e| e.published.is_some_and(|p| p > watermark))
        .collect()
}
