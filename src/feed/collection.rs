use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use super::parser::Entry;
use super::source::{Backoff, Feed};
use super::transport::{FetchError, Transport};

/// Default number of feeds fetched at once per collection.
pub const DEFAULT_WORKERS: usize = 5;

/// Outcome of [`FeedCollection::fetch_all`], keyed by membership URL.
pub type FetchResults = HashMap<String, Result<Vec<Entry>, FetchError>>;

/// Membership errors. Both are user mistakes, not failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CollectionError {
    #[error("{0} has already been added")]
    Duplicate(String),
    #[error("{0} is not in this feed list")]
    Unknown(String),
}

/// The feeds one subscriber receives in one delivery mode.
///
/// Members are keyed by the URL the subscriber added. A permanent redirect
/// changes the feed's fetch address but never its key, so the subscriber can
/// always remove a feed by the URL they know.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedCollection {
    feeds: BTreeMap<String, Feed>,
    #[serde(default = "default_workers")]
    workers: usize,
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

impl Default for FeedCollection {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS)
    }
}

impl FeedCollection {
    pub fn new(workers: usize) -> Self {
        Self {
            feeds: BTreeMap::new(),
            workers,
        }
    }

    pub fn set_workers(&mut self, workers: usize) {
        self.workers = workers;
    }

    pub fn add(&mut self, url: &str) -> Result<(), CollectionError> {
        if self.feeds.contains_key(url) {
            return Err(CollectionError::Duplicate(url.to_string()));
        }
        self.feeds.insert(url.to_string(), Feed::new(url));
        Ok(())
    }

    pub fn remove(&mut self, url: &str) -> Result<Feed, CollectionError> {
        self.feeds
            .remove(url)
            .ok_or_else(|| CollectionError::Unknown(url.to_string()))
    }

    pub fn contains(&self, url: &str) -> bool {
        self.feeds.contains_key(url)
    }

    pub fn get(&self, url: &str) -> Option<&Feed> {
        self.feeds.get(url)
    }

    pub fn len(&self) -> usize {
        self.feeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.feeds.is_empty()
    }

    /// Copy fetch state from `other` into members both collections share.
    ///
    /// Membership itself is left alone: feeds only in `other` are not added
    /// and feeds only in `self` keep their state.
    pub fn merge_fetch_state(&mut self, other: &FeedCollection) {
        for (url, feed) in &other.feeds {
            if let Some(slot) = self.feeds.get_mut(url) {
                *slot = feed.clone();
            }
        }
    }

    /// Members in key order, for listings.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Feed)> {
        self.feeds.iter().map(|(url, feed)| (url.as_str(), feed))
    }

    /// Fetches every member concurrently with bounded parallelism.
    ///
    /// Each member runs [`Feed::fetch_new_entries`], which advances its own
    /// watermark, validators and pause state.
    ///
    /// # Arguments
    ///
    /// * `transport` - Performs the conditional GETs
    /// * `backoff` - Pause lengths for failing members
    ///
    /// # Returns
    ///
    /// A map with exactly one result per member, keyed by the URL the
    /// member was added under (not its redirected fetch address).
    ///
    /// # Behavior
    ///
    /// - At most `workers` fetches are in flight at once (at least one)
    /// - Paused and gone members resolve immediately to an empty list
    /// - One member failing never affects the others
    /// - There is no internal timeout; wrap the call if one is needed
    pub async fn fetch_all(&mut self, transport: &dyn Transport, backoff: &Backoff) -> FetchResults {
        let total = self.feeds.len();
        let width = self.workers.max(1);

        let fetches: Vec<_> = self
            .feeds
            .iter_mut()
            .map(|(url, feed)| async move {
                let result = feed.fetch_new_entries(transport, backoff).await;
                (url.clone(), result)
            })
            .collect();
        let results: FetchResults = stream::iter(fetches)
            .buffer_unordered(width)
            .collect()
            .await;

        let failed = results.values().filter(|r| r.is_err()).count();
        tracing::debug!(feeds = total, failed = failed, workers = width, "Collection fetched");
        results
    }
}
