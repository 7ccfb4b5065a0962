//! Per-chat subscription state and the commands that change it.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::feed::{CollectionError, FeedCollection, DEFAULT_WORKERS};
use crate::notify::template::{self, RenderError};

/// Identifier of the chat (or user) that receives messages.
pub type ChatId = i64;

/// Delivery mode of a feed list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Every new entry as its own message, polled on a short interval
    Asap,
    /// One message per feed, once a day
    Digest,
}

impl Mode {
    pub const ALL: [Mode; 2] = [Mode::Asap, Mode::Digest];
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Asap => f.write_str("asap"),
            Mode::Digest => f.write_str("digest"),
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asap" => Ok(Mode::Asap),
            "digest" => Ok(Mode::Digest),
            other => Err(format!("unknown mode '{other}' (expected 'asap' or 'digest')")),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubscriberError {
    #[error(transparent)]
    Collection(#[from] CollectionError),
    #[error("{0} was not found in your feeds")]
    NotFound(String),
    #[error("Invalid template: {0}")]
    Template(#[from] RenderError),
}

/// One row of a feed listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSummary {
    pub url: String,
    pub title: String,
    pub custom_template: bool,
}

/// Everything known about one chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    chat_id: ChatId,
    asap: FeedCollection,
    digest: FeedCollection,
    #[serde(default)]
    templates: BTreeMap<String, String>,
    digest_time: NaiveTime,
}

impl Subscriber {
    pub fn new(chat_id: ChatId) -> Self {
        Self::with_workers(chat_id, DEFAULT_WORKERS)
    }

    pub fn with_workers(chat_id: ChatId, workers: usize) -> Self {
        Self {
            chat_id,
            asap: FeedCollection::new(workers),
            digest: FeedCollection::new(workers),
            templates: BTreeMap::new(),
            digest_time: NaiveTime::MIN,
        }
    }

    pub fn chat_id(&self) -> ChatId {
        self.chat_id
    }

    pub fn collection(&self, mode: Mode) -> &FeedCollection {
        match mode {
            Mode::Asap => &self.asap,
            Mode::Digest => &self.digest,
        }
    }

    pub fn collection_mut(&mut self, mode: Mode) -> &mut FeedCollection {
        match mode {
            Mode::Asap => &mut self.asap,
            Mode::Digest => &mut self.digest,
        }
    }

    /// Apply a configured fan-out width to both collections.
    pub fn set_workers(&mut self, workers: usize) {
        self.asap.set_workers(workers);
        self.digest.set_workers(workers);
    }

    pub fn templates(&self) -> &BTreeMap<String, String> {
        &self.templates
    }

    pub fn digest_time(&self) -> NaiveTime {
        self.digest_time
    }

    pub fn set_digest_time(&mut self, time: NaiveTime) {
        self.digest_time = time;
    }

    pub fn is_subscribed(&self, url: &str) -> bool {
        self.asap.contains(url) || self.digest.contains(url)
    }

    pub fn add_feed(&mut self, mode: Mode, url: &str) -> Result<(), SubscriberError> {
        self.collection_mut(mode).add(url)?;
        tracing::info!(chat_id = self.chat_id, mode = %mode, feed = %url, "Feed added");
        Ok(())
    }

    /// Remove `url` from whichever lists contain it.
    ///
    /// Returns the modes it was removed from. A custom template goes away
    /// with the last subscription to its feed.
    pub fn remove_feed(&mut self, url: &str) -> Result<Vec<Mode>, SubscriberError> {
        let removed: Vec<Mode> = Mode::ALL
            .into_iter()
            .filter(|mode| self.collection_mut(*mode).remove(url).is_ok())
            .collect();

        if removed.is_empty() {
            return Err(SubscriberError::NotFound(url.to_string()));
        }
        self.templates.remove(url);
        tracing::info!(chat_id = self.chat_id, feed = %url, "Feed removed");
        Ok(removed)
    }

    /// Set (or with `None`, clear) the custom template of a subscribed feed.
    pub fn set_template(&mut self, url: &str, template: Option<String>) -> Result<(), SubscriberError> {
        if !self.is_subscribed(url) {
            return Err(SubscriberError::NotFound(url.to_string()));
        }
        match template {
            Some(template) => {
                template::validate(&template, true)?;
                self.templates.insert(url.to_string(), template);
            }
            None => {
                self.templates.remove(url);
            }
        }
        Ok(())
    }

    /// Take over the fetch state a run produced for `mode`, keeping any
    /// membership, template or digest-time edits made since it loaded.
    pub fn merge_fetch_state(&mut self, mode: Mode, fetched: &Subscriber) {
        self.collection_mut(mode)
            .merge_fetch_state(fetched.collection(mode));
    }

    pub fn list_feeds(&self, mode: Mode) -> Vec<FeedSummary> {
        self.collection(mode)
            .iter()
            .map(|(url, feed)| FeedSummary {
                url: url.to_string(),
                title: feed.metadata().title.clone(),
                custom_template: self.templates.contains_key(url),
            })
            .collect()
    }
}
