//! Feed polling engine.
//!
//! This module decides what is new in a feed and keeps fetching safe against
//! servers that misbehave:
//!
//! - **Parsing**: RSS/Atom/JSON Feed documents into [`Entry`] values
//! - **Transport**: conditional HTTP GET with manual redirect handling
//! - **Feed**: per-URL state machine (watermark, validators, pause, gone)
//! - **Collection**: bounded concurrent fan-out over a subscriber's feeds
//!
//! # Example
//!
//! ```ignore
//! use dailyfeed::feed::{Backoff, FeedCollection, HttpTransport};
//!
//! let transport = HttpTransport::new("dailyfeed/0.1", Duration::from_secs(30))?;
//! let mut feeds = FeedCollection::default();
//! feeds.add("https://example.com/feed.xml")?;
//! let results = feeds.fetch_all(&transport, &Backoff::default()).await;
//! ```

mod collection;
mod parser;
mod source;
#[cfg(test)]
pub(crate) mod testing;
mod transport;

pub use collection::{CollectionError, FeedCollection, FetchResults, DEFAULT_WORKERS};
pub use parser::{parse_feed, Entry, ParsedFeed};
pub use source::{select_new, Backoff, Feed, FeedMetadata, FeedState};
pub use transport::{
    FetchError, FetchOutcome, FetchResponse, HttpTransport, Transport, Validators,
};
