use chrono::{DateTime, Utc};
use feed_rs::model::Link;
use feed_rs::parser::{self, ParseFeedError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One item published by a feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Feed-provided guid, or a content hash when the feed has none
    pub id: String,
    pub title: String,
    pub link: Option<String>,
    /// Publication time, falling back to the last-updated time
    pub published: Option<DateTime<Utc>>,
    pub summary: Option<String>,
}

/// Feed document reduced to the fields the poller cares about.
#[derive(Debug, Clone, Default)]
pub struct ParsedFeed {
    pub title: Option<String>,
    pub description: Option<String>,
    pub link: Option<String>,
    pub entries: Vec<Entry>,
}

/// Parse an RSS, Atom or JSON Feed document.
///
/// Entries are returned in document order, which for most feeds is newest
/// first.
pub fn parse_feed(bytes: &[u8]) -> Result<ParsedFeed, ParseFeedError> {
    let feed = parser::parse(bytes)?;

    let entries = feed
        .entries
        .into_iter()
        .map(|entry| {
            let link = preferred_link(&entry.links);
            let published = entry.published.or(entry.updated);
            let summary = entry
                .summary
                .map(|s| s.content)
                .or_else(|| entry.content.and_then(|c| c.body));
            let title = entry
                .title
                .map(|t| t.content)
                .unwrap_or_else(|| "Untitled".to_string());

            let existing_id = if entry.id.is_empty() {
                None
            } else {
                Some(entry.id.as_str())
            };
            let id = generate_id(existing_id, link.as_deref(), &title, published);

            Entry {
                id,
                title,
                link,
                published,
                summary,
            }
        })
        .collect();

    Ok(ParsedFeed {
        title: feed.title.map(|t| t.content),
        description: feed.description.map(|d| d.content),
        link: preferred_link(&feed.links),
        entries,
    })
}

/// Prefer the `alternate` link (the human-readable page) over `self` and
/// friends, falling back to whatever comes first.
fn preferred_link(links: &[Link]) -> Option<String> {
    links
        .iter()
        .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
        .or_else(|| links.first())
        .map(|l| l.href.clone())
}

fn generate_id(
    existing: Option<&str>,
    link: Option<&str>,
    title: &str,
    published: Option<DateTime<Utc>>,
) -> String {
    if let Some(id) = existing {
        let trimmed = id.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let input = format!(
        "{}|{}|{}",
        link.unwrap_or(""),
        title,
        published.map(|p| p.timestamp().to_string()).unwrap_or_default()
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}
