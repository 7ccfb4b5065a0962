use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use super::template::{self, RenderError};
use crate::feed::{FeedCollection, FeedMetadata, FetchError, FetchResults};

/// Structured notice about a failed fetch, meant for operators only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperatorReport {
    pub source_url: String,
    pub error_kind: String,
    /// The error and every error in its source chain, one per line
    pub trace_text: String,
}

impl OperatorReport {
    pub fn from_fetch_error(url: &str, err: &FetchError) -> Self {
        Self {
            source_url: url.to_string(),
            error_kind: err.kind().to_string(),
            trace_text: error_chain(err),
        }
    }
}

impl fmt::Display for OperatorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Fetching {} failed ({}):\n{}",
            self.source_url, self.error_kind, self.trace_text
        )
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut lines = vec![err.to_string()];
    let mut source = err.source();
    while let Some(cause) = source {
        lines.push(format!("caused by: {cause}"));
        source = cause.source();
    }
    lines.join("\n")
}

/// Rendered entries per feed URL plus the reports owed to operators.
#[derive(Debug, Default)]
pub struct FormattedFeeds {
    /// Rendered lines in chronological order; feeds with nothing to say are absent
    pub messages: BTreeMap<String, Vec<String>>,
    pub reports: Vec<OperatorReport>,
}

pub fn unavailable_notice(url: &str) -> String {
    format!("{url} is temporarily unavailable.")
}

pub fn invalid_template_notice(url: &str) -> String {
    format!("the template for {url} is invalid and could not be processed.")
}

/// Render a collection's fetch results with per-feed or default templates.
///
/// A template failure replaces that feed's output with a single notice; a
/// fetch failure becomes a single user-facing notice plus an
/// [`OperatorReport`]. Neither affects other feeds.
pub fn format_feeds(
    results: FetchResults,
    collection: &FeedCollection,
    templates: &BTreeMap<String, String>,
    default_template: &str,
) -> FormattedFeeds {
    let mut formatted = FormattedFeeds::default();

    for (url, result) in results {
        let lines = match result {
            Ok(mut entries) => {
                if entries.is_empty() {
                    continue;
                }
                // Stable, so equal timestamps keep source order
                entries.sort_by_key(|e| e.published);

                let metadata = metadata_for(collection, &url);
                let template = templates
                    .get(&url)
                    .map(String::as_str)
                    .unwrap_or(default_template);
                let rendered: Result<Vec<String>, RenderError> = entries
                    .iter()
                    .map(|entry| template::render(template, entry, &metadata))
                    .collect();
                match rendered {
                    Ok(lines) => lines,
                    Err(e) => {
                        tracing::warn!(feed = %url, error = %e, "Template could not be rendered");
                        vec![invalid_template_notice(&url)]
                    }
                }
            }
            Err(e) => {
                formatted
                    .reports
                    .push(OperatorReport::from_fetch_error(&url, &e));
                vec![unavailable_notice(&url)]
            }
        };
        formatted.messages.insert(url, lines);
    }

    formatted
}

fn metadata_for(collection: &FeedCollection, url: &str) -> FeedMetadata {
    collection
        .get(url)
        .map(|feed| feed.metadata().clone())
        .unwrap_or_else(|| FeedMetadata::placeholder(url))
}

/// One message per entry, feed by feed, oldest first.
pub fn asap_messages(formatted: &FormattedFeeds) -> Vec<String> {
    formatted.messages.values().flatten().cloned().collect()
}

/// One message per feed: a header followed by all of its lines.
pub fn digest_messages(
    formatted: &FormattedFeeds,
    collection: &FeedCollection,
    header_template: &str,
) -> Vec<String> {
    formatted
        .messages
        .iter()
        .map(|(url, lines)| {
            let metadata = metadata_for(collection, url);
            let header = template::render_header(header_template, &metadata)
                .unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "Digest header template failed, using plain title");
                    metadata.title.clone()
                });
            format!("{}\n{}", header, lines.join("\n"))
        })
        .collect()
}
