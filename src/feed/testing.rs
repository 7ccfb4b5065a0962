//! Scripted [`Transport`] for unit tests.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use super::transport::{FetchError, FetchOutcome, FetchResponse, Transport, Validators};

/// Build an RSS document titled "Mock feed" with `(guid, unix time)` items.
pub(crate) fn rss(items: &[(&str, i64)]) -> String {
    let items: String = items
        .iter()
        .map(|(id, ts)| {
            let date = Utc.timestamp_opt(*ts, 0).unwrap().to_rfc2822();
            format!(
                "<item><guid>{id}</guid><title>{id}</title>\
                 <link>https://example.com/{id}</link><pubDate>{date}</pubDate></item>"
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Mock feed</title><link>https://example.com/</link>{items}</channel></rss>"#
    )
}

/// Responses are queued per URL and handed out in order; a URL with an
/// empty queue answers with a network-style timeout.
#[derive(Default)]
pub(crate) struct MockTransport {
    queue: Mutex<HashMap<String, VecDeque<Result<FetchResponse, FetchError>>>>,
    calls: Mutex<Vec<(String, Validators)>>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn push(&self, url: &str, response: Result<FetchResponse, FetchError>) {
        self.queue
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(response);
    }

    pub(crate) fn push_body(&self, url: &str, body: String) {
        self.push(
            url,
            Ok(FetchResponse {
                outcome: FetchOutcome::Fetched(body.into_bytes()),
                validators: Validators::default(),
                permanent_redirect: None,
            }),
        );
    }

    pub(crate) fn push_body_with_etag(&self, url: &str, body: String, etag: &str) {
        self.push(
            url,
            Ok(FetchResponse {
                outcome: FetchOutcome::Fetched(body.into_bytes()),
                validators: Validators {
                    etag: Some(etag.to_string()),
                    last_modified: None,
                },
                permanent_redirect: None,
            }),
        );
    }

    pub(crate) fn push_redirect(&self, url: &str, target: &str, body: String) {
        self.push(
            url,
            Ok(FetchResponse {
                outcome: FetchOutcome::Fetched(body.into_bytes()),
                validators: Validators::default(),
                permanent_redirect: Some(target.to_string()),
            }),
        );
    }

    pub(crate) fn push_not_modified(&self, url: &str) {
        self.push(
            url,
            Ok(FetchResponse {
                outcome: FetchOutcome::NotModified,
                validators: Validators::default(),
                permanent_redirect: None,
            }),
        );
    }

    pub(crate) fn push_gone(&self, url: &str) {
        self.push(
            url,
            Ok(FetchResponse {
                outcome: FetchOutcome::Gone,
                validators: Validators::default(),
                permanent_redirect: None,
            }),
        );
    }

    pub(crate) fn push_error(&self, url: &str, error: FetchError) {
        self.push(url, Err(error));
    }

    /// URLs requested so far, in call order.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(url, _)| url.clone())
            .collect()
    }

    pub(crate) fn validators_sent(&self) -> Vec<Validators> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, v)| v.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn fetch(
        &self,
        url: &str,
        validators: &Validators,
    ) -> Result<FetchResponse, FetchError> {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), validators.clone()));
        self.queue
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Err(FetchError::Timeout))
    }
}
