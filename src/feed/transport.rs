use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{self, HeaderMap};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::util::check_public_url;

const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB
const MAX_REDIRECTS: usize = 5;

/// Errors that can occur while fetching a single feed.
///
/// Every variant is recoverable: the owning [`Feed`](super::Feed) pauses
/// itself and the error is handed back as data to the caller.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with a status the poller has no handling for
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the client timeout
    #[error("Request timed out")]
    Timeout,
    /// Feed body could not be parsed as RSS, Atom or JSON Feed
    #[error("Parse error: {0}")]
    Parse(#[from] feed_rs::parser::ParseFeedError),
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    /// Redirect chain longer than the client is willing to follow
    #[error("Too many redirects (max {0})")]
    TooManyRedirects(usize),
    /// 3xx response whose Location header is missing, unusable, or moves
    /// the feed onto a host that fails the public-address checks
    #[error("Redirect without a usable Location header")]
    BadRedirect,
    /// Entries without a publication time make novelty undecidable
    #[error("{0} entries carry no publication time")]
    MissingTimestamp(usize),
}

impl FetchError {
    /// Short machine-friendly name used in operator reports.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Network(_) => "network",
            FetchError::HttpStatus(_) => "http_status",
            FetchError::Timeout => "timeout",
            FetchError::Parse(_) => "parse",
            FetchError::ResponseTooLarge => "response_too_large",
            FetchError::IncompleteResponse { .. } => "incomplete_response",
            FetchError::TooManyRedirects(_) => "too_many_redirects",
            FetchError::BadRedirect => "bad_redirect",
            FetchError::MissingTimestamp(_) => "missing_timestamp",
        }
    }

    fn from_request(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Network(err)
        }
    }
}

/// Cache validators echoed back to the server for conditional requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validators {
    fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: header::HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            etag: get(header::ETAG),
            last_modified: get(header::LAST_MODIFIED),
        }
    }

    /// Fields missing from `newer` keep their previous value.
    fn merged(&self, newer: Validators) -> Validators {
        Validators {
            etag: newer.etag.or_else(|| self.etag.clone()),
            last_modified: newer.last_modified.or_else(|| self.last_modified.clone()),
        }
    }
}

/// What the server said about the feed document.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Fresh document body
    Fetched(Vec<u8>),
    /// 304: the document did not change since the validators were issued
    NotModified,
    /// 410: the feed is gone for good
    Gone,
}

#[derive(Debug)]
pub struct FetchResponse {
    pub outcome: FetchOutcome,
    /// Validators to send on the next request
    pub validators: Validators,
    /// Set when every hop of the redirect chain was permanent (301/308)
    pub permanent_redirect: Option<String>,
}

/// The feed-fetch primitive the poller is built on.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, url: &str, validators: &Validators)
        -> Result<FetchResponse, FetchError>;
}

/// reqwest-backed [`Transport`].
///
/// Redirects are followed by hand so that permanent moves can be reported
/// back to the feed and remembered.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(
        &self,
        url: &str,
        validators: &Validators,
    ) -> Result<FetchResponse, FetchError> {
        let mut current = url.to_string();
        let mut permanent_redirect = None;
        let mut all_permanent = true;

        for _ in 0..=MAX_REDIRECTS {
            let mut request = self.client.get(&current);
            if let Some(etag) = &validators.etag {
                request = request.header(header::IF_NONE_MATCH, etag);
            }
            if let Some(modified) = &validators.last_modified {
                request = request.header(header::IF_MODIFIED_SINCE, modified);
            }

            let response = request.send().await.map_err(FetchError::from_request)?;
            let status = response.status();

            if status.is_redirection() && status != StatusCode::NOT_MODIFIED {
                let next = redirect_target(&current, response.headers())?;
                all_permanent &= matches!(
                    status,
                    StatusCode::MOVED_PERMANENTLY | StatusCode::PERMANENT_REDIRECT
                );
                tracing::debug!(
                    from = %current,
                    to = %next,
                    status = status.as_u16(),
                    "Following redirect"
                );
                if all_permanent {
                    permanent_redirect = Some(next.clone());
                }
                current = next;
                continue;
            }

            let outcome = match status {
                StatusCode::NOT_MODIFIED => FetchOutcome::NotModified,
                StatusCode::GONE => FetchOutcome::Gone,
                s if s.is_success() => {
                    let fresh = Validators::from_headers(response.headers());
                    let body = read_limited_bytes(response, MAX_FEED_SIZE).await?;
                    return Ok(FetchResponse {
                        outcome: FetchOutcome::Fetched(body),
                        validators: fresh,
                        permanent_redirect,
                    });
                }
                s => return Err(FetchError::HttpStatus(s.as_u16())),
            };

            return Ok(FetchResponse {
                validators: validators.merged(Validators::from_headers(response.headers())),
                outcome,
                permanent_redirect,
            });
        }

        Err(FetchError::TooManyRedirects(MAX_REDIRECTS))
    }
}

/// Resolve the Location of a redirect against the current address.
///
/// A hop to another host must pass the same checks as a subscribed URL, so
/// a public feed cannot steer the poller into the local network.
fn redirect_target(current: &str, headers: &HeaderMap) -> Result<String, FetchError> {
    let location = headers
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(FetchError::BadRedirect)?;
    let base = Url::parse(current).map_err(|_| FetchError::BadRedirect)?;
    let next = base.join(location).map_err(|_| FetchError::BadRedirect)?;

    let same_host = next.host() == base.host() && next.scheme() == base.scheme();
    if !same_host {
        if let Err(e) = check_public_url(&next) {
            tracing::warn!(from = %current, to = %next, reason = %e, "Refusing redirect");
            return Err(FetchError::BadRedirect);
        }
    }
    Ok(next.to_string())
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    if let Some(len) = expected_length {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::from_request)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
