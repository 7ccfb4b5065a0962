use std::net::IpAddr;
use thiserror::Error;
use url::{Host, Url};

/// Reasons a feed address is refused at subscription time.
///
/// Besides malformed input these block addresses that would make the poller
/// reach into the host's own network.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FeedUrlError {
    #[error("Invalid URL: {0}")]
    Malformed(#[from] url::ParseError),
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    #[error("URL has no host")]
    MissingHost,
    #[error("URLs with embedded credentials are not accepted")]
    Credentials,
    #[error("Localhost not allowed")]
    Localhost,
    #[error("Private IP address not allowed: {0}")]
    PrivateIp(IpAddr),
}

/// Check a user-supplied feed address and return it trimmed.
///
/// The address is returned as typed rather than normalized, because it
/// becomes the key the user later removes the feed by.
///
/// # Errors
///
/// Rejects unparseable input, schemes other than `http`/`https`, missing
/// hosts, `user:pass@` credentials, localhost and private or link-local IPs.
pub fn validate_feed_url(input: &str) -> Result<String, FeedUrlError> {
    let trimmed = input.trim();
    let url = Url::parse(trimmed)?;
    check_public_url(&url)?;
    Ok(trimmed.to_string())
}

/// The address checks of [`validate_feed_url`] for an already parsed URL.
///
/// Redirect targets go through this before they are requested.
pub fn check_public_url(url: &Url) -> Result<(), FeedUrlError> {
    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(FeedUrlError::UnsupportedScheme(scheme.to_owned())),
    }

    if !url.username().is_empty() || url.password().is_some() {
        return Err(FeedUrlError::Credentials);
    }

    let ip = match url.host() {
        None => return Err(FeedUrlError::MissingHost),
        Some(Host::Domain(domain)) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            if domain == "localhost" || domain.ends_with(".localhost") {
                return Err(FeedUrlError::Localhost);
            }
            None
        }
        Some(Host::Ipv4(v4)) => Some(IpAddr::V4(v4)),
        Some(Host::Ipv6(v6)) => Some(IpAddr::V6(v6)),
    };

    if let Some(ip) = ip {
        if ip.is_loopback() {
            return Err(FeedUrlError::Localhost);
        }
        if is_internal(&ip) {
            return Err(FeedUrlError::PrivateIp(ip));
        }
    }

    Ok(())
}

fn is_internal(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_link_local() || v4.is_unspecified(),
        IpAddr::V6(v6) => {
            if v6.is_unspecified() {
                return true;
            }
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return mapped.is_loopback() || is_internal(&IpAddr::V4(mapped));
            }
            let first = v6.segments()[0];
            // fc00::/7 unique local, fe80::/10 link-local
            (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}
