//! Small helpers shared by the library and the command line.
//!
//! - **URL validation**: refuse feed addresses that point into the host's own network

mod url_validator;

pub use url_validator::{check_public_url, validate_feed_url, FeedUrlError};
