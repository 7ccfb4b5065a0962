//! Turning fetch results into messages.
//!
//! - [`template`] renders `{entry.*}` / `{feed.*}` placeholders
//! - [`format_feeds`] applies templates per feed and collects operator reports
//! - [`asap_messages`] / [`digest_messages`] shape the two delivery modes
//! - [`Messenger`] is the outbound seam

mod format;
mod messenger;
pub mod template;

pub use format::{
    asap_messages, digest_messages, format_feeds, invalid_template_notice, unavailable_notice,
    FormattedFeeds, OperatorReport,
};
#[cfg(test)]
pub(crate) use messenger::testing;
pub use messenger::{DeliveryError, Messenger, StdoutMessenger};
pub use template::RenderError;
