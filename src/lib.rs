//! Per-subscriber feed polling and notification.
//!
//! Subscribers keep two lists of RSS/Atom feeds. ASAP feeds are polled every
//! few minutes and each new entry is delivered on its own; digest feeds are
//! polled once a day and delivered as one message per feed.

pub mod config;
pub mod feed;
pub mod notify;
pub mod scheduler;
pub mod storage;
pub mod subscriber;
pub mod util;
