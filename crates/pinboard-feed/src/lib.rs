//! Change-feed client: per-table subscriptions over committed row changes.
//!
//! Every subscription is a scoped handle. Dropping it (or calling
//! `ChangeFeed::unsubscribe`) releases the upstream registration, so a
//! surface that is opened and closed repeatedly never accumulates
//! subscriptions.

pub mod feed;

pub use feed::{ChangeFeed, FeedMessage, Subscription};
