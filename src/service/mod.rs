//! Service layer
//!
//! Reads and local actions built on top of the store and the federation
//! engine, kept out of the HTTP handlers.

mod feed;
mod follow;

pub use feed::{FeedService, MAX_FEED_LIMIT};
pub use follow::FollowService;
