//! Feed service
//!
//! Post listings for a local user with read-time filters applied.

use chrono::Utc;
use std::sync::Arc;

use crate::data::{Database, Post};
use crate::error::AppError;
use crate::federation::FilterEngine;

/// Largest page a caller may ask for.
pub const MAX_FEED_LIMIT: usize = 200;

pub struct FeedService {
    db: Arc<Database>,
    filters: Arc<FilterEngine>,
    retention: chrono::Duration,
}

impl FeedService {
    /// # Arguments
    /// * `retention_days` - How far back the public feed reaches
    pub fn new(db: Arc<Database>, filters: Arc<FilterEngine>, retention_days: i64) -> Self {
        Self {
            db,
            filters,
            retention: chrono::Duration::days(retention_days),
        }
    }

    /// Public posts received within the retention window, newest first.
    pub async fn public_feed(&self, user_id: &str, limit: usize) -> Result<Vec<Post>, AppError> {
        let since = Utc::now() - self.retention;
        let posts = self
            .db
            .list_public_posts_since(user_id, since, clamp(limit))
            .await?;
        self.apply_filters(user_id, posts).await
    }

    /// Every post of the user, newest first.
    pub async fn home_feed(&self, user_id: &str, limit: usize) -> Result<Vec<Post>, AppError> {
        let posts = self.db.list_posts(user_id, clamp(limit)).await?;
        self.apply_filters(user_id, posts).await
    }

    /// Direct lookup. Hide filters do not apply; collapse and rewrite do.
    pub async fn get_post(&self, user_id: &str, post_id: &str) -> Result<Post, AppError> {
        let post = self
            .db
            .get_post(user_id, post_id)
            .await?
            .ok_or(AppError::NotFound)?;

        let hidden = post.clone();
        Ok(self
            .filters
            .apply_read_time(user_id, post)
            .await?
            .unwrap_or(hidden))
    }

    async fn apply_filters(&self, user_id: &str, posts: Vec<Post>) -> Result<Vec<Post>, AppError> {
        let mut visible = Vec::with_capacity(posts.len());
        for post in posts {
            if let Some(post) = self.filters.apply_read_time(user_id, post).await? {
                visible.push(post);
            }
        }
        Ok(visible)
    }
}

fn clamp(limit: usize) -> i64 {
    limit.clamp(1, MAX_FEED_LIMIT) as i64
}
