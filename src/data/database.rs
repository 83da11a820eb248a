//! SQLite database operations
//!
//! All persistence goes through this module. Multi-row writes run inside
//! `BEGIN IMMEDIATE` on a single pooled connection so a failure leaves
//! nothing half-written.

use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite, SqliteConnection, SqlitePool};
use std::collections::BTreeSet;
use std::path::Path;

use super::models::*;
use crate::error::AppError;

/// Separator between queued payloads in `delivery_jobs.messages`.
const MESSAGE_SEPARATOR: u8 = 0;

pub(crate) fn join_messages(messages: &[Vec<u8>]) -> Vec<u8> {
    messages.join(&MESSAGE_SEPARATOR)
}

pub(crate) fn split_messages(blob: &[u8]) -> Vec<Vec<u8>> {
    if blob.is_empty() {
        return Vec::new();
    }
    blob.split(|byte| *byte == MESSAGE_SEPARATOR)
        .map(<[u8]>::to_vec)
        .collect()
}

type JobRow = (String, String, String, Vec<u8>, i64, i64);

fn job_from_row((id, owner_user_id, recipient, messages, tries, not_before): JobRow) -> DeliveryJob {
    DeliveryJob {
        id,
        owner_user_id,
        recipient: RecipientKey::parse(&recipient),
        messages: split_messages(&messages),
        tries: tries.max(0) as u32,
        not_before: millis_to_datetime(not_before),
    }
}

const POST_COLUMNS: &str = "id, owner_user_id, kind, object_uri, actor_uri, original_actor_uri, \
    reply_to_uri, quote_uri, conversation_id, published_at, received_at, origin_host, \
    summary_html, body_html, audience, is_public, hashtags, mentions, flags";

/// Database connection pool wrapper
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Open (creating if needed) the SQLite file and run migrations.
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!(path = %path.display(), "Database connected and migrated successfully");

        Ok(Self { pool })
    }

    /// Run `work` inside `BEGIN IMMEDIATE`, committing on Ok and rolling back on Err.
    async fn in_transaction<T, F>(&self, work: F) -> Result<T, AppError>
    where
        F: for<'c> FnOnce(
            &'c mut SqliteConnection,
        )
            -> futures::future::BoxFuture<'c, Result<T, AppError>>,
    {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result = work(&mut *conn).await;

        match result {
            Ok(value) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(value)
            }
            Err(error) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(error)
            }
        }
    }

    // =========================================================================
    // Users
    // =========================================================================

    pub async fn insert_user(&self, user: &LocalUser) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO users (id, username, display_name, url, private_key_pem, public_key_pem, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&user.id)
        .bind(&user.username)
        .bind(&user.display_name)
        .bind(&user.url)
        .bind(&user.private_key_pem)
        .bind(&user.public_key_pem)
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<LocalUser>, AppError> {
        let user = sqlx::query_as::<_, LocalUser>("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<LocalUser>, AppError> {
        let user = sqlx::query_as::<_, LocalUser>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    // =========================================================================
    // Posts
    // =========================================================================

    async fn hydrate(&self, rows: Vec<PostRow>) -> Result<Vec<Post>, AppError> {
        let mut posts = Vec::with_capacity(rows.len());
        for row in rows {
            let mut post = Post::try_from(row)?;
            post.attachments = sqlx::query_as::<_, Attachment>(
                "SELECT * FROM attachments WHERE post_id = ? ORDER BY position",
            )
            .bind(&post.id)
            .fetch_all(&self.pool)
            .await?;
            posts.push(post);
        }
        Ok(posts)
    }

    async fn hydrate_one(&self, row: Option<PostRow>) -> Result<Option<Post>, AppError> {
        match row {
            Some(row) => Ok(self.hydrate(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    /// Look up an owner's post by object URI.
    pub async fn find_post_by_uri(
        &self,
        owner_user_id: &str,
        object_uri: &str,
    ) -> Result<Option<Post>, AppError> {
        let row = sqlx::query_as::<_, PostRow>(&format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE owner_user_id = ? AND object_uri = ?"
        ))
        .bind(owner_user_id)
        .bind(object_uri)
        .fetch_optional(&self.pool)
        .await?;
        self.hydrate_one(row).await
    }

    pub async fn post_exists(&self, owner_user_id: &str, object_uri: &str) -> Result<bool, AppError> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM posts WHERE owner_user_id = ? AND object_uri = ?")
                .bind(owner_user_id)
                .bind(object_uri)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    /// Direct lookup by local id. Read-time filters do not apply here.
    pub async fn get_post(&self, owner_user_id: &str, id: &str) -> Result<Option<Post>, AppError> {
        let row = sqlx::query_as::<_, PostRow>(&format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE owner_user_id = ? AND id = ?"
        ))
        .bind(owner_user_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        self.hydrate_one(row).await
    }

    /// Insert a post and its attachments atomically.
    ///
    /// Returns `false` without writing anything when the owner already has
    /// a post with the same object URI.
    pub async fn insert_post(&self, post: &Post) -> Result<bool, AppError> {
        let post = post.clone();
        let audience = serde_json::to_string(&post.audience).map_err(anyhow::Error::from)?;
        let hashtags = serde_json::to_string(&post.hashtags).map_err(anyhow::Error::from)?;
        let mentions = serde_json::to_string(&post.mentions).map_err(anyhow::Error::from)?;

        self.in_transaction(move |conn| {
            Box::pin(async move {
                let inserted = sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO posts (
                        id, owner_user_id, kind, object_uri, actor_uri, original_actor_uri,
                        reply_to_uri, quote_uri, conversation_id, published_at, received_at,
                        origin_host, summary_html, body_html, audience, is_public,
                        hashtags, mentions, flags
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&post.id)
                .bind(&post.owner_user_id)
                .bind(post.kind.as_str())
                .bind(&post.object_uri)
                .bind(&post.actor_uri)
                .bind(&post.original_actor_uri)
                .bind(&post.reply_to_uri)
                .bind(&post.quote_uri)
                .bind(&post.conversation_id)
                .bind(post.published_at)
                .bind(post.received_at.timestamp_millis())
                .bind(&post.origin_host)
                .bind(&post.summary_html)
                .bind(&post.body_html)
                .bind(&audience)
                .bind(post.is_public)
                .bind(&hashtags)
                .bind(&mentions)
                .bind(post.flags.0 as i64)
                .execute(&mut *conn)
                .await?;

                if inserted.rows_affected() == 0 {
                    return Ok(false);
                }

                for attachment in &post.attachments {
                    sqlx::query(
                        r#"
                        INSERT INTO attachments (id, post_id, position, url, media_type, name, description, file_hash)
                        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                        "#,
                    )
                    .bind(&attachment.id)
                    .bind(&post.id)
                    .bind(attachment.position)
                    .bind(&attachment.url)
                    .bind(&attachment.media_type)
                    .bind(&attachment.name)
                    .bind(&attachment.description)
                    .bind(&attachment.file_hash)
                    .execute(&mut *conn)
                    .await?;
                }

                Ok(true)
            })
        })
        .await
    }

    /// Replace summary/body, archiving the previous revision.
    pub async fn update_post_content(
        &self,
        post_id: &str,
        summary_html: &str,
        body_html: &str,
    ) -> Result<bool, AppError> {
        let post_id = post_id.to_string();
        let summary_html = summary_html.to_string();
        let body_html = body_html.to_string();

        self.in_transaction(move |conn| {
            Box::pin(async move {
                let previous = sqlx::query_as::<_, (String, String)>(
                    "SELECT summary_html, body_html FROM posts WHERE id = ?",
                )
                .bind(&post_id)
                .fetch_optional(&mut *conn)
                .await?;

                let Some((old_summary, old_body)) = previous else {
                    return Ok(false);
                };

                sqlx::query(
                    r#"
                    INSERT INTO post_revisions (id, post_id, summary_html, body_html, archived_at)
                    VALUES (?, ?, ?, ?, ?)
                    "#,
                )
                .bind(EntityId::new().0)
                .bind(&post_id)
                .bind(&old_summary)
                .bind(&old_body)
                .bind(Utc::now())
                .execute(&mut *conn)
                .await?;

                sqlx::query("UPDATE posts SET summary_html = ?, body_html = ? WHERE id = ?")
                    .bind(&summary_html)
                    .bind(&body_html)
                    .bind(&post_id)
                    .execute(&mut *conn)
                    .await?;

                Ok(true)
            })
        })
        .await
    }

    pub async fn list_post_revisions(&self, post_id: &str) -> Result<Vec<PostRevision>, AppError> {
        let revisions = sqlx::query_as::<_, PostRevision>(
            "SELECT * FROM post_revisions WHERE post_id = ? ORDER BY archived_at",
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(revisions)
    }

    /// Delete an owner's post by URI and record a tombstone.
    ///
    /// Idempotent: deleting an absent URI still records the tombstone once
    /// and returns `false`.
    pub async fn delete_post_by_uri(
        &self,
        owner_user_id: &str,
        object_uri: &str,
    ) -> Result<bool, AppError> {
        let owner_user_id = owner_user_id.to_string();
        let object_uri = object_uri.to_string();

        self.in_transaction(move |conn| {
            Box::pin(async move {
                let deleted = sqlx::query("DELETE FROM posts WHERE owner_user_id = ? AND object_uri = ?")
                    .bind(&owner_user_id)
                    .bind(&object_uri)
                    .execute(&mut *conn)
                    .await?;

                sqlx::query(
                    "INSERT OR IGNORE INTO tombstones (owner_user_id, object_uri, created_at) VALUES (?, ?, ?)",
                )
                .bind(&owner_user_id)
                .bind(&object_uri)
                .bind(Utc::now())
                .execute(&mut *conn)
                .await?;

                Ok(deleted.rows_affected() > 0)
            })
        })
        .await
    }

    pub async fn is_tombstoned(&self, owner_user_id: &str, object_uri: &str) -> Result<bool, AppError> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM tombstones WHERE owner_user_id = ? AND object_uri = ?",
        )
        .bind(owner_user_id)
        .bind(object_uri)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    pub async fn count_tombstones(&self, owner_user_id: &str) -> Result<i64, AppError> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM tombstones WHERE owner_user_id = ?")
            .bind(owner_user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Newest posts of an owner.
    pub async fn list_posts(&self, owner_user_id: &str, limit: i64) -> Result<Vec<Post>, AppError> {
        let rows = sqlx::query_as::<_, PostRow>(&format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE owner_user_id = ? \
             ORDER BY received_at DESC, id DESC LIMIT ?"
        ))
        .bind(owner_user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        self.hydrate(rows).await
    }

    /// Newest public posts received after `since`.
    pub async fn list_public_posts_since(
        &self,
        owner_user_id: &str,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Post>, AppError> {
        let rows = sqlx::query_as::<_, PostRow>(&format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE owner_user_id = ? AND is_public = 1 \
             AND received_at >= ? ORDER BY received_at DESC, id DESC LIMIT ?"
        ))
        .bind(owner_user_id)
        .bind(since.timestamp_millis())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        self.hydrate(rows).await
    }

    /// Newest public posts written by `actor_uri`, deletes excluded.
    pub async fn list_public_posts_by_actor(
        &self,
        owner_user_id: &str,
        actor_uri: &str,
        limit: i64,
    ) -> Result<Vec<Post>, AppError> {
        let rows = sqlx::query_as::<_, PostRow>(&format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE owner_user_id = ? AND actor_uri = ? \
             AND is_public = 1 AND kind != 'delete' ORDER BY received_at DESC, id DESC LIMIT ?"
        ))
        .bind(owner_user_id)
        .bind(actor_uri)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        self.hydrate(rows).await
    }

    pub async fn count_posts(&self, owner_user_id: &str) -> Result<i64, AppError> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM posts WHERE owner_user_id = ?")
            .bind(owner_user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // =========================================================================
    // Mirrored files
    // =========================================================================

    /// Hash of an already-mirrored copy of `url`, if any.
    pub async fn find_file_hash_by_url(&self, url: &str) -> Result<Option<String>, AppError> {
        let hash = sqlx::query_scalar(
            "SELECT file_hash FROM attachments WHERE url = ? AND file_hash IS NOT NULL LIMIT 1",
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(hash)
    }

    /// Store file content under its hash. Existing content is kept.
    pub async fn save_file(&self, hash: &str, media_type: &str, content: &[u8]) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO files (hash, media_type, content, size, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(hash)
        .bind(media_type)
        .bind(content)
        .bind(content.len() as i64)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_file(&self, hash: &str) -> Result<Option<(String, Vec<u8>)>, AppError> {
        let file = sqlx::query_as::<_, (String, Vec<u8>)>(
            "SELECT media_type, content FROM files WHERE hash = ?",
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(file)
    }

    pub async fn count_files(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM files")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // =========================================================================
    // Delivery jobs
    // =========================================================================

    /// Append a payload to an existing job for `(owner, recipient)`.
    ///
    /// Returns `false` when no such job exists.
    pub async fn append_to_delivery_job(
        &self,
        owner_user_id: &str,
        recipient: &RecipientKey,
        message: &[u8],
    ) -> Result<bool, AppError> {
        let owner_user_id = owner_user_id.to_string();
        let recipient = recipient.as_str().to_string();
        let message = message.to_vec();

        self.in_transaction(move |conn| {
            Box::pin(async move { append_in_tx(conn, &owner_user_id, &recipient, &message).await })
        })
        .await
    }

    /// Append to the existing job, or create a new one due at `not_before`.
    pub async fn enqueue_delivery(
        &self,
        owner_user_id: &str,
        recipient: &RecipientKey,
        message: &[u8],
        not_before: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, AppError> {
        let owner_user_id = owner_user_id.to_string();
        let recipient = recipient.as_str().to_string();
        let message = message.to_vec();

        self.in_transaction(move |conn| {
            Box::pin(async move {
                if append_in_tx(conn, &owner_user_id, &recipient, &message).await? {
                    return Ok(EnqueueOutcome::Coalesced);
                }

                sqlx::query(
                    r#"
                    INSERT INTO delivery_jobs (id, owner_user_id, recipient, messages, tries, not_before, created_at)
                    VALUES (?, ?, ?, ?, 0, ?, ?)
                    "#,
                )
                .bind(EntityId::new().0)
                .bind(&owner_user_id)
                .bind(&recipient)
                .bind(&message)
                .bind(not_before.timestamp_millis())
                .bind(Utc::now())
                .execute(&mut *conn)
                .await?;

                Ok(EnqueueOutcome::Created)
            })
        })
        .await
    }

    pub async fn get_delivery_job(
        &self,
        owner_user_id: &str,
        recipient: &RecipientKey,
    ) -> Result<Option<DeliveryJob>, AppError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, owner_user_id, recipient, messages, tries, not_before
            FROM delivery_jobs WHERE owner_user_id = ? AND recipient = ?
            "#,
        )
        .bind(owner_user_id)
        .bind(recipient.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(job_from_row))
    }

    /// Jobs whose `not_before` has passed, oldest first.
    pub async fn list_due_delivery_jobs(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DeliveryJob>, AppError> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, owner_user_id, recipient, messages, tries, not_before
            FROM delivery_jobs WHERE not_before <= ? ORDER BY not_before LIMIT ?
            "#,
        )
        .bind(now.timestamp_millis())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(job_from_row).collect())
    }

    pub async fn next_delivery_due(&self) -> Result<Option<DateTime<Utc>>, AppError> {
        let next: Option<i64> = sqlx::query_scalar("SELECT MIN(not_before) FROM delivery_jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(next.map(millis_to_datetime))
    }

    pub async fn count_delivery_jobs(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM delivery_jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Settle a job after flushing its first `flushed` messages.
    ///
    /// `requeue` holds the undelivered tail of those messages. Anything that
    /// was appended to the row while the flush ran is kept behind it. The row
    /// is deleted once nothing is left, otherwise rescheduled with `tries` and
    /// `not_before`. Returns whether the row still exists.
    pub async fn settle_delivery_job(
        &self,
        job_id: &str,
        flushed: usize,
        requeue: Vec<Vec<u8>>,
        tries: u32,
        not_before: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let job_id = job_id.to_string();

        self.in_transaction(move |conn| {
            Box::pin(async move {
                let current: Option<Vec<u8>> =
                    sqlx::query_scalar("SELECT messages FROM delivery_jobs WHERE id = ?")
                        .bind(&job_id)
                        .fetch_optional(&mut *conn)
                        .await?;

                let Some(current) = current else {
                    return Ok(false);
                };

                let mut late = split_messages(&current);
                let late = late.split_off(flushed.min(late.len()));
                let mut remaining = requeue;
                remaining.extend(late);

                if remaining.is_empty() {
                    sqlx::query("DELETE FROM delivery_jobs WHERE id = ?")
                        .bind(&job_id)
                        .execute(&mut *conn)
                        .await?;
                    return Ok(false);
                }

                sqlx::query("UPDATE delivery_jobs SET messages = ?, tries = ?, not_before = ? WHERE id = ?")
                    .bind(join_messages(&remaining))
                    .bind(tries as i64)
                    .bind(not_before.timestamp_millis())
                    .bind(&job_id)
                    .execute(&mut *conn)
                    .await?;

                Ok(true)
            })
        })
        .await
    }

    pub async fn delete_delivery_job(&self, job_id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM delivery_jobs WHERE id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Filters
    // =========================================================================

    pub async fn list_filters(&self, owner_user_id: &str) -> Result<Vec<Filter>, AppError> {
        let bodies = sqlx::query_scalar::<_, String>(
            "SELECT body FROM filters WHERE owner_user_id = ? ORDER BY created_at, id",
        )
        .bind(owner_user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut filters = Vec::with_capacity(bodies.len());
        for body in bodies {
            match serde_json::from_str::<Filter>(&body) {
                Ok(filter) => filters.push(filter),
                Err(error) => {
                    tracing::warn!(owner = %owner_user_id, %error, "Skipping unreadable filter");
                }
            }
        }
        Ok(filters)
    }

    /// Insert or replace a filter by id.
    pub async fn save_filter(&self, filter: &Filter) -> Result<(), AppError> {
        let body = serde_json::to_string(filter).map_err(anyhow::Error::from)?;
        sqlx::query(
            r#"
            INSERT INTO filters (id, owner_user_id, body, created_at) VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET body = excluded.body
            "#,
        )
        .bind(&filter.id)
        .bind(&filter.owner_user_id)
        .bind(&body)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_filter(&self, owner_user_id: &str, filter_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM filters WHERE owner_user_id = ? AND id = ?")
            .bind(owner_user_id)
            .bind(filter_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Remote facts
    // =========================================================================

    pub async fn get_fact(&self, name: &str, flavor: FactFlavor) -> Result<Option<RemoteFact>, AppError> {
        let row = sqlx::query_as::<_, (String, i64)>(
            "SELECT info, updated_at FROM remote_facts WHERE name = ? AND flavor = ?",
        )
        .bind(name)
        .bind(flavor.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(info, updated_at)| RemoteFact {
            name: name.to_string(),
            flavor,
            info,
            updated_at: millis_to_datetime(updated_at),
        }))
    }

    pub async fn save_fact(&self, name: &str, flavor: FactFlavor, info: &str) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO remote_facts (name, flavor, info, updated_at) VALUES (?, ?, ?, ?)
            ON CONFLICT(name, flavor) DO UPDATE SET info = excluded.info, updated_at = excluded.updated_at
            "#,
        )
        .bind(name)
        .bind(flavor.as_str())
        .bind(info)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_fact(&self, name: &str, flavor: FactFlavor) -> Result<(), AppError> {
        sqlx::query("DELETE FROM remote_facts WHERE name = ? AND flavor = ?")
            .bind(name)
            .bind(flavor.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drop facts of `flavor` last written before `older_than`.
    pub async fn prune_facts(
        &self,
        flavor: FactFlavor,
        older_than: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM remote_facts WHERE flavor = ? AND updated_at < ?")
            .bind(flavor.as_str())
            .bind(older_than.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Subscribers and follows
    // =========================================================================

    pub async fn add_subscriber(&self, owner_user_id: &str, actor_uri: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO subscribers (owner_user_id, actor_uri, created_at) VALUES (?, ?, ?)",
        )
        .bind(owner_user_id)
        .bind(actor_uri)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn remove_subscriber(&self, owner_user_id: &str, actor_uri: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM subscribers WHERE owner_user_id = ? AND actor_uri = ?")
            .bind(owner_user_id)
            .bind(actor_uri)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_subscribers(&self, owner_user_id: &str) -> Result<Vec<String>, AppError> {
        let subscribers = sqlx::query_scalar(
            "SELECT actor_uri FROM subscribers WHERE owner_user_id = ? ORDER BY created_at, actor_uri",
        )
        .bind(owner_user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(subscribers)
    }

    pub async fn add_follow(&self, owner_user_id: &str, actor_uri: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO follows (owner_user_id, actor_uri, created_at) VALUES (?, ?, ?)",
        )
        .bind(owner_user_id)
        .bind(actor_uri)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Every `(owner, followed actor)` pair, for the harvest sweep.
    pub async fn list_follows(&self) -> Result<Vec<(String, String)>, AppError> {
        let follows = sqlx::query_as::<_, (String, String)>(
            "SELECT owner_user_id, actor_uri FROM follows ORDER BY owner_user_id, actor_uri",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(follows)
    }

    // =========================================================================
    // Backtracks
    // =========================================================================

    /// Merge fetcher records into `tracks` in one transaction.
    pub async fn record_tracks(&self, records: Vec<(String, String)>) -> Result<(), AppError> {
        if records.is_empty() {
            return Ok(());
        }

        self.in_transaction(move |conn| {
            Box::pin(async move {
                for (object_uri, fetcher) in &records {
                    let existing: Option<String> =
                        sqlx::query_scalar("SELECT fetchers FROM tracks WHERE object_uri = ?")
                            .bind(object_uri)
                            .fetch_optional(&mut *conn)
                            .await?;

                    let mut fetchers: BTreeSet<String> = existing
                        .as_deref()
                        .unwrap_or_default()
                        .split_whitespace()
                        .map(str::to_string)
                        .collect();
                    if !fetchers.insert(fetcher.clone()) {
                        continue;
                    }
                    let joined = fetchers.into_iter().collect::<Vec<_>>().join(" ");

                    sqlx::query(
                        r#"
                        INSERT INTO tracks (object_uri, fetchers) VALUES (?, ?)
                        ON CONFLICT(object_uri) DO UPDATE SET fetchers = excluded.fetchers
                        "#,
                    )
                    .bind(object_uri)
                    .bind(&joined)
                    .execute(&mut *conn)
                    .await?;
                }
                Ok(())
            })
        })
        .await
    }

    pub async fn get_tracks(&self, object_uri: &str) -> Result<Vec<String>, AppError> {
        let fetchers: Option<String> =
            sqlx::query_scalar("SELECT fetchers FROM tracks WHERE object_uri = ?")
                .bind(object_uri)
                .fetch_optional(&self.pool)
                .await?;
        Ok(fetchers
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect())
    }
}

async fn append_in_tx(
    conn: &mut SqliteConnection,
    owner_user_id: &str,
    recipient: &str,
    message: &[u8],
) -> Result<bool, AppError> {
    let existing = sqlx::query_as::<_, (String, Vec<u8>)>(
        "SELECT id, messages FROM delivery_jobs WHERE owner_user_id = ? AND recipient = ?",
    )
    .bind(owner_user_id)
    .bind(recipient)
    .fetch_optional(&mut *conn)
    .await?;

    let Some((job_id, blob)) = existing else {
        return Ok(false);
    };

    let mut messages = split_messages(&blob);
    messages.push(message.to_vec());

    sqlx::query("UPDATE delivery_jobs SET messages = ? WHERE id = ?")
        .bind(join_messages(&messages))
        .bind(&job_id)
        .execute(&mut *conn)
        .await?;

    Ok(true)
}
