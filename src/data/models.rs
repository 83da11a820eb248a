//! Data models
//!
//! Rust structs representing database entities and cached facts.
//! Surrogate IDs are ULIDs; timestamps use chrono.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

/// The collective address marking a post as public.
pub const PUBLIC_COLLECTION: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Host portion of a URI, lowercased. Empty when the URI has no host.
pub fn origin_of(uri: &str) -> String {
    url::Url::parse(uri)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_ascii_lowercase))
        .unwrap_or_default()
}

pub(crate) fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}

// =============================================================================
// Local users
// =============================================================================

/// A local account that owns posts, filters and delivery jobs.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LocalUser {
    pub id: String,
    pub username: String,
    pub display_name: String,
    /// Actor URI, e.g. `https://example.com/u/alice`
    pub url: String,
    /// RSA private key (PEM format)
    pub private_key_pem: String,
    /// RSA public key (PEM format)
    pub public_key_pem: String,
    pub created_at: DateTime<Utc>,
}

impl LocalUser {
    pub fn key_id(&self) -> String {
        format!("{}#key", self.url)
    }

    pub fn inbox_url(&self) -> String {
        format!("{}/inbox", self.url)
    }

    pub fn outbox_url(&self) -> String {
        format!("{}/outbox", self.url)
    }

    pub fn followers_url(&self) -> String {
        format!("{}/followers", self.url)
    }

    pub fn post_url(&self, post_id: &str) -> String {
        format!("{}/p/{}", self.url, post_id)
    }

    /// Whether `uri` lives under this user's namespace.
    pub fn owns_uri(&self, uri: &str) -> bool {
        uri == self.url
            || uri
                .strip_prefix(self.url.as_str())
                .is_some_and(|rest| rest.starts_with('/') || rest.starts_with('#'))
    }
}

// =============================================================================
// Posts
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostKind {
    Post,
    Reply,
    Boost,
    Delete,
    Poll,
    Event,
}

impl PostKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Post => "post",
            Self::Reply => "reply",
            Self::Boost => "boost",
            Self::Delete => "delete",
            Self::Poll => "poll",
            Self::Event => "event",
        }
    }
}

impl FromStr for PostKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "post" => Ok(Self::Post),
            "reply" => Ok(Self::Reply),
            "boost" => Ok(Self::Boost),
            "delete" => Ok(Self::Delete),
            "poll" => Ok(Self::Poll),
            "event" => Ok(Self::Event),
            other => Err(format!("unknown post kind: {other}")),
        }
    }
}

impl fmt::Display for PostKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-post bitset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostFlags(pub u32);

impl PostFlags {
    pub const ACKED: u32 = 1 << 0;
    pub const BOOSTED: u32 = 1 << 1;
    pub const SAVED: u32 = 1 << 2;
    pub const THREAD_PRUNED: u32 = 1 << 3;
    pub const REACTED: u32 = 1 << 4;
    pub const SYNCED: u32 = 1 << 5;

    pub fn contains(&self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    pub fn insert(&mut self, flag: u32) {
        self.0 |= flag;
    }

    pub fn remove(&mut self, flag: u32) {
        self.0 &= !flag;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mention {
    pub name: String,
    pub href: String,
}

/// A file attached to a post, either mirrored locally or referenced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Attachment {
    pub id: String,
    pub post_id: String,
    pub position: i64,
    pub url: String,
    pub media_type: String,
    pub name: String,
    pub description: String,
    /// Content hash of the mirrored copy in `files`; None for bare references
    pub file_hash: Option<String>,
}

impl Attachment {
    pub fn is_mirrored(&self) -> bool {
        self.file_hash.is_some()
    }
}

/// One federated content item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub owner_user_id: String,
    pub kind: PostKind,
    /// Globally unique object URI
    pub object_uri: String,
    pub actor_uri: String,
    /// Author of the wrapped object for boosts
    pub original_actor_uri: Option<String>,
    pub reply_to_uri: Option<String>,
    pub quote_uri: Option<String>,
    pub conversation_id: String,
    pub published_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub origin_host: String,
    pub summary_html: String,
    pub body_html: String,
    /// First element is the primary recipient
    pub audience: Vec<String>,
    pub is_public: bool,
    pub attachments: Vec<Attachment>,
    pub hashtags: Vec<String>,
    pub mentions: Vec<Mention>,
    pub flags: PostFlags,
}

impl Post {
    pub fn audience_is_public(audience: &[String]) -> bool {
        audience.iter().any(|entry| entry == PUBLIC_COLLECTION)
    }
}

/// Raw `posts` row; JSON columns are decoded in `TryFrom`.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct PostRow {
    pub id: String,
    pub owner_user_id: String,
    pub kind: String,
    pub object_uri: String,
    pub actor_uri: String,
    pub original_actor_uri: Option<String>,
    pub reply_to_uri: Option<String>,
    pub quote_uri: Option<String>,
    pub conversation_id: String,
    pub published_at: DateTime<Utc>,
    pub received_at: i64,
    pub origin_host: String,
    pub summary_html: String,
    pub body_html: String,
    pub audience: String,
    pub is_public: bool,
    pub hashtags: String,
    pub mentions: String,
    pub flags: i64,
}

impl TryFrom<PostRow> for Post {
    type Error = crate::error::AppError;

    fn try_from(row: PostRow) -> Result<Self, Self::Error> {
        let decode = |column: &str, err: serde_json::Error| {
            crate::error::AppError::Internal(anyhow::anyhow!(
                "corrupt posts.{column} for {}: {err}",
                row.id
            ))
        };
        let audience = serde_json::from_str(&row.audience).map_err(|e| decode("audience", e))?;
        let hashtags = serde_json::from_str(&row.hashtags).map_err(|e| decode("hashtags", e))?;
        let mentions = serde_json::from_str(&row.mentions).map_err(|e| decode("mentions", e))?;
        let kind = row
            .kind
            .parse()
            .map_err(|e: String| crate::error::AppError::Internal(anyhow::anyhow!(e)))?;

        Ok(Post {
            id: row.id,
            owner_user_id: row.owner_user_id,
            kind,
            object_uri: row.object_uri,
            actor_uri: row.actor_uri,
            original_actor_uri: row.original_actor_uri,
            reply_to_uri: row.reply_to_uri,
            quote_uri: row.quote_uri,
            conversation_id: row.conversation_id,
            published_at: row.published_at,
            received_at: millis_to_datetime(row.received_at),
            origin_host: row.origin_host,
            summary_html: row.summary_html,
            body_html: row.body_html,
            audience,
            is_public: row.is_public,
            attachments: Vec::new(),
            hashtags,
            mentions,
            flags: PostFlags(row.flags as u32),
        })
    }
}

/// Archived summary/body replaced by an Update.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PostRevision {
    pub id: String,
    pub post_id: String,
    pub summary_html: String,
    pub body_html: String,
    pub archived_at: DateTime<Utc>,
}

// =============================================================================
// Filters
// =============================================================================

/// A user-configured filter rule. Stored as JSON in `filters.body`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Filter {
    pub id: String,
    pub owner_user_id: String,
    pub name: String,

    // Predicates
    /// Actor URI or bare origin host
    pub actor: Option<String>,
    /// Also match the actor predicate against audience members
    pub include_audience: bool,
    /// Word pattern matched against summary, body and attachment descriptions
    pub text: Option<String>,
    /// Only fire on boosts
    pub is_announce: bool,
    /// Origin the boosted post must come from (any origin when unset)
    pub announce_of: Option<String>,

    // Actions
    pub reject: bool,
    pub skip_media: bool,
    pub hide: bool,
    pub collapse: bool,
    /// Pattern replaced in the body at read time
    pub rewrite: Option<String>,
    pub replace: Option<String>,

    pub expires_at: Option<DateTime<Utc>>,
}

impl Filter {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= now)
    }
}

// =============================================================================
// Delivery
// =============================================================================

/// Prefix marking a recipient key as an already-resolved inbox.
pub const INBOX_MARKER: char = '%';

/// Delivery target: an actor URI that still needs box resolution, or a
/// `%`-prefixed inbox URL (usually a shared inbox) that does not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecipientKey(String);

impl RecipientKey {
    pub fn actor(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    pub fn inbox(inbox: &str) -> Self {
        Self(format!("{INBOX_MARKER}{inbox}"))
    }

    pub fn parse(raw: &str) -> Self {
        Self(raw.to_string())
    }

    /// The literal inbox when the key skips box resolution.
    pub fn direct_inbox(&self) -> Option<&str> {
        self.0.strip_prefix(INBOX_MARKER)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecipientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted retry job for one `(owner, recipient)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryJob {
    pub id: String,
    pub owner_user_id: String,
    pub recipient: RecipientKey,
    /// Ordered payloads; stored NUL-joined
    pub messages: Vec<Vec<u8>>,
    pub tries: u32,
    pub not_before: DateTime<Utc>,
}

/// Result of handing a payload to the job store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A fresh job was created
    Created,
    /// The payload was appended to an existing job
    Coalesced,
}

// =============================================================================
// Remote facts
// =============================================================================

/// Flavor tag of a cached fact in `remote_facts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FactFlavor {
    /// `"inbox outbox shared"` for an actor
    Boxes,
    /// Key owner and PEM for a key id
    PubKey,
    /// Actor URI for a `user@host` handle
    Handle,
}

impl FactFlavor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Boxes => "boxes",
            Self::PubKey => "pubkey",
            Self::Handle => "handle",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFact {
    pub name: String,
    pub flavor: FactFlavor,
    pub info: String,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owns_uri_requires_path_boundary() {
        let user = LocalUser {
            id: EntityId::new().0,
            username: "alice".to_string(),
            display_name: "Alice".to_string(),
            url: "https://a.example/u/alice".to_string(),
            private_key_pem: String::new(),
            public_key_pem: String::new(),
            created_at: Utc::now(),
        };

        assert!(user.owns_uri("https://a.example/u/alice"));
        assert!(user.owns_uri("https://a.example/u/alice/p/1"));
        assert!(user.owns_uri("https://a.example/u/alice#key"));
        assert!(!user.owns_uri("https://a.example/u/alicebob/p/1"));
        assert!(!user.owns_uri("https://b.example/u/alice/p/1"));
    }

    #[test]
    fn recipient_key_marks_direct_inboxes() {
        let shared = RecipientKey::inbox("https://b.example/inbox");
        assert_eq!(shared.as_str(), "%https://b.example/inbox");
        assert_eq!(shared.direct_inbox(), Some("https://b.example/inbox"));

        let actor = RecipientKey::actor("https://b.example/u/bob");
        assert_eq!(actor.direct_inbox(), None);
    }

    #[test]
    fn origin_is_lowercased_host() {
        assert_eq!(origin_of("https://B.Example/p/1"), "b.example");
        assert_eq!(origin_of("not a uri"), "");
    }

    #[test]
    fn filter_body_tolerates_missing_fields() {
        let filter: Filter = serde_json::from_str(r#"{"name":"spam","reject":true}"#).unwrap();
        assert!(filter.reject);
        assert!(filter.actor.is_none());
        assert!(!filter.is_expired_at(Utc::now()));
    }
}
