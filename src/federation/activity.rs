//! Activity normalization
//!
//! Turns inbound activity documents into canonical [`Post`] records.
//! Documents are decoded into the shapes the engine understands; anything
//! else is appended to the archive file and dropped.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::box_resolver::BoxResolver;
use super::filter::FilterEngine;
use super::media::{MediaMirror, RemoteMedia};
use super::transport::{ACTIVITY_ACCEPT, Transport, fetch_hard_mode};
use crate::data::{Database, EntityId, LocalUser, Mention, Post, PostFlags, PostKind, origin_of};
use crate::error::AppError;

/// Deepest level of parent/quote fetching, counting the inbound item as 1.
pub const MAX_DEPTH: usize = 10;
/// Content longer than this many characters is cut.
pub const MAX_CONTENT_CHARS: usize = 90_001;
/// Only the first attachments are mirrored.
pub const MAX_MIRRORED_ATTACHMENTS: usize = 5;
/// Outbox items considered per harvest.
pub const HARVEST_LIMIT: usize = 20;

const SENSITIVE_SUMMARY: &str = "content warning";

/// Object types whose Update is ignored.
const ACTOR_TYPES: [&str; 3] = ["Person", "Service", "Application"];

// =============================================================================
// Decoding
// =============================================================================

/// One item or an array of items. Elements of any other shape are skipped.
#[derive(Debug)]
struct Many<T>(Vec<T>);

impl<T> Default for Many<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for Many<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let items = match Value::deserialize(deserializer)? {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        };
        Ok(Self(
            items
                .into_iter()
                .filter_map(|item| serde_json::from_value(item).ok())
                .collect(),
        ))
    }
}

impl<T> Many<T> {
    fn first(&self) -> Option<&T> {
        self.0.first()
    }

    fn iter(&self) -> std::slice::Iter<'_, T> {
        self.0.iter()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct LinkObject {
    id: Option<String>,
    href: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    media_type: Option<String>,
}

/// A bare URI or an object standing in for one.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Link {
    Uri(String),
    Object(LinkObject),
}

impl Link {
    fn id(&self) -> Option<&str> {
        match self {
            Self::Uri(uri) => Some(uri.as_str()),
            Self::Object(object) => object.id.as_deref().or(object.href.as_deref()),
        }
        .filter(|id| !id.is_empty())
    }

    fn href(&self) -> Option<&str> {
        match self {
            Self::Uri(uri) => Some(uri.as_str()),
            Self::Object(object) => object.href.as_deref().or(object.id.as_deref()),
        }
        .filter(|href| !href.is_empty())
    }

    fn media_type(&self) -> Option<&str> {
        match self {
            Self::Uri(_) => None,
            Self::Object(object) => object.media_type.as_deref(),
        }
    }

    /// Object form that declares a type other than an actor type.
    fn is_non_actor_object(&self) -> bool {
        matches!(self, Self::Object(LinkObject { kind: Some(kind), .. })
            if !kind.is_empty() && !ACTOR_TYPES.contains(&kind.as_str()) && kind != "Group")
    }
}

fn first_id(links: &Many<Link>) -> Option<String> {
    links.iter().find_map(Link::id).map(str::to_string)
}

/// `attributedTo` may list non-actor objects; prefer actors.
fn attributed_actor(links: &Many<Link>) -> Option<String> {
    links
        .iter()
        .filter(|link| !link.is_non_actor_object())
        .find_map(Link::id)
        .map(str::to_string)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct AttachmentObject {
    #[serde(rename = "type")]
    kind: Option<String>,
    media_type: Option<String>,
    url: Many<Link>,
    name: Option<String>,
    summary: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct IconObject {
    url: Option<String>,
    media_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TagObject {
    #[serde(rename = "type")]
    kind: Option<String>,
    name: Option<String>,
    href: Option<String>,
    icon: Many<IconObject>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PollOption {
    name: Option<String>,
}

/// Fields shared by every content object type.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ContentObject {
    id: Option<String>,
    attributed_to: Many<Link>,
    to: Many<Link>,
    cc: Many<Link>,
    published: Option<String>,
    content: Option<String>,
    summary: Option<String>,
    name: Option<String>,
    sensitive: Option<Value>,
    in_reply_to: Many<Link>,
    context: Many<Link>,
    conversation: Many<Link>,
    quote_url: Option<String>,
    quote_uri: Option<String>,
    #[serde(rename = "_misskey_quote")]
    misskey_quote: Option<String>,
    attachment: Many<AttachmentObject>,
    tag: Many<TagObject>,
    one_of: Many<PollOption>,
    any_of: Many<PollOption>,
    replies: Option<Value>,
}

/// Create, Update and Announce.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Wrapper {
    id: Option<String>,
    actor: Many<Link>,
    object: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Removal {
    object: Many<Link>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TombstoneObject {
    id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjectType {
    Note,
    Article,
    Page,
    Video,
    Audio,
    Image,
    Question,
    Event,
}

/// Accepted document shapes, by `type`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum Envelope {
    Create(Wrapper),
    Update(Wrapper),
    Delete(Removal),
    Announce(Wrapper),
    Note(ContentObject),
    Article(ContentObject),
    Page(ContentObject),
    Video(ContentObject),
    Audio(ContentObject),
    Image(ContentObject),
    Question(ContentObject),
    Event(ContentObject),
    Tombstone(TombstoneObject),
    #[serde(other)]
    Unrecognized,
}

impl Envelope {
    fn decode(raw: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(raw)
    }

    fn into_content(self) -> Option<(ObjectType, ContentObject)> {
        match self {
            Self::Note(object) => Some((ObjectType::Note, object)),
            Self::Article(object) => Some((ObjectType::Article, object)),
            Self::Page(object) => Some((ObjectType::Page, object)),
            Self::Video(object) => Some((ObjectType::Video, object)),
            Self::Audio(object) => Some((ObjectType::Audio, object)),
            Self::Image(object) => Some((ObjectType::Image, object)),
            Self::Question(object) => Some((ObjectType::Question, object)),
            Self::Event(object) => Some((ObjectType::Event, object)),
            _ => None,
        }
    }
}

fn declared_type(raw: &Value) -> &str {
    raw.get("type").and_then(Value::as_str).unwrap_or("")
}

// =============================================================================
// Content helpers
// =============================================================================

fn truncate_chars(text: &mut String, max: usize) {
    if let Some((cut, _)) = text.char_indices().nth(max) {
        tracing::info!(max, "Content too long, truncating");
        text.truncate(cut);
    }
}

fn sanitize(html: &str) -> String {
    ammonia::clean(html)
}

fn render_options(options: &[&PollOption]) -> String {
    let mut list = String::from("<ul>");
    for name in options.iter().filter_map(|option| option.name.as_deref()) {
        list.push_str("<li>");
        list.push_str(&html_escape::encode_text(name));
        list.push_str("</li>");
    }
    list.push_str("</ul>");
    list
}

fn parse_published(published: Option<&str>) -> DateTime<Utc> {
    published
        .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
        .map(|value| value.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

fn is_fetchable(uri: &str) -> bool {
    url::Url::parse(uri).is_ok_and(|parsed| matches!(parsed.scheme(), "https" | "http"))
}

fn mint_conversation() -> String {
    format!("data:,missing-{}", ulid::Ulid::new())
}

/// Conversation token shared by the items of one inbound batch.
#[derive(Debug, Default, Clone)]
pub struct ConversationHint(Option<String>);

impl ConversationHint {
    /// Remember `token` unless one was already seen.
    pub fn observe(&mut self, token: &str) {
        if self.0.is_none() && !token.is_empty() {
            self.0 = Some(token.to_string());
        }
    }

    pub fn get(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

/// Position of an object in a thread walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Walk {
    depth: usize,
    /// Set while fetching parents; replies are only followed going down.
    upward: bool,
}

impl Walk {
    const ENTRY: Self = Self {
        depth: 1,
        upward: false,
    };

    fn up(self) -> Self {
        Self {
            depth: self.depth + 1,
            upward: true,
        }
    }

    fn down(self) -> Self {
        Self {
            depth: self.depth + 1,
            upward: false,
        }
    }
}

/// How an object reached the normalizer.
#[derive(Debug, Default)]
struct Arrival {
    /// `actor` of the wrapping activity
    actor: Option<String>,
    /// Announcer when the object is being boosted
    booster: Option<String>,
    is_update: bool,
}

// =============================================================================
// Archive
// =============================================================================

/// Append-only JSON-lines file of documents the normalizer could not use.
pub struct ActivityArchive {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ActivityArchive {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub async fn append(&self, raw: &Value) {
        let _guard = self.lock.lock().await;
        if let Err(error) = self.write_line(raw).await {
            tracing::warn!(path = %self.path.display(), %error, "Failed to archive activity");
        }
    }

    async fn write_line(&self, raw: &Value) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_vec(raw)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await
    }
}

// =============================================================================
// Normalizer
// =============================================================================

pub struct Normalizer {
    db: Arc<Database>,
    transport: Arc<dyn Transport>,
    filters: Arc<FilterEngine>,
    boxes: Arc<BoxResolver>,
    media: Arc<MediaMirror>,
    archive: ActivityArchive,
    timeout: Duration,
}

impl Normalizer {
    pub fn new(
        db: Arc<Database>,
        transport: Arc<dyn Transport>,
        filters: Arc<FilterEngine>,
        boxes: Arc<BoxResolver>,
        media: Arc<MediaMirror>,
        archive_path: PathBuf,
        timeout: Duration,
    ) -> Self {
        Self {
            db,
            transport,
            filters,
            boxes,
            media,
            archive: ActivityArchive::new(archive_path),
            timeout,
        }
    }

    /// Normalize one activity received from or fetched at `source_origin`.
    ///
    /// Returns the stored post, or `None` when the activity was dropped,
    /// archived, or was a deletion.
    pub async fn normalize(
        &self,
        raw: &Value,
        source_origin: &str,
        owner: &LocalUser,
    ) -> Result<Option<Post>, AppError> {
        let mut hint = ConversationHint::default();
        self.normalize_at(raw, source_origin, owner, Walk::ENTRY, &mut hint).await
    }

    /// Normalize several items as one batch sharing a conversation hint.
    ///
    /// Items may be embedded objects or bare URIs. Failures are logged per
    /// item and do not stop the batch.
    pub async fn normalize_batch(
        &self,
        items: &[Value],
        source_origin: &str,
        owner: &LocalUser,
    ) -> Vec<Post> {
        let mut hint = ConversationHint::default();
        let mut stored = Vec::new();

        for item in items {
            let outcome = match item {
                Value::String(uri) => match self.needs_object(owner, uri).await {
                    Ok(false) => continue,
                    Ok(true) => match self.fetch_json(uri, false).await {
                        Some(doc) => {
                            self.normalize_at(&doc, &origin_of(uri), owner, Walk::ENTRY, &mut hint)
                                .await
                        }
                        None => continue,
                    },
                    Err(error) => Err(error),
                },
                Value::Object(_) => self.normalize_at(item, source_origin, owner, Walk::ENTRY, &mut hint).await,
                _ => continue,
            };

            match outcome {
                Ok(Some(post)) => stored.push(post),
                Ok(None) => {}
                Err(error) => tracing::info!(%error, "Skipping batch item"),
            }
        }
        stored
    }

    /// Import recent posts from `actor`'s outbox.
    pub async fn harvest_outbox(&self, owner: &LocalUser, actor: &str) -> Result<Vec<Post>, AppError> {
        let Some(boxes) = self.boxes.resolve(actor).await? else {
            tracing::info!(%actor, "No boxes for harvest");
            return Ok(Vec::new());
        };
        if boxes.outbox.is_empty() {
            return Ok(Vec::new());
        }

        tracing::debug!(outbox = %boxes.outbox, "Harvesting outbox");
        let Some(collection) = self.fetch_json(&boxes.outbox, false).await else {
            return Ok(Vec::new());
        };

        let mut items = collection_items(&collection);
        if items.is_empty() {
            if let Some(page) = collection.get("first").and_then(Value::as_str) {
                if let Some(page) = self.fetch_json(page, false).await {
                    items = collection_items(&page);
                }
            }
        }

        items.truncate(HARVEST_LIMIT);
        items.reverse();
        Ok(self
            .normalize_batch(&items, &origin_of(&boxes.outbox), owner)
            .await)
    }

    async fn fetch_json(&self, uri: &str, hard_mode: bool) -> Option<Value> {
        let fetched = if hard_mode {
            fetch_hard_mode(self.transport.as_ref(), uri, self.timeout).await
        } else {
            self.transport.fetch(uri, ACTIVITY_ACCEPT, self.timeout).await
        };
        match fetched {
            Ok(body) => match serde_json::from_slice(&body) {
                Ok(doc) => Some(doc),
                Err(error) => {
                    tracing::info!(%uri, %error, "Fetched object is not JSON");
                    None
                }
            },
            Err(error) => {
                tracing::info!(%uri, %error, "Failed to fetch object");
                None
            }
        }
    }

    /// Whether `uri` should be fetched and ingested for `owner`.
    async fn needs_object(&self, owner: &LocalUser, uri: &str) -> Result<bool, AppError> {
        if !is_fetchable(uri) || owner.owns_uri(uri) {
            return Ok(false);
        }
        if self.filters.rejects_origin(&owner.id, uri).await? {
            return Ok(false);
        }
        if self.db.is_tombstoned(&owner.id, uri).await? {
            tracing::debug!(%uri, "Already deleted");
            return Ok(false);
        }
        Ok(!self.db.post_exists(&owner.id, uri).await?)
    }

    async fn archive(&self, raw: &Value, reason: &str) {
        tracing::info!(kind = declared_type(raw), reason, "Archiving activity");
        self.archive.append(raw).await;
    }

    fn normalize_at<'a>(
        &'a self,
        raw: &'a Value,
        origin: &'a str,
        owner: &'a LocalUser,
        walk: Walk,
        hint: &'a mut ConversationHint,
    ) -> BoxFuture<'a, Result<Option<Post>, AppError>> {
        Box::pin(async move {
            let envelope = match Envelope::decode(raw) {
                Ok(envelope) => envelope,
                Err(error) => {
                    self.archive(raw, &error.to_string()).await;
                    return Ok(None);
                }
            };

            match envelope {
                Envelope::Create(wrapper) => {
                    self.unwrap_created(wrapper, raw, origin, owner, walk, hint, false)
                        .await
                }
                Envelope::Update(wrapper) => {
                    self.unwrap_created(wrapper, raw, origin, owner, walk, hint, true)
                        .await
                }
                Envelope::Announce(wrapper) => {
                    self.unwrap_announce(wrapper, origin, owner, walk, hint).await
                }
                Envelope::Delete(removal) => {
                    let target = first_id(&removal.object);
                    self.erase(target, origin, owner).await
                }
                Envelope::Tombstone(tombstone) => self.erase(tombstone.id, origin, owner).await,
                Envelope::Unrecognized => {
                    self.archive(raw, "unrecognized type").await;
                    Ok(None)
                }
                content => match content.into_content() {
                    Some((object_type, object)) => {
                        self.ingest(
                            object_type,
                            object,
                            raw,
                            origin,
                            owner,
                            walk,
                            hint,
                            Arrival::default(),
                        )
                        .await
                    }
                    None => Ok(None),
                },
            }
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn unwrap_created(
        &self,
        wrapper: Wrapper,
        raw: &Value,
        origin: &str,
        owner: &LocalUser,
        walk: Walk,
        hint: &mut ConversationHint,
        is_update: bool,
    ) -> Result<Option<Post>, AppError> {
        let object = match wrapper.object {
            Some(Value::String(uri)) => {
                if origin_of(&uri) != origin {
                    return Err(mismatch(&uri, origin, raw));
                }
                match self.fetch_json(&uri, true).await {
                    Some(doc) => doc,
                    None => return Ok(None),
                }
            }
            Some(object @ Value::Object(_)) => object,
            _ => {
                tracing::info!(id = ?wrapper.id, "No object in activity");
                return Ok(None);
            }
        };

        if is_update && ACTOR_TYPES.contains(&declared_type(&object)) {
            // TODO: refresh cached boxes and key from profile updates once the
            // product decision on following actor edits is made.
            tracing::debug!(id = ?wrapper.id, "Ignoring actor update");
            return Ok(None);
        }

        let envelope = match Envelope::decode(&object) {
            Ok(envelope) => envelope,
            Err(error) => {
                self.archive(raw, &error.to_string()).await;
                return Ok(None);
            }
        };
        let Some((object_type, content)) = envelope.into_content() else {
            self.archive(raw, "unsupported wrapped object").await;
            return Ok(None);
        };

        let arrival = Arrival {
            actor: first_id(&wrapper.actor),
            booster: None,
            is_update,
        };
        self.ingest(object_type, content, &object, origin, owner, walk, hint, arrival)
            .await
    }

    async fn unwrap_announce(
        &self,
        wrapper: Wrapper,
        origin: &str,
        owner: &LocalUser,
        walk: Walk,
        hint: &mut ConversationHint,
    ) -> Result<Option<Post>, AppError> {
        let (target, embedded) = match wrapper.object {
            Some(Value::String(uri)) => (uri, None),
            Some(object @ Value::Object(_)) => {
                let id = object
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                (id, Some(object))
            }
            _ => return Ok(None),
        };
        if target.is_empty() || !self.needs_object(owner, &target).await? {
            return Ok(None);
        }

        let target_origin = origin_of(&target);
        let object = match embedded {
            Some(object) if target_origin == origin => object,
            _ => {
                tracing::debug!(%target, "Fetching boosted object");
                match self.fetch_json(&target, true).await {
                    Some(doc) => doc,
                    None => return Ok(None),
                }
            }
        };

        let Some((object_type, content)) = Envelope::decode(&object)
            .ok()
            .and_then(Envelope::into_content)
        else {
            self.archive(&object, "unsupported boosted object").await;
            return Ok(None);
        };

        let arrival = Arrival {
            actor: None,
            booster: first_id(&wrapper.actor),
            is_update: false,
        };
        self.ingest(
            object_type,
            content,
            &object,
            &target_origin,
            owner,
            walk,
            hint,
            arrival,
        )
        .await
    }

    async fn erase(
        &self,
        target: Option<String>,
        origin: &str,
        owner: &LocalUser,
    ) -> Result<Option<Post>, AppError> {
        let Some(target) = target.filter(|t| !t.is_empty()) else {
            return Ok(None);
        };
        if origin_of(&target) != origin {
            tracing::warn!(%target, %origin, "Forged delete");
            return Err(AppError::OriginMismatch {
                object_uri: target,
                origin: origin.to_string(),
            });
        }

        if self.db.delete_post_by_uri(&owner.id, &target).await? {
            tracing::info!(%target, "Deleted post");
        } else {
            tracing::debug!(%target, "Delete for unknown post");
        }
        crate::metrics::POSTS_INGESTED
            .with_label_values(&[PostKind::Delete.as_str()])
            .inc();
        Ok(None)
    }

    #[allow(clippy::too_many_arguments)]
    async fn ingest(
        &self,
        object_type: ObjectType,
        object: ContentObject,
        raw: &Value,
        origin: &str,
        owner: &LocalUser,
        walk: Walk,
        hint: &mut ConversationHint,
        arrival: Arrival,
    ) -> Result<Option<Post>, AppError> {
        let Some(object_uri) = object.id.clone().filter(|id| !id.is_empty()) else {
            self.archive(raw, "object without id").await;
            return Ok(None);
        };
        if origin_of(&object_uri) != origin {
            return Err(mismatch(&object_uri, origin, raw));
        }

        let mut post = build_post(object_type, &object, &object_uri, owner, &arrival);

        if let Some(hit) = self.filters.rejects(&post, &owner.id).await? {
            tracing::info!(uri = %object_uri, filter = %hit.name, cause = %hit.cause, "Rejected by filter");
            drop_post("rejected");
            return Ok(None);
        }

        if arrival.is_update {
            if let Some(previous) = self.db.find_post_by_uri(&owner.id, &object_uri).await? {
                tracing::info!(uri = %object_uri, "Updating post");
                self.db
                    .update_post_content(&previous.id, &post.summary_html, &post.body_html)
                    .await?;
                return Ok(Some(Post {
                    summary_html: post.summary_html,
                    body_html: post.body_html,
                    ..previous
                }));
            }
            tracing::debug!(uri = %object_uri, "Update for unknown post, ingesting");
        }

        if owner.owns_uri(&object_uri) {
            drop_post("self_authored");
            return Ok(None);
        }
        if !self.needs_object(owner, &object_uri).await? {
            drop_post("duplicate");
            return Ok(None);
        }
        if self.filters.rejects_actor(&owner.id, &post.actor_uri).await? {
            drop_post("rejected");
            return Ok(None);
        }

        let skip_media = self.filters.skips_media(&post, &owner.id).await?;
        post.attachments = self.collect_media(&object, skip_media).await?;

        let explicit = first_id(&object.context).or_else(|| first_id(&object.conversation));
        if let Some(token) = explicit.as_deref() {
            hint.observe(token);
        }

        for parent in [post.reply_to_uri.clone(), post.quote_uri.clone()]
            .into_iter()
            .flatten()
        {
            self.repair(&parent, owner, walk.up(), hint).await?;
        }

        let conversation = match explicit {
            Some(token) => token,
            None => self.inherited_conversation(&post, owner, hint).await?,
        };
        hint.observe(&conversation);
        post.conversation_id = conversation;

        for (position, attachment) in post.attachments.iter_mut().enumerate() {
            attachment.post_id = post.id.clone();
            attachment.position = position as i64;
        }

        if !self.db.insert_post(&post).await? {
            drop_post("duplicate");
            return Ok(None);
        }
        crate::metrics::POSTS_INGESTED
            .with_label_values(&[post.kind.as_str()])
            .inc();
        tracing::info!(uri = %post.object_uri, kind = %post.kind, depth = walk.depth, "Saved post");

        if !walk.upward {
            for reply in object.replies.as_ref().map(reply_ids).unwrap_or_default() {
                self.repair(&reply, owner, walk.down(), hint).await?;
            }
        }
        Ok(Some(post))
    }

    /// Fetch and store a missing thread member. `walk` is the position the
    /// fetched object will take.
    async fn repair(
        &self,
        uri: &str,
        owner: &LocalUser,
        walk: Walk,
        hint: &mut ConversationHint,
    ) -> Result<(), AppError> {
        let relation = if walk.upward { "parent" } else { "reply" };
        if !self.needs_object(owner, uri).await? {
            return Ok(());
        }
        if walk.depth > MAX_DEPTH {
            tracing::info!(%uri, depth = walk.depth, relation, "Thread too deep, truncating");
            return Ok(());
        }

        tracing::debug!(%uri, depth = walk.depth, relation, "Fetching missing thread member");
        let Some(doc) = self.fetch_json(uri, walk.upward).await else {
            return Ok(());
        };
        if let Err(error) = self
            .normalize_at(&doc, &origin_of(uri), owner, walk, hint)
            .await
        {
            tracing::info!(%uri, %error, relation, "Failed to ingest thread member");
        }
        Ok(())
    }

    async fn inherited_conversation(
        &self,
        post: &Post,
        owner: &LocalUser,
        hint: &ConversationHint,
    ) -> Result<String, AppError> {
        if let Some(parent) = post.reply_to_uri.as_deref() {
            if let Some(parent) = self.db.find_post_by_uri(&owner.id, parent).await? {
                return Ok(parent.conversation_id);
            }
        }
        Ok(hint.get().map(str::to_string).unwrap_or_else(mint_conversation))
    }

    async fn collect_media(
        &self,
        object: &ContentObject,
        skip_media: bool,
    ) -> Result<Vec<crate::data::Attachment>, AppError> {
        let mut attachments = Vec::new();

        for (index, item) in object.attachment.iter().enumerate() {
            let link = item.url.first();
            let media_type = item
                .media_type
                .as_deref()
                .or_else(|| link.and_then(Link::media_type))
                .unwrap_or_default()
                .to_ascii_lowercase();
            let name = item.name.clone().unwrap_or_default();
            let description = item.summary.clone().filter(|s| !s.is_empty()).unwrap_or_else(|| name.clone());

            let eligible_kind = matches!(item.kind.as_deref(), Some("Document" | "Image"));
            let eligible_type = media_type == "text/plain" || media_type.starts_with("image/");
            let localize = index < MAX_MIRRORED_ATTACHMENTS && eligible_kind && eligible_type && !skip_media;
            if index >= MAX_MIRRORED_ATTACHMENTS {
                tracing::debug!(index, "Excess attachment kept as reference");
            }

            let media = RemoteMedia {
                url: link.and_then(Link::href).unwrap_or_default().to_string(),
                media_type,
                name,
                description,
            };
            if let Some(attachment) = self.media.save(media, index as i64, localize).await? {
                attachments.push(attachment);
            }
        }

        for tag in object.tag.iter().filter(|tag| tag.kind.as_deref() == Some("Emoji")) {
            let Some(icon) = tag.icon.first() else {
                continue;
            };
            let shortcode = tag.name.as_deref().unwrap_or_default().trim_matches(':');
            if shortcode.is_empty() {
                continue;
            }
            let media = RemoteMedia {
                url: icon.url.clone().unwrap_or_default(),
                media_type: icon.media_type.clone().unwrap_or_else(|| "image/png".to_string()),
                name: format!(":{shortcode}:"),
                description: format!(":{shortcode}:"),
            };
            let position = attachments.len() as i64;
            if let Some(attachment) = self.media.save(media, position, !skip_media).await? {
                attachments.push(attachment);
            }
        }

        Ok(attachments)
    }
}

fn mismatch(object_uri: &str, origin: &str, raw: &Value) -> AppError {
    tracing::warn!(%object_uri, %origin, "Object not from its source origin");
    tracing::debug!(raw = %raw, "Rejected document");
    AppError::OriginMismatch {
        object_uri: object_uri.to_string(),
        origin: origin.to_string(),
    }
}

fn drop_post(reason: &str) {
    crate::metrics::POSTS_DROPPED.with_label_values(&[reason]).inc();
}

fn collection_items(collection: &Value) -> Vec<Value> {
    let direct = ["orderedItems", "items"]
        .iter()
        .find_map(|key| collection.get(*key).and_then(Value::as_array));
    let paged = || {
        let first = collection.get("first")?;
        ["orderedItems", "items"]
            .iter()
            .find_map(|key| first.get(*key).and_then(Value::as_array))
    };
    direct.or_else(paged).cloned().unwrap_or_default()
}

/// Reply URIs listed inline in a `replies` collection or its first page.
fn reply_ids(replies: &Value) -> Vec<String> {
    collection_items(replies)
        .iter()
        .filter_map(|item| match item {
            Value::String(uri) => Some(uri.clone()),
            Value::Object(_) => item.get("id").and_then(Value::as_str).map(str::to_string),
            _ => None,
        })
        .filter(|uri| is_fetchable(uri))
        .collect()
}

/// Everything about the post that does not need I/O.
fn build_post(
    object_type: ObjectType,
    object: &ContentObject,
    object_uri: &str,
    owner: &LocalUser,
    arrival: &Arrival,
) -> Post {
    let author = attributed_actor(&object.attributed_to);
    let (actor_uri, original_actor_uri) = match &arrival.booster {
        Some(booster) => (booster.clone(), author.clone()),
        None => (
            arrival
                .actor
                .clone()
                .or_else(|| author.clone())
                .unwrap_or_default(),
            None,
        ),
    };

    let mut audience: Vec<String> = Vec::new();
    for link in object
        .to
        .iter()
        .chain(object.cc.iter())
        .chain(object.attributed_to.iter())
    {
        if let Some(id) = link.id() {
            audience.push(id.to_string());
        }
    }
    audience.push(actor_uri.clone());
    let mut seen = std::collections::HashSet::new();
    audience.retain(|entry| !entry.is_empty() && seen.insert(entry.clone()));

    let mut body = object.content.clone().unwrap_or_default();
    if !body.starts_with("<p>") {
        body.insert_str(0, "<p>");
    }
    let mut summary = object.summary.clone().unwrap_or_default();
    if let Some(name) = object.name.as_deref().filter(|n| !n.is_empty()) {
        if !summary.is_empty() {
            body = format!("{summary}<p>{body}");
        }
        summary = html_escape::encode_text(name).into_owned();
    }
    if object.sensitive == Some(Value::Bool(true)) && summary.is_empty() {
        summary = SENSITIVE_SUMMARY.to_string();
    }

    let reply_to_uri = first_id(&object.in_reply_to);
    let kind = match (object_type, &arrival.booster) {
        (_, Some(_)) => PostKind::Boost,
        (ObjectType::Question, _) => PostKind::Poll,
        (ObjectType::Event, _) => PostKind::Event,
        _ if reply_to_uri.is_some() => PostKind::Reply,
        _ => PostKind::Post,
    };

    if object_type == ObjectType::Question {
        let options: Vec<&PollOption> = object.one_of.iter().chain(object.any_of.iter()).collect();
        body.push_str(&render_options(&options));
    }

    truncate_chars(&mut body, MAX_CONTENT_CHARS);
    let body_html = sanitize(&body);
    let summary_html = sanitize(&summary);

    let mut hashtags = Vec::new();
    let mut mentions = Vec::new();
    for tag in object.tag.iter() {
        match tag.kind.as_deref() {
            Some("Hashtag") => {
                let name = tag.name.as_deref().unwrap_or_default();
                if !name.is_empty() && name != "#" {
                    let tag = if name.starts_with('#') {
                        name.to_string()
                    } else {
                        format!("#{name}")
                    };
                    if !hashtags.contains(&tag) {
                        hashtags.push(tag);
                    }
                }
            }
            Some("Mention") => mentions.push(Mention {
                name: tag.name.clone().unwrap_or_default(),
                href: tag.href.clone().unwrap_or_default(),
            }),
            _ => {}
        }
    }

    let quote_uri = object
        .quote_url
        .clone()
        .or_else(|| object.quote_uri.clone())
        .or_else(|| object.misskey_quote.clone())
        .filter(|quote| !quote.is_empty());

    let mut flags = PostFlags::default();
    if mentions.iter().any(|mention| mention.href == owner.url) {
        flags.insert(PostFlags::ACKED);
    }

    Post {
        id: EntityId::new().0,
        owner_user_id: owner.id.clone(),
        kind,
        object_uri: object_uri.to_string(),
        actor_uri,
        original_actor_uri,
        reply_to_uri,
        quote_uri,
        conversation_id: String::new(),
        published_at: parse_published(object.published.as_deref()),
        received_at: Utc::now(),
        origin_host: origin_of(object_uri),
        summary_html,
        body_html,
        is_public: Post::audience_is_public(&audience),
        audience,
        attachments: Vec::new(),
        hashtags,
        mentions,
        flags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn owner() -> LocalUser {
        LocalUser {
            id: "u1".to_string(),
            username: "admin".to_string(),
            display_name: "Admin".to_string(),
            url: "https://local.example/u/admin".to_string(),
            private_key_pem: String::new(),
            public_key_pem: String::new(),
            created_at: Utc::now(),
        }
    }

    fn content(raw: Value) -> (ObjectType, ContentObject) {
        Envelope::decode(&raw).unwrap().into_content().unwrap()
    }

    #[test]
    fn unknown_types_decode_as_unrecognized() {
        let raw = json!({"type": "Flag", "object": "https://b.example/p/1"});
        assert!(matches!(Envelope::decode(&raw).unwrap(), Envelope::Unrecognized));
    }

    #[test]
    fn lenient_fields_skip_odd_shapes() {
        let (_, object) = content(json!({
            "type": "Note",
            "id": "https://b.example/p/1",
            "to": ["https://www.w3.org/ns/activitystreams#Public", 7, null],
            "inReplyTo": {"id": "https://a.example/p/9"},
            "attachment": {"type": "Image", "url": [{"href": "https://b.example/m/1.png", "mediaType": "image/png"}]}
        }));
        assert_eq!(object.to.0.len(), 1);
        assert_eq!(first_id(&object.in_reply_to).as_deref(), Some("https://a.example/p/9"));
        let attachment = object.attachment.first().unwrap();
        assert_eq!(attachment.url.first().and_then(Link::href), Some("https://b.example/m/1.png"));
        assert_eq!(attachment.url.first().and_then(Link::media_type), Some("image/png"));
    }

    #[test]
    fn builds_reply_with_audience_and_tags() {
        let (kind, object) = content(json!({
            "type": "Note",
            "id": "https://b.example/p/1",
            "attributedTo": "https://b.example/u/alice",
            "to": "https://www.w3.org/ns/activitystreams#Public",
            "cc": ["https://b.example/u/alice/followers"],
            "inReplyTo": "https://a.example/p/9",
            "content": "hello <script>alert(1)</script><b>world</b>",
            "tag": [
                {"type": "Hashtag", "name": "rust"},
                {"type": "Hashtag", "name": "#rust"},
                {"type": "Mention", "name": "@admin@local.example", "href": "https://local.example/u/admin"}
            ]
        }));
        let arrival = Arrival {
            actor: Some("https://b.example/u/alice".to_string()),
            ..Arrival::default()
        };
        let post = build_post(kind, &object, "https://b.example/p/1", &owner(), &arrival);

        assert_eq!(post.kind, PostKind::Reply);
        assert!(post.is_public);
        assert_eq!(post.audience[0], crate::data::PUBLIC_COLLECTION);
        assert_eq!(post.audience.len(), 3);
        assert!(!post.body_html.contains("script"));
        assert!(post.body_html.starts_with("<p>"));
        assert_eq!(post.hashtags, vec!["#rust".to_string()]);
        assert!(post.flags.contains(PostFlags::ACKED));
    }

    #[test]
    fn question_options_and_titles() {
        let (kind, object) = content(json!({
            "type": "Question",
            "id": "https://b.example/p/2",
            "attributedTo": "https://b.example/u/alice",
            "name": "Best <crab>?",
            "content": "<p>pick one</p>",
            "oneOf": [{"name": "Ferris"}, {"name": "Corro"}]
        }));
        let post = build_post(kind, &object, "https://b.example/p/2", &owner(), &Arrival::default());
        assert_eq!(post.kind, PostKind::Poll);
        assert_eq!(post.summary_html, "Best &lt;crab&gt;?");
        assert!(post.body_html.ends_with("<ul><li>Ferris</li><li>Corro</li></ul>"));
    }

    #[test]
    fn boosts_keep_original_author() {
        let (kind, object) = content(json!({
            "type": "Note",
            "id": "https://d.example/p/7",
            "attributedTo": "https://d.example/u/dave",
            "sensitive": true
        }));
        let arrival = Arrival {
            booster: Some("https://b.example/u/alice".to_string()),
            ..Arrival::default()
        };
        let post = build_post(kind, &object, "https://d.example/p/7", &owner(), &arrival);
        assert_eq!(post.kind, PostKind::Boost);
        assert_eq!(post.actor_uri, "https://b.example/u/alice");
        assert_eq!(post.original_actor_uri.as_deref(), Some("https://d.example/u/dave"));
        assert_eq!(post.summary_html, SENSITIVE_SUMMARY);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut text = "é".repeat(10);
        truncate_chars(&mut text, 4);
        assert_eq!(text, "éééé");
    }

    #[test]
    fn conversation_hint_keeps_first_token() {
        let mut hint = ConversationHint::default();
        hint.observe("");
        hint.observe("tag:first");
        hint.observe("tag:second");
        assert_eq!(hint.get(), Some("tag:first"));
        assert!(mint_conversation().starts_with("data:,missing-"));
    }

    #[test]
    fn reply_ids_read_inline_pages() {
        let replies = json!({
            "type": "Collection",
            "first": {
                "type": "CollectionPage",
                "items": ["https://b.example/notes/2", {"id": "https://b.example/notes/3"}, 7]
            }
        });
        assert_eq!(
            reply_ids(&replies),
            vec!["https://b.example/notes/2", "https://b.example/notes/3"]
        );
        assert!(reply_ids(&json!("https://b.example/notes/1/replies")).is_empty());
    }

    #[test]
    fn walking_up_stops_reply_fetching() {
        let parent = Walk::ENTRY.up();
        assert_eq!(parent.depth, 2);
        assert!(parent.upward);
        assert!(!parent.up().down().upward);
    }

    #[test]
    fn collection_items_reads_first_page() {
        let outbox = json!({"type": "OrderedCollection", "first": {"orderedItems": ["a", "b"]}});
        assert_eq!(collection_items(&outbox).len(), 2);
        let flat = json!({"type": "OrderedCollection", "orderedItems": [{"id": "x"}]});
        assert_eq!(collection_items(&flat).len(), 1);
    }
}
