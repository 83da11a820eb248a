//! Activity delivery
//!
//! Signed POSTs of local activities to remote inboxes, backed by a durable
//! per-recipient retry queue. While a job exists for `(owner, recipient)`
//! new payloads are appended to it rather than attempted directly, so one
//! recipient never sees messages out of order.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Notify, OwnedMutexGuard, Semaphore, watch};

use super::box_resolver::{ActorBoxes, BoxResolver};
use super::tracker::TrackerHandle;
use super::transport::{SigningIdentity, Transport, TransportError};
use crate::data::{
    Database, DeliveryJob, EnqueueOutcome, INBOX_MARKER, LocalUser, PUBLIC_COLLECTION, Post,
    RecipientKey,
};
use crate::error::AppError;

/// Failed flushes tolerated before a job is dead-lettered.
pub const MAX_TRIES: u32 = 15;

const SWEEP_BATCH: i64 = 100;
const MIN_SWEEP_PAUSE: Duration = Duration::from_secs(1);
const MAX_SWEEP_PAUSE: Duration = Duration::from_secs(60 * 60);

/// Base retry delay after `tries` failed flushes; `None` once the job is out
/// of retries.
pub fn backoff(tries: u32) -> Option<Duration> {
    let minutes = match tries {
        0 | 1 => 5,
        2 => 10,
        3 => 15,
        4 => 60,
        5 => 120,
        6 => 180,
        7..=MAX_TRIES => 720,
        _ => return None,
    };
    Some(Duration::from_secs(minutes * 60))
}

/// `base` from now, pushed back by up to a tenth so retries to many
/// recipients do not line up.
pub fn next_attempt(base: Duration) -> DateTime<Utc> {
    let spread = (base.as_millis() / 10) as u64;
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=spread));
    let delay = chrono::Duration::from_std(base + jitter).unwrap_or(chrono::Duration::hours(12));
    Utc::now() + delay
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Failed; a retry job was created
    Queued,
    /// Appended to an existing retry job
    Coalesced,
    /// Refused by the peer (400/422); not retried
    Dropped,
    /// Out of retries, or the host does not resolve
    DeadLettered,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Queued => "queued",
            Self::Coalesced => "coalesced",
            Self::Dropped => "dropped",
            Self::DeadLettered => "dead_letter",
        }
    }
}

fn counted(outcome: DeliveryOutcome) -> DeliveryOutcome {
    crate::metrics::DELIVERIES_TOTAL
        .with_label_values(&[outcome.as_str()])
        .inc();
    outcome
}

/// Keyed async mutex; entries are dropped once nobody holds or waits on them.
#[derive(Default)]
struct RecipientLocks {
    held: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

struct RecipientGuard<'a> {
    locks: &'a RecipientLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl RecipientLocks {
    async fn lock(&self, owner_user_id: &str, recipient: &RecipientKey) -> RecipientGuard<'_> {
        let key = format!("{owner_user_id} {recipient}");
        let slot = self
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default()
            .clone();
        let guard = slot.lock_owned().await;
        RecipientGuard {
            locks: self,
            key,
            guard: Some(guard),
        }
    }
}

impl Drop for RecipientGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut held = self.locks.held.lock().unwrap_or_else(PoisonError::into_inner);
        if held
            .get(&self.key)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            held.remove(&self.key);
        }
    }
}

pub struct DeliveryEngine {
    db: Arc<Database>,
    transport: Arc<dyn Transport>,
    boxes: Arc<BoxResolver>,
    tracker: TrackerHandle,
    slots: Semaphore,
    locks: RecipientLocks,
    poke: Notify,
    timeout: Duration,
}

impl DeliveryEngine {
    /// # Arguments
    /// * `max_concurrent` - Global cap on in-flight POSTs
    /// * `timeout` - Timeout for each signed POST
    pub fn new(
        db: Arc<Database>,
        transport: Arc<dyn Transport>,
        boxes: Arc<BoxResolver>,
        tracker: TrackerHandle,
        max_concurrent: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            db,
            transport,
            boxes,
            tracker,
            slots: Semaphore::new(max_concurrent),
            locks: RecipientLocks::default(),
            poke: Notify::new(),
            timeout,
        }
    }

    /// Wake the sweep so it re-reads the next due time.
    pub fn poke(&self) {
        self.poke.notify_one();
    }

    /// Recipients of a locally authored post.
    ///
    /// Actors that advertise a shared inbox collapse to it. Public posts also
    /// go to every subscriber and to everyone who fetched the object.
    pub async fn recipients_for(
        &self,
        owner: &LocalUser,
        post: &Post,
    ) -> Result<BTreeSet<RecipientKey>, AppError> {
        let mut recipients = BTreeSet::new();
        let mut actors = BTreeSet::new();

        for address in &post.audience {
            if address.is_empty()
                || address == PUBLIC_COLLECTION
                || *address == owner.url
                || address.ends_with("/followers")
            {
                continue;
            }
            if address.starts_with(INBOX_MARKER) {
                recipients.insert(RecipientKey::parse(address));
            } else {
                actors.insert(address.clone());
            }
        }

        if post.is_public {
            actors.extend(self.db.list_subscribers(&owner.id).await?);
            self.tracker.flush().await;
            actors.extend(self.db.get_tracks(&post.object_uri).await?);
        }
        actors.remove(&owner.url);

        for actor in actors {
            recipients.insert(self.collapse(actor).await);
        }
        Ok(recipients)
    }

    async fn collapse(&self, actor: String) -> RecipientKey {
        match self.boxes.resolve(&actor).await {
            Ok(Some(ActorBoxes {
                shared_inbox: Some(shared),
                ..
            })) => RecipientKey::inbox(&shared),
            Ok(_) => RecipientKey::actor(actor),
            Err(error) => {
                tracing::warn!(%actor, %error, "Box lookup failed during fan-out");
                RecipientKey::actor(actor)
            }
        }
    }

    /// Send a locally authored post to all of its recipients.
    ///
    /// Recipients are attempted concurrently; each is only ordered against
    /// itself.
    pub async fn fan_out(
        &self,
        owner: &LocalUser,
        post: &Post,
    ) -> Result<Vec<(RecipientKey, DeliveryOutcome)>, AppError> {
        let activity = builder::for_post(owner, post);
        let message = serde_json::to_vec(&activity).map_err(|e| AppError::Internal(e.into()))?;
        let recipients = self.recipients_for(owner, post).await?;

        tracing::info!(
            post = %post.object_uri,
            recipients = recipients.len(),
            "Fanning out post"
        );

        let message = &message;
        let attempts = recipients.into_iter().map(|recipient| async move {
            let outcome = self.deliver(owner, &recipient, message).await;
            (recipient, outcome)
        });

        let mut outcomes = Vec::new();
        for (recipient, outcome) in futures::future::join_all(attempts).await {
            match outcome {
                Ok(outcome) => outcomes.push((recipient, outcome)),
                Err(error) => tracing::error!(%recipient, %error, "Delivery bookkeeping failed"),
            }
        }
        Ok(outcomes)
    }

    /// Deliver one payload to one recipient.
    pub async fn deliver(
        &self,
        owner: &LocalUser,
        recipient: &RecipientKey,
        message: &[u8],
    ) -> Result<DeliveryOutcome, AppError> {
        if self
            .db
            .append_to_delivery_job(&owner.id, recipient, message)
            .await?
        {
            tracing::debug!(%recipient, "Coalesced into pending job");
            return Ok(counted(DeliveryOutcome::Coalesced));
        }

        let _guard = self.locks.lock(&owner.id, recipient).await;

        // A job may have appeared while waiting for the lock.
        if self
            .db
            .append_to_delivery_job(&owner.id, recipient, message)
            .await?
        {
            tracing::debug!(%recipient, "Coalesced into pending job");
            return Ok(counted(DeliveryOutcome::Coalesced));
        }

        let outcome = match self.attempt(owner, recipient, message).await {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(error) if error.is_permanent_for_message() => {
                tracing::info!(%recipient, %error, "Recipient refused message");
                DeliveryOutcome::Dropped
            }
            Err(error) if error.is_permanent_for_host() => {
                tracing::warn!(%recipient, %error, "Dead-lettering delivery to unreachable host");
                DeliveryOutcome::DeadLettered
            }
            Err(error) => {
                tracing::info!(%recipient, %error, "Delivery failed, queueing retry");
                let base = backoff(1).unwrap_or(MAX_SWEEP_PAUSE);
                match self
                    .db
                    .enqueue_delivery(&owner.id, recipient, message, next_attempt(base))
                    .await?
                {
                    EnqueueOutcome::Created => {
                        self.poke();
                        DeliveryOutcome::Queued
                    }
                    EnqueueOutcome::Coalesced => DeliveryOutcome::Coalesced,
                }
            }
        };

        Ok(counted(outcome))
    }

    async fn attempt(
        &self,
        owner: &LocalUser,
        recipient: &RecipientKey,
        message: &[u8],
    ) -> Result<(), TransportError> {
        let _permit = self
            .slots
            .acquire()
            .await
            .map_err(|e| TransportError::Other(e.to_string()))?;

        let inbox = match recipient.direct_inbox() {
            Some(inbox) => inbox.to_string(),
            None => match self.boxes.resolve(recipient.as_str()).await {
                Ok(Some(boxes)) => boxes.inbox,
                Ok(None) => {
                    return Err(TransportError::Other(format!("no inbox for {recipient}")));
                }
                Err(error) => return Err(TransportError::Other(error.to_string())),
            },
        };

        self.transport
            .post_signed(&SigningIdentity::from(owner), &inbox, message, self.timeout)
            .await
    }

    /// Flush one due job under its recipient lock.
    ///
    /// Returns `None` when the job vanished or was rescheduled meanwhile.
    pub async fn flush_job(&self, job: DeliveryJob) -> Result<Option<DeliveryOutcome>, AppError> {
        let Some(owner) = self.db.get_user(&job.owner_user_id).await? else {
            tracing::warn!(job = %job.id, "Dropping delivery job of a deleted user");
            self.db.delete_delivery_job(&job.id).await?;
            return Ok(None);
        };

        let _guard = self.locks.lock(&owner.id, &job.recipient).await;

        let Some(job) = self.db.get_delivery_job(&owner.id, &job.recipient).await? else {
            return Ok(None);
        };
        if job.not_before > Utc::now() {
            return Ok(None);
        }

        let flushed = job.messages.len();
        let mut failure = None;
        for (index, message) in job.messages.iter().enumerate() {
            match self.attempt(&owner, &job.recipient, message).await {
                Ok(()) => {
                    counted(DeliveryOutcome::Delivered);
                }
                Err(error) if error.is_permanent_for_message() => {
                    tracing::info!(recipient = %job.recipient, %error, "Recipient refused queued message");
                    counted(DeliveryOutcome::Dropped);
                }
                Err(error) => {
                    failure = Some((index, error));
                    break;
                }
            }
        }

        let Some((index, error)) = failure else {
            let late = self
                .db
                .settle_delivery_job(&job.id, flushed, Vec::new(), 0, Utc::now())
                .await?;
            if late {
                self.poke();
            }
            tracing::debug!(recipient = %job.recipient, flushed, "Flushed delivery job");
            return Ok(Some(DeliveryOutcome::Delivered));
        };

        let tries = if error.is_permanent_for_host() {
            MAX_TRIES + 1
        } else {
            job.tries + 1
        };

        let outcome = match backoff(tries) {
            Some(base) => {
                let not_before = next_attempt(base);
                self.db
                    .settle_delivery_job(
                        &job.id,
                        flushed,
                        job.messages[index..].to_vec(),
                        tries,
                        not_before,
                    )
                    .await?;
                tracing::info!(
                    recipient = %job.recipient,
                    %error,
                    tries,
                    %not_before,
                    "Queued messages still failing"
                );
                DeliveryOutcome::Queued
            }
            None => {
                tracing::warn!(
                    recipient = %job.recipient,
                    %error,
                    dropped = flushed - index,
                    "Dead-lettering delivery job"
                );
                let late = self
                    .db
                    .settle_delivery_job(&job.id, flushed, Vec::new(), 0, Utc::now())
                    .await?;
                if late {
                    self.poke();
                }
                DeliveryOutcome::DeadLettered
            }
        };

        Ok(Some(counted(outcome)))
    }

    /// Flush every due job. Returns how many were picked up.
    pub async fn sweep(&self) -> Result<usize, AppError> {
        let due = self
            .db
            .list_due_delivery_jobs(Utc::now(), SWEEP_BATCH)
            .await?;
        let count = due.len();

        let flushes = due.into_iter().map(|job| async move {
            let id = job.id.clone();
            if let Err(error) = self.flush_job(job).await {
                tracing::error!(job = %id, %error, "Failed to flush delivery job");
            }
        });
        futures::future::join_all(flushes).await;

        crate::metrics::DELIVERY_QUEUE_DEPTH.set(self.db.count_delivery_jobs().await?);
        Ok(count)
    }

    async fn pause_until_next_due(&self) -> Duration {
        match self.db.next_delivery_due().await {
            Ok(Some(due)) => (due - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .clamp(MIN_SWEEP_PAUSE, MAX_SWEEP_PAUSE),
            Ok(None) => MAX_SWEEP_PAUSE,
            Err(error) => {
                tracing::warn!(%error, "Unable to read next delivery time");
                Duration::from_secs(60)
            }
        }
    }

    /// Retry loop: sweep, then sleep until the next job is due, a poke, or stop.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        while !*stop.borrow() {
            match self.sweep().await {
                Ok(0) => {}
                Ok(count) => tracing::debug!(count, "Delivery sweep finished"),
                Err(error) => tracing::error!(%error, "Delivery sweep failed"),
            }

            let pause = self.pause_until_next_due().await;
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = self.poke.notified() => {}
                _ = stop.changed() => break,
            }
        }
        tracing::debug!("Delivery sweep stopped");
    }

    /// Record a new subscriber and answer their Follow with an Accept.
    pub async fn accept_follow(
        &self,
        owner: &LocalUser,
        follow: &Value,
    ) -> Result<DeliveryOutcome, AppError> {
        let follower = follow
            .get("actor")
            .and_then(Value::as_str)
            .filter(|actor| !actor.is_empty())
            .ok_or_else(|| AppError::Protocol("Follow without actor".to_string()))?;

        if self.db.add_subscriber(&owner.id, follower).await? {
            tracing::info!(user = %owner.username, %follower, "New subscriber");
        }

        let accept = builder::accept(owner, follow.clone());
        let message = serde_json::to_vec(&accept).map_err(|e| AppError::Internal(e.into()))?;
        self.deliver(owner, &RecipientKey::actor(follower), &message)
            .await
    }

    /// Handle `Undo{Follow}`.
    pub async fn drop_subscriber(&self, owner: &LocalUser, follower: &str) -> Result<bool, AppError> {
        let removed = self.db.remove_subscriber(&owner.id, follower).await?;
        if removed {
            tracing::info!(user = %owner.username, %follower, "Subscriber left");
        }
        Ok(removed)
    }
}

/// Outbound activity JSON
pub mod builder {
    use serde_json::{Value, json};

    use crate::data::{EntityId, INBOX_MARKER, LocalUser, Post, PostKind};

    const CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

    fn activity_id(owner: &LocalUser, verb: &str) -> String {
        format!("{}/{}/{}", owner.url, verb, EntityId::new().0)
    }

    fn addressing(owner: &LocalUser, post: &Post) -> (Vec<String>, Vec<String>) {
        let to = post
            .audience
            .iter()
            .filter(|address| !address.is_empty() && !address.starts_with(INBOX_MARKER))
            .cloned()
            .collect();
        let cc = if post.is_public {
            vec![owner.followers_url()]
        } else {
            Vec::new()
        };
        (to, cc)
    }

    /// The object a local post is published as.
    pub fn object(owner: &LocalUser, post: &Post) -> Value {
        let kind = match post.kind {
            PostKind::Poll => "Question",
            PostKind::Event => "Event",
            _ => "Note",
        };
        let (to, cc) = addressing(owner, post);

        let mut tags: Vec<Value> = post
            .hashtags
            .iter()
            .map(|tag| json!({"type": "Hashtag", "name": tag}))
            .collect();
        tags.extend(
            post.mentions
                .iter()
                .map(|m| json!({"type": "Mention", "name": m.name, "href": m.href})),
        );

        let attachments: Vec<Value> = post
            .attachments
            .iter()
            .map(|a| {
                let kind = if a.media_type.starts_with("image/") {
                    "Image"
                } else {
                    "Document"
                };
                json!({
                    "type": kind,
                    "url": a.url,
                    "mediaType": a.media_type,
                    "name": a.name,
                    "summary": a.description
                })
            })
            .collect();

        let mut object = json!({
            "id": post.object_uri,
            "type": kind,
            "attributedTo": owner.url,
            "published": post.published_at.to_rfc3339(),
            "content": post.body_html,
            "to": to,
            "cc": cc,
            "context": post.conversation_id,
            "conversation": post.conversation_id,
            "tag": tags,
            "attachment": attachments
        });
        if !post.summary_html.is_empty() {
            object["summary"] = json!(post.summary_html);
            object["sensitive"] = json!(true);
        }
        if let Some(parent) = &post.reply_to_uri {
            object["inReplyTo"] = json!(parent);
        }
        if let Some(quote) = &post.quote_uri {
            object["quoteUrl"] = json!(quote);
        }
        object
    }

    pub fn create(owner: &LocalUser, post: &Post) -> Value {
        let (to, cc) = addressing(owner, post);
        json!({
            "@context": CONTEXT,
            "id": activity_id(owner, "create"),
            "type": "Create",
            "actor": owner.url,
            "published": post.published_at.to_rfc3339(),
            "to": to,
            "cc": cc,
            "object": object(owner, post)
        })
    }

    /// `post.object_uri` is the boosted object.
    pub fn announce(owner: &LocalUser, post: &Post) -> Value {
        let (to, cc) = addressing(owner, post);
        json!({
            "@context": CONTEXT,
            "id": activity_id(owner, "announce"),
            "type": "Announce",
            "actor": owner.url,
            "published": post.published_at.to_rfc3339(),
            "to": to,
            "cc": cc,
            "object": post.object_uri
        })
    }

    pub fn delete(owner: &LocalUser, post: &Post) -> Value {
        let (to, cc) = addressing(owner, post);
        json!({
            "@context": CONTEXT,
            "id": activity_id(owner, "delete"),
            "type": "Delete",
            "actor": owner.url,
            "to": to,
            "cc": cc,
            "object": {
                "id": post.object_uri,
                "type": "Tombstone"
            }
        })
    }

    pub fn follow(owner: &LocalUser, actor: &str) -> Value {
        json!({
            "@context": CONTEXT,
            "id": activity_id(owner, "follow"),
            "type": "Follow",
            "actor": owner.url,
            "to": [actor],
            "object": actor
        })
    }

    pub fn accept(owner: &LocalUser, follow: Value) -> Value {
        json!({
            "@context": CONTEXT,
            "id": activity_id(owner, "accept"),
            "type": "Accept",
            "actor": owner.url,
            "object": follow
        })
    }

    /// The activity announcing `post` to its recipients.
    pub fn for_post(owner: &LocalUser, post: &Post) -> Value {
        match post.kind {
            PostKind::Boost => announce(owner, post),
            PostKind::Delete => delete(owner, post),
            PostKind::Post | PostKind::Reply | PostKind::Poll | PostKind::Event => {
                create(owner, post)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{EntityId, PostFlags, PostKind};
    use crate::federation::key_cache::KeyResolver;
    use crate::federation::tracker::Tracker;
    use crate::federation::transport::MockTransport;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    async fn setup(transport: MockTransport) -> (DeliveryEngine, Arc<Database>, LocalUser, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(Database::connect(&temp_dir.path().join("d.db")).await.unwrap());
        let owner = LocalUser {
            id: EntityId::new().0,
            username: "admin".to_string(),
            display_name: "Admin".to_string(),
            url: "https://a.example/u/admin".to_string(),
            private_key_pem: "unused".to_string(),
            public_key_pem: "unused".to_string(),
            created_at: Utc::now(),
        };
        db.insert_user(&owner).await.unwrap();

        let transport: Arc<dyn Transport> = Arc::new(transport);
        let timeout = Duration::from_secs(5);
        let keys = Arc::new(KeyResolver::new(
            db.clone(),
            transport.clone(),
            16,
            Duration::from_secs(60),
            timeout,
        ));
        let boxes = Arc::new(BoxResolver::new(
            db.clone(),
            transport.clone(),
            keys,
            16,
            timeout,
        ));
        let (tracker, worker) = Tracker::new(db.clone());
        drop(worker);

        let engine = DeliveryEngine::new(db.clone(), transport, boxes, tracker, 4, timeout);
        (engine, db, owner, temp_dir)
    }

    fn shared_inbox() -> RecipientKey {
        RecipientKey::inbox("https://b.example/inbox")
    }

    fn local_post(owner: &LocalUser, audience: Vec<&str>) -> Post {
        let id = EntityId::new().0;
        Post {
            object_uri: owner.post_url(&id),
            id,
            owner_user_id: owner.id.clone(),
            kind: PostKind::Post,
            actor_uri: owner.url.clone(),
            original_actor_uri: None,
            reply_to_uri: None,
            quote_uri: None,
            conversation_id: "data:,missing-1".to_string(),
            published_at: Utc::now(),
            received_at: Utc::now(),
            origin_host: "a.example".to_string(),
            summary_html: String::new(),
            body_html: "<p>hi</p>".to_string(),
            is_public: Post::audience_is_public(
                &audience.iter().map(|a| a.to_string()).collect::<Vec<_>>(),
            ),
            audience: audience.into_iter().map(str::to_string).collect(),
            attachments: Vec::new(),
            hashtags: vec!["#tide".to_string()],
            mentions: Vec::new(),
            flags: PostFlags::default(),
        }
    }

    #[test]
    fn backoff_grows_and_ends() {
        let mut previous = Duration::ZERO;
        for tries in 1..=MAX_TRIES {
            let delay = backoff(tries).unwrap();
            assert!(delay >= previous, "delay shrank at try {tries}");
            previous = delay;
        }
        assert_eq!(backoff(1), Some(Duration::from_secs(300)));
        assert_eq!(backoff(MAX_TRIES), Some(Duration::from_secs(12 * 3600)));
        assert_eq!(backoff(MAX_TRIES + 1), None);
    }

    #[test]
    fn jitter_stays_within_a_tenth() {
        let base = Duration::from_secs(600);
        for _ in 0..50 {
            let at = next_attempt(base);
            let ahead = (at - Utc::now()).num_seconds();
            assert!((598..=660).contains(&ahead), "out of range: {ahead}");
        }
    }

    #[tokio::test]
    async fn direct_success_leaves_no_job() {
        let mut transport = MockTransport::new();
        transport
            .expect_post_signed()
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let (engine, db, owner, _dir) = setup(transport).await;

        let outcome = engine.deliver(&owner, &shared_inbox(), b"one").await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Delivered);
        assert_eq!(db.count_delivery_jobs().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failure_queues_and_later_messages_coalesce() {
        let mut transport = MockTransport::new();
        transport
            .expect_post_signed()
            .times(1)
            .returning(|_, _, _, _| Err(TransportError::Status(503)));
        let (engine, db, owner, _dir) = setup(transport).await;

        let first = engine.deliver(&owner, &shared_inbox(), b"one").await.unwrap();
        assert_eq!(first, DeliveryOutcome::Queued);
        let second = engine.deliver(&owner, &shared_inbox(), b"two").await.unwrap();
        assert_eq!(second, DeliveryOutcome::Coalesced);

        let job = db
            .get_delivery_job(&owner.id, &shared_inbox())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.messages, vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(job.tries, 0);
        assert!(job.not_before > Utc::now() + chrono::Duration::minutes(4));
        assert_eq!(db.count_delivery_jobs().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn refused_message_is_dropped() {
        let mut transport = MockTransport::new();
        transport
            .expect_post_signed()
            .returning(|_, _, _, _| Err(TransportError::Status(422)));
        let (engine, db, owner, _dir) = setup(transport).await;

        let outcome = engine.deliver(&owner, &shared_inbox(), b"one").await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Dropped);
        assert_eq!(db.count_delivery_jobs().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unresolvable_host_is_dead_lettered_immediately() {
        let mut transport = MockTransport::new();
        transport.expect_post_signed().returning(|_, _, _, _| {
            Err(TransportError::Dns {
                host: "b.example".to_string(),
                reason: "nxdomain".to_string(),
            })
        });
        let (engine, db, owner, _dir) = setup(transport).await;

        let outcome = engine.deliver(&owner, &shared_inbox(), b"one").await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::DeadLettered);
        assert_eq!(db.count_delivery_jobs().await.unwrap(), 0);
    }

    async fn due_job(db: &Database, owner: &LocalUser, messages: &[&[u8]]) {
        let past = Utc::now() - chrono::Duration::seconds(1);
        for message in messages {
            db.enqueue_delivery(&owner.id, &shared_inbox(), message, past)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn partial_flush_requeues_the_tail() {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let mut transport = MockTransport::new();
        let log = sent.clone();
        transport
            .expect_post_signed()
            .returning(move |_, _, body, _| {
                log.lock().unwrap().push(body.to_vec());
                if body == b"two" {
                    Err(TransportError::Status(503))
                } else {
                    Ok(())
                }
            });
        let (engine, db, owner, _dir) = setup(transport).await;
        due_job(&db, &owner, &[b"one", b"two", b"three"]).await;

        assert_eq!(engine.sweep().await.unwrap(), 1);

        assert_eq!(*sent.lock().unwrap(), vec![b"one".to_vec(), b"two".to_vec()]);
        let job = db
            .get_delivery_job(&owner.id, &shared_inbox())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.messages, vec![b"two".to_vec(), b"three".to_vec()]);
        assert_eq!(job.tries, 1);
        assert!(job.not_before > Utc::now());
    }

    #[tokio::test]
    async fn refused_message_does_not_block_the_batch() {
        let mut transport = MockTransport::new();
        transport
            .expect_post_signed()
            .times(3)
            .returning(|_, _, body, _| {
                if body == b"two" {
                    Err(TransportError::Status(400))
                } else {
                    Ok(())
                }
            });
        let (engine, db, owner, _dir) = setup(transport).await;
        due_job(&db, &owner, &[b"one", b"two", b"three"]).await;

        engine.sweep().await.unwrap();
        assert_eq!(db.count_delivery_jobs().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn job_is_dead_lettered_after_the_last_try() {
        let mut transport = MockTransport::new();
        transport
            .expect_post_signed()
            .times(1)
            .returning(|_, _, _, _| Err(TransportError::Timeout));
        let (engine, db, owner, _dir) = setup(transport).await;
        due_job(&db, &owner, &[b"one"]).await;

        let job = db
            .get_delivery_job(&owner.id, &shared_inbox())
            .await
            .unwrap()
            .unwrap();
        let past = Utc::now() - chrono::Duration::seconds(1);
        db.settle_delivery_job(&job.id, 0, Vec::new(), MAX_TRIES, past)
            .await
            .unwrap();

        let outcome = engine.flush_job(job).await.unwrap();
        assert_eq!(outcome, Some(DeliveryOutcome::DeadLettered));
        assert_eq!(db.count_delivery_jobs().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn jobs_not_yet_due_are_left_alone() {
        let mut transport = MockTransport::new();
        transport.expect_post_signed().never();
        let (engine, db, owner, _dir) = setup(transport).await;
        let later = Utc::now() + chrono::Duration::minutes(5);
        db.enqueue_delivery(&owner.id, &shared_inbox(), b"one", later)
            .await
            .unwrap();

        assert_eq!(engine.sweep().await.unwrap(), 0);
        assert_eq!(db.count_delivery_jobs().await.unwrap(), 1);
    }

    fn actor_doc(uri: &str, shared: Option<&str>) -> Vec<u8> {
        let mut doc = json!({
            "id": uri,
            "type": "Person",
            "inbox": format!("{uri}/inbox"),
            "outbox": format!("{uri}/outbox")
        });
        if let Some(shared) = shared {
            doc["endpoints"] = json!({"sharedInbox": shared});
        }
        serde_json::to_vec(&doc).unwrap()
    }

    #[tokio::test]
    async fn recipients_collapse_to_shared_inboxes() {
        let mut transport = MockTransport::new();
        transport.expect_fetch().returning(|url, _, _| match url {
            "https://b.example/u/bob" | "https://b.example/u/dave" => {
                Ok(actor_doc(url, Some("https://b.example/inbox")))
            }
            "https://c.example/u/carol" => Ok(actor_doc(url, None)),
            _ => Err(TransportError::Status(404)),
        });
        let (engine, db, owner, _dir) = setup(transport).await;
        db.add_subscriber(&owner.id, "https://b.example/u/dave")
            .await
            .unwrap();

        let followers = owner.followers_url();
        let post = local_post(
            &owner,
            vec![
                PUBLIC_COLLECTION,
                followers.as_str(),
                "https://b.example/u/bob",
                "https://c.example/u/carol",
                "%https://d.example/inbox",
                "https://a.example/u/admin",
                "",
            ],
        );

        let recipients = engine.recipients_for(&owner, &post).await.unwrap();
        let expected: BTreeSet<RecipientKey> = [
            RecipientKey::inbox("https://b.example/inbox"),
            RecipientKey::actor("https://c.example/u/carol"),
            RecipientKey::inbox("https://d.example/inbox"),
        ]
        .into_iter()
        .collect();
        assert_eq!(recipients, expected);
    }

    #[tokio::test]
    async fn private_posts_skip_subscribers() {
        let mut transport = MockTransport::new();
        transport
            .expect_fetch()
            .returning(|url, _, _| Ok(actor_doc(url, None)));
        let (engine, db, owner, _dir) = setup(transport).await;
        db.add_subscriber(&owner.id, "https://b.example/u/dave")
            .await
            .unwrap();

        let post = local_post(&owner, vec!["https://c.example/u/carol"]);
        let recipients = engine.recipients_for(&owner, &post).await.unwrap();
        assert_eq!(recipients.len(), 1);
        assert!(recipients.contains(&RecipientKey::actor("https://c.example/u/carol")));
    }

    #[tokio::test]
    async fn follow_adds_subscriber_and_sends_accept() {
        let accepted = Arc::new(StdMutex::new(Vec::new()));
        let log = accepted.clone();
        let mut transport = MockTransport::new();
        transport
            .expect_fetch()
            .returning(|url, _, _| Ok(actor_doc(url, None)));
        transport
            .expect_post_signed()
            .times(1)
            .returning(move |_, url, body, _| {
                log.lock().unwrap().push((url.to_string(), body.to_vec()));
                Ok(())
            });
        let (engine, db, owner, _dir) = setup(transport).await;

        let follow = json!({
            "id": "https://c.example/follows/1",
            "type": "Follow",
            "actor": "https://c.example/u/carol",
            "object": owner.url
        });
        let outcome = engine.accept_follow(&owner, &follow).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Delivered);
        assert_eq!(
            db.list_subscribers(&owner.id).await.unwrap(),
            vec!["https://c.example/u/carol".to_string()]
        );

        let accepted = accepted.lock().unwrap();
        assert_eq!(accepted[0].0, "https://c.example/u/carol/inbox");
        let body: Value = serde_json::from_slice(&accepted[0].1).unwrap();
        assert_eq!(body["type"], "Accept");
        assert_eq!(body["object"]["id"], "https://c.example/follows/1");

        assert!(engine
            .drop_subscriber(&owner, "https://c.example/u/carol")
            .await
            .unwrap());
    }

    #[test]
    fn builder_maps_kinds_to_activities() {
        let owner = LocalUser {
            id: "u".to_string(),
            username: "admin".to_string(),
            display_name: "Admin".to_string(),
            url: "https://a.example/u/admin".to_string(),
            private_key_pem: String::new(),
            public_key_pem: String::new(),
            created_at: Utc::now(),
        };
        let mut post = local_post(&owner, vec![PUBLIC_COLLECTION]);
        post.summary_html = "spoilers".to_string();

        let create = builder::for_post(&owner, &post);
        assert_eq!(create["type"], "Create");
        assert_eq!(create["object"]["type"], "Note");
        assert_eq!(create["object"]["sensitive"], true);
        assert_eq!(create["cc"][0], "https://a.example/u/admin/followers");

        post.kind = PostKind::Poll;
        assert_eq!(builder::for_post(&owner, &post)["object"]["type"], "Question");

        post.kind = PostKind::Boost;
        let announce = builder::for_post(&owner, &post);
        assert_eq!(announce["type"], "Announce");
        assert_eq!(announce["object"], post.object_uri.as_str());

        post.kind = PostKind::Delete;
        let delete = builder::for_post(&owner, &post);
        assert_eq!(delete["object"]["type"], "Tombstone");
    }
}
