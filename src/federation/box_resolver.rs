//! Actor box resolution
//!
//! Maps an actor URI to its inbox, outbox and optional shared inbox.
//! Same tiering as the key resolver: memory, then the `boxes` fact, then
//! the actor document, with one fetch per actor at a time.

use moka::future::Cache;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::key_cache::{KeyResolver, extract_public_key};
use super::single_flight::SingleFlight;
use super::transport::{ACTIVITY_ACCEPT, Transport};
use crate::data::{Database, FactFlavor, origin_of};
use crate::error::AppError;

/// Actor types we deliver to and accept keys from.
const RESOLVABLE_ACTOR_TYPES: [&str; 3] = ["Person", "Application", "Service"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorBoxes {
    pub inbox: String,
    pub outbox: String,
    pub shared_inbox: Option<String>,
}

impl ActorBoxes {
    /// Space separated `inbox outbox shared`; missing shared inbox is empty.
    fn to_fact(&self) -> String {
        format!(
            "{} {} {}",
            self.inbox,
            self.outbox,
            self.shared_inbox.as_deref().unwrap_or("")
        )
    }

    fn from_fact(info: &str) -> Option<Self> {
        let mut parts = info.split(' ');
        let inbox = parts.next().filter(|s| !s.is_empty())?.to_string();
        let outbox = parts.next().unwrap_or_default().to_string();
        let shared_inbox = parts
            .next()
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        Some(Self {
            inbox,
            outbox,
            shared_inbox,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Endpoints {
    shared_inbox: Option<String>,
}

/// The parts of an actor document the engine relies on.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorDocument {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub inbox: String,
    #[serde(default)]
    pub outbox: String,
    #[serde(default)]
    endpoints: Option<Endpoints>,
}

impl ActorDocument {
    pub fn is_resolvable(&self) -> bool {
        RESOLVABLE_ACTOR_TYPES.contains(&self.kind.as_str())
    }

    pub fn boxes(&self) -> ActorBoxes {
        ActorBoxes {
            inbox: self.inbox.clone(),
            outbox: self.outbox.clone(),
            shared_inbox: self
                .endpoints
                .as_ref()
                .and_then(|endpoints| endpoints.shared_inbox.clone())
                .filter(|shared| !shared.is_empty()),
        }
    }
}

pub struct BoxResolver {
    db: Arc<Database>,
    transport: Arc<dyn Transport>,
    keys: Arc<KeyResolver>,
    memory: Cache<String, ActorBoxes>,
    flight: SingleFlight<String, Result<Option<ActorBoxes>, String>>,
    timeout: Duration,
}

impl BoxResolver {
    pub fn new(
        db: Arc<Database>,
        transport: Arc<dyn Transport>,
        keys: Arc<KeyResolver>,
        capacity: u64,
        timeout: Duration,
    ) -> Self {
        Self {
            db,
            transport,
            keys,
            memory: Cache::builder().max_capacity(capacity).build(),
            flight: SingleFlight::new(),
            timeout,
        }
    }

    /// Boxes for `actor`, or `None` when it cannot be resolved.
    pub async fn resolve(&self, actor: &str) -> Result<Option<ActorBoxes>, AppError> {
        if let Some(boxes) = self.memory.get(actor).await {
            crate::metrics::observe_cache("boxes", true);
            return Ok(Some(boxes));
        }
        crate::metrics::observe_cache("boxes", false);

        self.flight
            .run(actor.to_string(), || async {
                self.load(actor).await.map_err(|e| e.to_string())
            })
            .await
            .map_err(|message| AppError::Internal(anyhow::anyhow!(message)))
    }

    async fn load(&self, actor: &str) -> Result<Option<ActorBoxes>, AppError> {
        if let Some(fact) = self.db.get_fact(actor, FactFlavor::Boxes).await? {
            if let Some(boxes) = ActorBoxes::from_fact(&fact.info) {
                self.memory.insert(actor.to_string(), boxes.clone()).await;
                return Ok(Some(boxes));
            }
        }

        let body = match self.transport.fetch(actor, ACTIVITY_ACCEPT, self.timeout).await {
            Ok(body) => body,
            Err(error) => {
                tracing::info!(%actor, %error, "Failed to fetch actor");
                return Ok(None);
            }
        };

        let doc: Value = match serde_json::from_slice(&body) {
            Ok(doc) => doc,
            Err(error) => {
                tracing::info!(%actor, %error, "Actor document is not JSON");
                return Ok(None);
            }
        };

        self.ingest(actor, &doc).await
    }

    /// Store the boxes and key published by an actor document.
    ///
    /// `actor` is the URI the document was fetched from; the document must
    /// describe that actor.
    pub async fn ingest(&self, actor: &str, doc: &Value) -> Result<Option<ActorBoxes>, AppError> {
        let parsed = match ActorDocument::deserialize(doc) {
            Ok(parsed) => parsed,
            Err(error) => {
                tracing::info!(%actor, %error, "Unusable actor document");
                return Ok(None);
            }
        };

        if !parsed.is_resolvable() {
            tracing::debug!(%actor, kind = %parsed.kind, "Actor type is not resolvable");
            return Ok(None);
        }
        if parsed.id != actor || origin_of(&parsed.inbox) != origin_of(actor) {
            tracing::warn!(%actor, id = %parsed.id, "Actor document does not match its URI");
            return Ok(None);
        }

        let boxes = parsed.boxes();
        self.db
            .save_fact(actor, FactFlavor::Boxes, &boxes.to_fact())
            .await?;
        self.memory.insert(actor.to_string(), boxes.clone()).await;

        if let Some(key) = extract_public_key(doc, None) {
            if key.owner == actor && origin_of(&key.key_id) == origin_of(actor) {
                self.keys.remember(key).await?;
            }
        }

        Ok(Some(boxes))
    }

    /// Forget everything cached about `actor`.
    pub async fn invalidate(&self, actor: &str) -> Result<(), AppError> {
        self.memory.invalidate(actor).await;
        self.db.delete_fact(actor, FactFlavor::Boxes).await
    }
}
