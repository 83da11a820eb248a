//! Public Key Caching
//!
//! Resolves a signature `keyId` to its PEM through three tiers: the memory
//! cache, the persisted `pubkey` fact, then the network. Concurrent lookups
//! for one key share a single fetch. Lookups that fail are remembered in
//! memory only, for at most [`NEGATIVE_TTL`].

use chrono::Utc;
use moka::Expiry;
use moka::future::Cache;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::single_flight::SingleFlight;
use super::transport::{ACTIVITY_ACCEPT, Transport};
use crate::data::{Database, FactFlavor, origin_of};
use crate::error::AppError;

/// Longest a failed lookup is remembered before the key is fetched again.
pub const NEGATIVE_TTL: Duration = Duration::from_secs(10 * 60);

/// Age after which persisted key facts are pruned.
pub const KEY_FACT_MAX_AGE: chrono::Duration = chrono::Duration::days(3);

/// A usable public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyEntry {
    pub key_id: String,
    /// Actor that owns the key
    pub owner: String,
    pub pem: String,
}

impl PublicKeyEntry {
    fn to_fact(&self) -> String {
        format!("{}\n{}", self.owner, self.pem)
    }

    fn from_fact(key_id: &str, info: &str) -> Option<Self> {
        let (owner, pem) = info.split_once('\n')?;
        Some(Self {
            key_id: key_id.to_string(),
            owner: owner.to_string(),
            pem: pem.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyEntry {
    Known(PublicKeyEntry),
    /// Negative result; the key could not be fetched
    Failed,
}

/// Result of a key lookup.
#[derive(Debug, Clone)]
pub struct KeyLookup {
    pub entry: KeyEntry,
    /// True when served from memory or the persisted fact
    pub from_cache: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublicKeyDocument {
    id: String,
    owner: String,
    public_key_pem: String,
}

/// Find `key_id` in an actor document or a bare key document.
///
/// Actors may publish `publicKey` as an object or an array.
pub fn extract_public_key(doc: &Value, key_id: Option<&str>) -> Option<PublicKeyEntry> {
    let candidates: Vec<&Value> = match doc.get("publicKey") {
        Some(Value::Array(keys)) => keys.iter().collect(),
        Some(key @ Value::Object(_)) => vec![key],
        _ if doc.get("publicKeyPem").is_some() => vec![doc],
        _ => Vec::new(),
    };

    candidates
        .into_iter()
        .filter_map(|candidate| serde_json::from_value::<PublicKeyDocument>(candidate.clone()).ok())
        .find(|key| key_id.is_none_or(|wanted| key.id == wanted))
        .map(|key| PublicKeyEntry {
            key_id: key.id,
            owner: key.owner,
            pem: key.public_key_pem,
        })
}

/// Known keys live for the configured TTL, failures for less.
struct KeyExpiry {
    ttl: Duration,
}

impl Expiry<String, KeyEntry> for KeyExpiry {
    fn expire_after_create(&self, _key_id: &String, entry: &KeyEntry, _created_at: Instant) -> Option<Duration> {
        match entry {
            KeyEntry::Known(_) => Some(self.ttl),
            KeyEntry::Failed => Some(self.ttl.min(NEGATIVE_TTL)),
        }
    }

    fn expire_after_update(
        &self,
        key_id: &String,
        entry: &KeyEntry,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        self.expire_after_create(key_id, entry, updated_at)
    }
}

/// Public key resolver
pub struct KeyResolver {
    db: Arc<Database>,
    transport: Arc<dyn Transport>,
    memory: Cache<String, KeyEntry>,
    flight: SingleFlight<String, Result<KeyLookup, String>>,
    timeout: Duration,
}

impl KeyResolver {
    /// # Arguments
    /// * `capacity` - Maximum keys held in memory
    /// * `ttl` - Memory TTL of known keys; persisted facts outlive it
    /// * `timeout` - Network timeout for key fetches
    pub fn new(
        db: Arc<Database>,
        transport: Arc<dyn Transport>,
        capacity: u64,
        ttl: Duration,
        timeout: Duration,
    ) -> Self {
        let memory = Cache::builder()
            .max_capacity(capacity)
            .expire_after(KeyExpiry { ttl })
            .build();

        Self {
            db,
            transport,
            memory,
            flight: SingleFlight::new(),
            timeout,
        }
    }

    /// Look up the key for `key_id`.
    pub async fn get(&self, key_id: &str) -> Result<KeyLookup, AppError> {
        if let Some(entry) = self.memory.get(key_id).await {
            crate::metrics::observe_cache("pubkey", true);
            return Ok(KeyLookup {
                entry,
                from_cache: true,
            });
        }
        crate::metrics::observe_cache("pubkey", false);

        self.flight
            .run(key_id.to_string(), || async {
                self.load(key_id).await.map_err(|e| e.to_string())
            })
            .await
            .map_err(|message| AppError::Internal(anyhow::anyhow!(message)))
    }

    async fn load(&self, key_id: &str) -> Result<KeyLookup, AppError> {
        if let Some(fact) = self.db.get_fact(key_id, FactFlavor::PubKey).await? {
            if let Some(known) = PublicKeyEntry::from_fact(key_id, &fact.info) {
                let entry = KeyEntry::Known(known);
                self.memory.insert(key_id.to_string(), entry.clone()).await;
                return Ok(KeyLookup {
                    entry,
                    from_cache: true,
                });
            }
            tracing::warn!(%key_id, "Discarding unreadable key fact");
        }

        let entry = match self.fetch(key_id).await {
            Ok(entry) => {
                self.db
                    .save_fact(key_id, FactFlavor::PubKey, &entry.to_fact())
                    .await?;
                KeyEntry::Known(entry)
            }
            Err(reason) => {
                tracing::info!(%key_id, %reason, "Key lookup failed; remembering negative result");
                KeyEntry::Failed
            }
        };

        self.memory.insert(key_id.to_string(), entry.clone()).await;
        Ok(KeyLookup {
            entry,
            from_cache: false,
        })
    }

    async fn fetch(&self, key_id: &str) -> Result<PublicKeyEntry, String> {
        let document_url = key_id.split('#').next().unwrap_or(key_id);
        let body = self
            .transport
            .fetch(document_url, ACTIVITY_ACCEPT, self.timeout)
            .await
            .map_err(|e| e.to_string())?;
        let doc: Value = serde_json::from_slice(&body).map_err(|e| e.to_string())?;

        let entry = extract_public_key(&doc, Some(key_id))
            .ok_or_else(|| "document does not publish that key".to_string())?;

        let origin = origin_of(key_id);
        if origin_of(&entry.key_id) != origin || origin_of(&entry.owner) != origin {
            return Err(format!(
                "key {} owned by {} is not from {origin}",
                entry.key_id, entry.owner
            ));
        }

        Ok(entry)
    }

    /// Record a key learned from an actor document fetched elsewhere.
    pub async fn remember(&self, entry: PublicKeyEntry) -> Result<(), AppError> {
        self.db
            .save_fact(&entry.key_id, FactFlavor::PubKey, &entry.to_fact())
            .await?;
        self.memory
            .insert(entry.key_id.clone(), KeyEntry::Known(entry))
            .await;
        Ok(())
    }

    /// Drop the cached key from memory and the fact store.
    pub async fn evict(&self, key_id: &str) -> Result<(), AppError> {
        self.memory.invalidate(key_id).await;
        self.db.delete_fact(key_id, FactFlavor::PubKey).await?;
        tracing::debug!(%key_id, "Evicted public key");
        Ok(())
    }

    /// Prune persisted key facts older than [`KEY_FACT_MAX_AGE`].
    pub async fn prune(&self) -> Result<u64, AppError> {
        let pruned = self
            .db
            .prune_facts(FactFlavor::PubKey, Utc::now() - KEY_FACT_MAX_AGE)
            .await?;
        if pruned > 0 {
            tracing::info!(pruned, "Pruned stale public key facts");
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::transport::{MockTransport, TransportError};
    use serde_json::json;
    use tempfile::TempDir;

    const KEY_ID: &str = "https://b.example/u/alice#key";

    #[tokio::test]
    async fn failed_lookup_is_retried_after_memory_expiry() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::connect(&dir.path().join("k.db")).await.unwrap());

        let mut transport = MockTransport::new();
        let mut seq = mockall::Sequence::new();
        transport
            .expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Err(TransportError::Timeout));
        transport
            .expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| {
                Ok(serde_json::to_vec(&json!({
                    "id": "https://b.example/u/alice",
                    "type": "Person",
                    "publicKey": {
                        "id": KEY_ID,
                        "owner": "https://b.example/u/alice",
                        "publicKeyPem": "PEM"
                    }
                }))
                .unwrap())
            });

        let keys = KeyResolver::new(
            db.clone(),
            Arc::new(transport),
            16,
            Duration::from_secs(1),
            Duration::from_secs(5),
        );

        let first = keys.get(KEY_ID).await.unwrap();
        assert_eq!(first.entry, KeyEntry::Failed);
        assert!(!first.from_cache);
        assert!(db.get_fact(KEY_ID, FactFlavor::PubKey).await.unwrap().is_none());
        assert_eq!(keys.get(KEY_ID).await.unwrap().entry, KeyEntry::Failed);

        tokio::time::sleep(Duration::from_millis(1500)).await;

        let second = keys.get(KEY_ID).await.unwrap();
        assert!(!second.from_cache);
        match second.entry {
            KeyEntry::Known(entry) => assert_eq!(entry.pem, "PEM"),
            KeyEntry::Failed => panic!("key should be refetched once the negative entry expires"),
        }
    }

    #[test]
    fn extracts_key_from_actor_object_and_array() {
        let actor = json!({
            "id": "https://b.example/u/alice",
            "type": "Person",
            "publicKey": {
                "id": "https://b.example/u/alice#key",
                "owner": "https://b.example/u/alice",
                "publicKeyPem": "PEM"
            }
        });
        let entry = extract_public_key(&actor, Some("https://b.example/u/alice#key")).unwrap();
        assert_eq!(entry.owner, "https://b.example/u/alice");

        let multi = json!({
            "publicKey": [
                {"id": "https://b.example/u/alice#old", "owner": "https://b.example/u/alice", "publicKeyPem": "OLD"},
                {"id": "https://b.example/u/alice#new", "owner": "https://b.example/u/alice", "publicKeyPem": "NEW"}
            ]
        });
        let entry = extract_public_key(&multi, Some("https://b.example/u/alice#new")).unwrap();
        assert_eq!(entry.pem, "NEW");
        assert!(extract_public_key(&multi, Some("https://b.example/u/alice#gone")).is_none());
    }

    #[test]
    fn extracts_bare_key_document() {
        let key = json!({
            "id": "https://b.example/keys/1",
            "owner": "https://b.example/u/alice",
            "publicKeyPem": "PEM"
        });
        assert!(extract_public_key(&key, Some("https://b.example/keys/1")).is_some());
    }

    #[test]
    fn fact_encoding_keeps_multiline_pem() {
        let entry = PublicKeyEntry {
            key_id: "https://b.example/u/alice#key".to_string(),
            owner: "https://b.example/u/alice".to_string(),
            pem: "-----BEGIN-----\nAAAA\n-----END-----".to_string(),
        };
        let decoded = PublicKeyEntry::from_fact(&entry.key_id, &entry.to_fact()).unwrap();
        assert_eq!(decoded, entry);
    }
}
