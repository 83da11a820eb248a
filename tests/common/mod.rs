//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tempfile::TempDir;
use tidepool::data::{LocalUser, PUBLIC_COLLECTION};
use tidepool::federation::{SigningIdentity, Transport, TransportError, sign_request};
use tidepool::tasks::Supervisor;
use tidepool::{AppState, config};
use tokio::net::TcpListener;

pub const REMOTE: &str = "https://remote.test";
pub const LOCAL_DOMAIN: &str = "local.test";

/// In-memory stand-in for the network.
///
/// Serves published documents by exact URL and records signed posts.
#[derive(Default)]
pub struct FakeTransport {
    documents: Mutex<HashMap<String, Value>>,
    fetches: Mutex<HashMap<String, usize>>,
    posts: Mutex<Vec<(String, Value)>>,
    delay: Mutex<Option<Duration>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn publish(&self, url: &str, document: Value) {
        self.documents
            .lock()
            .unwrap()
            .insert(url.to_string(), document);
    }

    /// Delay every fetch, so concurrent lookups overlap.
    pub fn slow_down(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn fetch_count(&self, url: &str) -> usize {
        self.fetches.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn posts(&self) -> Vec<(String, Value)> {
        self.posts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn fetch(
        &self,
        url: &str,
        _accept: &str,
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        *self
            .fetches
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default() += 1;

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let document = self.documents.lock().unwrap().get(url).cloned();
        match document {
            Some(document) => Ok(serde_json::to_vec(&document).unwrap()),
            None => Err(TransportError::Status(404)),
        }
    }

    async fn post_signed(
        &self,
        _identity: &SigningIdentity,
        url: &str,
        body: &[u8],
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        let body = serde_json::from_slice(body).unwrap_or(Value::Null);
        self.posts.lock().unwrap().push((url.to_string(), body));
        Ok(())
    }
}

/// A remote actor with its own keypair, published on the fake network.
pub struct RemoteActor {
    pub id: String,
    pub private_key_pem: String,
    pub public_key_pem: String,
}

impl RemoteActor {
    pub fn new(transport: &FakeTransport, name: &str) -> Self {
        let (private_key_pem, public_key_pem) =
            tidepool::federation::generate_keypair(1024).unwrap();
        let actor = Self {
            id: format!("{REMOTE}/u/{name}"),
            private_key_pem,
            public_key_pem,
        };
        transport.publish(&actor.id, actor.document());
        actor
    }

    pub fn key_id(&self) -> String {
        format!("{}#key", self.id)
    }

    pub fn inbox(&self) -> String {
        format!("{}/inbox", self.id)
    }

    pub fn document(&self) -> Value {
        json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": self.id,
            "type": "Person",
            "inbox": self.inbox(),
            "outbox": format!("{}/outbox", self.id),
            "publicKey": {
                "id": self.key_id(),
                "owner": self.id,
                "publicKeyPem": self.public_key_pem
            }
        })
    }
}

/// A public note from `author`.
pub fn note(id: &str, author: &str, content: &str, in_reply_to: Option<&str>) -> Value {
    let mut note = json!({
        "id": id,
        "type": "Note",
        "attributedTo": author,
        "to": [PUBLIC_COLLECTION],
        "published": "2026-10-01T12:00:00Z",
        "content": content
    });
    if let Some(parent) = in_reply_to {
        note["inReplyTo"] = json!(parent);
    }
    note
}

pub fn create(actor: &str, object: Value) -> Value {
    let id = object["id"].as_str().unwrap_or_default().to_string();
    json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": format!("{id}/activity"),
        "type": "Create",
        "actor": actor,
        "object": object
    })
}

pub fn test_config(dir: &std::path::Path) -> config::AppConfig {
    config::AppConfig {
        server: config::ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            domain: LOCAL_DOMAIN.to_string(),
            protocol: "https".to_string(),
        },
        database: config::DatabaseConfig {
            path: dir.join("test.db"),
        },
        federation: config::FederationConfig {
            user_agent: "tidepool-test".to_string(),
            fast_timeout_secs: 5,
            slow_timeout_secs: 5,
            post_timeout_secs: 5,
            max_fetch_bytes: 1024 * 1024,
            max_inbox_bytes: 64 * 1024,
            max_concurrent_deliveries: 8,
            max_concurrent_transcodes: 2,
            allow_private_hosts: true,
            harvest_interval_secs: 0,
            archive_path: dir.join("unrecognized.jsonl"),
        },
        cache: config::CacheConfig {
            box_capacity: 100,
            key_capacity: 100,
            key_ttl_secs: 3600,
        },
        retention: config::RetentionConfig {
            public_feed_days: 7,
        },
        shutdown: config::ShutdownConfig { grace_secs: 5 },
        admin: config::AdminConfig {
            username: "admin".to_string(),
            display_name: "Admin".to_string(),
            follows: Vec::new(),
        },
        logging: config::LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub transport: Arc<FakeTransport>,
    pub admin: LocalUser,
    pub client: reqwest::Client,
    pub _supervisor: Supervisor,
    pub _temp_dir: TempDir,
}

impl TestServer {
    pub async fn new() -> Self {
        Self::with_transport(FakeTransport::new()).await
    }

    /// Start a server whose outbound traffic goes to `transport`.
    pub async fn with_transport(transport: Arc<FakeTransport>) -> Self {
        tidepool::metrics::init_metrics();

        let temp_dir = TempDir::new().unwrap();
        let config = test_config(temp_dir.path());

        let (state, tracker) = AppState::new(config, transport.clone()).await.unwrap();
        let supervisor = state.spawn_background(tracker);
        let admin = state.admin().await.unwrap();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());

        let app = tidepool::build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            transport,
            admin,
            client,
            _supervisor: supervisor,
            _temp_dir: temp_dir,
        }
    }

    /// Get base URL for requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// POST `activity` to `path`, signed with `key_id`.
    pub async fn post_signed(
        &self,
        path: &str,
        activity: &Value,
        key_id: &str,
        private_key_pem: &str,
    ) -> reqwest::Response {
        let url = self.url(path);
        let body = serde_json::to_vec(activity).unwrap();
        let signed = sign_request("POST", &url, Some(&body), None, private_key_pem, key_id).unwrap();

        self.client
            .post(&url)
            .header("Content-Type", "application/activity+json")
            .header("Date", signed.date)
            .header("Digest", signed.digest.unwrap())
            .header("Signature", signed.signature)
            .body(body)
            .send()
            .await
            .unwrap()
    }

    /// Deliver `activity` to the admin's inbox as `actor`.
    pub async fn deliver(&self, actor: &RemoteActor, activity: &Value) -> reqwest::Response {
        self.post_signed(
            "/u/admin/inbox",
            activity,
            &actor.key_id(),
            &actor.private_key_pem,
        )
        .await
    }

    /// GET `path`, signed with `key_id`.
    pub async fn get_signed(
        &self,
        path: &str,
        key_id: &str,
        private_key_pem: &str,
    ) -> reqwest::Response {
        let url = self.url(path);
        let signed = sign_request("GET", &url, None, None, private_key_pem, key_id).unwrap();

        self.client
            .get(&url)
            .header("Accept", "application/activity+json")
            .header("Date", signed.date)
            .header("Signature", signed.signature)
            .send()
            .await
            .unwrap()
    }
}

/// Poll `check` until it holds, for at most five seconds.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
