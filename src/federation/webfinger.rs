//! WebFinger
//!
//! Resolves `user@host` handles to actor URIs, and describes local users.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::transport::{JRD_ACCEPT, Transport};
use crate::data::{Database, FactFlavor};
use crate::error::AppError;

/// Link types that point at an actor document.
const ACTOR_LINK_TYPES: [&str; 2] = [
    "application/activity+json",
    "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"",
];

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    #[serde(default)]
    pub links: Vec<WebFingerLink>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

impl WebFingerResponse {
    /// The `rel=self` link with an actor media type.
    pub fn actor_uri(&self) -> Option<&str> {
        self.links
            .iter()
            .filter(|link| link.rel == "self")
            .find(|link| {
                link.link_type
                    .as_deref()
                    .is_some_and(|kind| ACTOR_LINK_TYPES.contains(&kind))
            })
            .and_then(|link| link.href.as_deref())
    }
}

/// Split `user@host`, tolerating `acct:` and a leading `@`.
pub fn parse_handle(handle: &str) -> Option<(&str, &str)> {
    let handle = handle.trim();
    let handle = handle.strip_prefix("acct:").unwrap_or(handle);
    let handle = handle.strip_prefix('@').unwrap_or(handle);
    let (user, host) = handle.split_once('@')?;
    if user.is_empty() || host.is_empty() || host.contains(['/', '@']) {
        return None;
    }
    Some((user, host))
}

/// Resolve a handle to an actor URI.
///
/// Results are cached as `handle` facts. `Ok(None)` means the host answered
/// but named no usable actor, or could not be reached.
pub async fn resolve_webfinger(
    db: &Database,
    transport: &dyn Transport,
    handle: &str,
    timeout: Duration,
) -> Result<Option<String>, AppError> {
    let (user, host) = parse_handle(handle)
        .ok_or_else(|| AppError::Validation(format!("not a handle: {handle}")))?;
    let name = format!("{user}@{host}");

    if let Some(fact) = db.get_fact(&name, FactFlavor::Handle).await? {
        crate::metrics::observe_cache("handle", true);
        return Ok(Some(fact.info));
    }
    crate::metrics::observe_cache("handle", false);

    let resource = urlencoding::encode(&format!("acct:{name}")).into_owned();
    let url = format!("https://{host}/.well-known/webfinger?resource={resource}");

    let body = match transport.fetch(&url, JRD_ACCEPT, timeout).await {
        Ok(body) => body,
        Err(error) => {
            tracing::info!(%name, %error, "WebFinger lookup failed");
            return Ok(None);
        }
    };
    let response: WebFingerResponse = match serde_json::from_slice(&body) {
        Ok(response) => response,
        Err(error) => {
            tracing::info!(%name, %error, "Unreadable WebFinger response");
            return Ok(None);
        }
    };

    let Some(actor) = response.actor_uri().map(str::to_string) else {
        tracing::info!(%name, "WebFinger response has no actor link");
        return Ok(None);
    };

    db.save_fact(&name, FactFlavor::Handle, &actor).await?;
    Ok(Some(actor))
}

/// WebFinger response for a local account.
pub fn generate_webfinger_response(username: &str, domain: &str, actor_url: &str) -> WebFingerResponse {
    WebFingerResponse {
        subject: format!("acct:{username}@{domain}"),
        aliases: Some(vec![actor_url.to_string()]),
        links: vec![WebFingerLink {
            rel: "self".to_string(),
            link_type: Some("application/activity+json".to_string()),
            href: Some(actor_url.to_string()),
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::transport::{MockTransport, TransportError};
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn handles_parse_with_prefixes() {
        assert_eq!(parse_handle("bob@b.example"), Some(("bob", "b.example")));
        assert_eq!(parse_handle("@bob@b.example"), Some(("bob", "b.example")));
        assert_eq!(parse_handle("acct:bob@b.example"), Some(("bob", "b.example")));
        assert_eq!(parse_handle("bob"), None);
        assert_eq!(parse_handle("https://b.example/u/bob"), None);
    }

    #[test]
    fn picks_the_activity_self_link() {
        let response: WebFingerResponse = serde_json::from_value(json!({
            "subject": "acct:bob@b.example",
            "links": [
                {"rel": "http://webfinger.net/rel/profile-page", "type": "text/html", "href": "https://b.example/@bob"},
                {"rel": "self", "type": "text/html", "href": "https://b.example/@bob"},
                {"rel": "self", "type": "application/activity+json", "href": "https://b.example/u/bob"}
            ]
        }))
        .unwrap();
        assert_eq!(response.actor_uri(), Some("https://b.example/u/bob"));
    }

    #[tokio::test]
    async fn resolves_once_then_serves_the_fact() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::connect(&temp_dir.path().join("w.db")).await.unwrap();

        let mut transport = MockTransport::new();
        transport
            .expect_fetch()
            .withf(|url, accept, _| {
                url == "https://b.example/.well-known/webfinger?resource=acct%3Abob%40b.example"
                    && accept == JRD_ACCEPT
            })
            .times(1)
            .returning(|_, _, _| {
                Ok(serde_json::to_vec(&json!({
                    "subject": "acct:bob@b.example",
                    "links": [{"rel": "self", "type": "application/activity+json", "href": "https://b.example/u/bob"}]
                }))
                .unwrap())
            });

        for _ in 0..2 {
            let actor = resolve_webfinger(&db, &transport, "@bob@b.example", Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(actor.as_deref(), Some("https://b.example/u/bob"));
        }
    }

    #[tokio::test]
    async fn unreachable_host_is_not_cached() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::connect(&temp_dir.path().join("w.db")).await.unwrap();

        let mut transport = MockTransport::new();
        transport
            .expect_fetch()
            .times(2)
            .returning(|_, _, _| Err(TransportError::Timeout));

        for _ in 0..2 {
            let actor = resolve_webfinger(&db, &transport, "bob@b.example", Duration::from_secs(5))
                .await
                .unwrap();
            assert!(actor.is_none());
        }
    }
}
