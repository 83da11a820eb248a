//! ActivityPub endpoints
//!
//! - Actor document
//! - Inbox (activity receiving)
//! - Local objects
//! - Outbox

use axum::body::Bytes;
use axum::extract::DefaultBodyLimit;
use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, Uri, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use tower_http::limit::RequestBodyLimitLayer;

use crate::AppState;
use crate::data::{LocalUser, origin_of};
use crate::error::AppError;
use crate::federation::{HARVEST_LIMIT, builder, is_activity_content_type, verify_inbound};
use crate::metrics::ACTIVITIES_RECEIVED;

/// Content type of served actor documents and objects.
pub const ACTIVITY_CONTENT_TYPE: &str = "application/activity+json";

/// Activity types acknowledged but not acted on.
const IGNORED_TYPES: [&str; 10] = [
    "Accept", "Reject", "Like", "EmojiReact", "Block", "Add", "Remove", "Move", "Flag", "Read",
];

/// Activity types counted under their own metric label.
const COUNTED_TYPES: [&str; 8] = [
    "Create", "Update", "Delete", "Announce", "Follow", "Undo", "Like", "Accept",
];

/// Create ActivityPub router
///
/// Routes:
/// - GET /u/:username - Actor document
/// - POST /u/:username/inbox - Inbox, bodies capped at `max_inbox_bytes`
/// - GET /u/:username/p/:id - Local post
/// - GET /u/:username/outbox - Recent public posts
pub fn activitypub_router(max_inbox_bytes: usize) -> Router<AppState> {
    Router::new()
        .route("/u/:username", get(actor))
        .route(
            "/u/:username/inbox",
            post(inbox)
                .layer::<_, std::convert::Infallible>(RequestBodyLimitLayer::new(max_inbox_bytes))
                .layer(DefaultBodyLimit::disable()),
        )
        .route("/u/:username/p/:id", get(object))
        .route("/u/:username/outbox", get(outbox))
}

fn activity_json(value: Value) -> Response {
    ([(header::CONTENT_TYPE, ACTIVITY_CONTENT_TYPE)], Json(value)).into_response()
}

async fn find_user(state: &AppState, username: &str) -> Result<LocalUser, AppError> {
    state
        .db
        .get_user_by_username(username)
        .await?
        .ok_or(AppError::NotFound)
}

fn request_target(uri: &Uri) -> &str {
    uri.path_and_query()
        .map(|target| target.as_str())
        .unwrap_or_else(|| uri.path())
}

/// `actor` of an activity, given as a URI or an object with `id`.
fn activity_actor(activity: &Value) -> Option<String> {
    match activity.get("actor")? {
        Value::String(actor) => Some(actor.clone()),
        Value::Object(actor) => actor.get("id")?.as_str().map(str::to_string),
        _ => None,
    }
}

fn object_id(activity: &Value) -> Option<&str> {
    match activity.get("object")? {
        Value::String(id) => Some(id),
        object => object.get("id")?.as_str(),
    }
}

/// GET /u/:username
///
/// Content-Type: application/activity+json
async fn actor(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    let user = find_user(&state, &username).await?;

    Ok(activity_json(json!({
        "@context": [
            "https://www.w3.org/ns/activitystreams",
            "https://w3id.org/security/v1"
        ],
        "type": "Person",
        "id": user.url,
        "preferredUsername": user.username,
        "name": user.display_name,
        "inbox": user.inbox_url(),
        "outbox": user.outbox_url(),
        "followers": user.followers_url(),
        "url": user.url,
        "publicKey": {
            "id": user.key_id(),
            "owner": user.url,
            "publicKeyPem": user.public_key_pem
        }
    })))
}

/// POST /u/:username/inbox
///
/// # Steps
/// 1. Check content type
/// 2. Verify HTTP Signature, refetching a stale cached key once
/// 3. Require the key owner to be the activity's actor
/// 4. Hand the activity to a worker task and answer 202
async fn inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let owner = find_user(&state, &username).await?;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !is_activity_content_type(content_type) {
        return Err(AppError::UnsupportedMediaType(content_type.to_string()));
    }

    let sender = verify_inbound(&state.keys, "POST", request_target(&uri), &headers, Some(&body))
        .await
        .inspect_err(|error| tracing::info!(%error, "Rejecting unverified delivery"))?;

    let activity: Value = serde_json::from_slice(&body).map_err(|e| {
        tracing::debug!(body = %String::from_utf8_lossy(&body), "Unparseable activity");
        AppError::Protocol(format!("invalid JSON: {e}"))
    })?;

    let actor = activity_actor(&activity)
        .ok_or_else(|| AppError::Protocol("activity has no actor".to_string()))?;
    if actor != sender.owner {
        tracing::info!(%actor, key_owner = %sender.owner, "Signature key does not belong to actor");
        return Err(AppError::InvalidSignature(
            "key owner does not match actor".to_string(),
        ));
    }

    let kind = activity
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let label = if COUNTED_TYPES.contains(&kind.as_str()) {
        kind.as_str()
    } else {
        "other"
    };
    ACTIVITIES_RECEIVED.with_label_values(&[label]).inc();

    let work = state.inflight.enter();
    tokio::spawn(async move {
        let _work = work;
        dispatch(&state, &owner, &activity, &actor, &kind).await;
    });

    Ok(StatusCode::ACCEPTED)
}

async fn dispatch(state: &AppState, owner: &LocalUser, activity: &Value, actor: &str, kind: &str) {
    let result = match kind {
        "Follow" if object_id(activity) == Some(owner.url.as_str()) => state
            .delivery
            .accept_follow(owner, activity)
            .await
            .map(|_| ()),
        "Follow" => {
            tracing::debug!(%actor, "Ignoring Follow of someone else");
            Ok(())
        }
        "Undo" => {
            let undone = activity.get("object").and_then(|object| object.get("type"));
            if undone.and_then(Value::as_str) == Some("Follow") {
                state.delivery.drop_subscriber(owner, actor).await.map(|_| ())
            } else {
                Ok(())
            }
        }
        kind if IGNORED_TYPES.contains(&kind) => Ok(()),
        _ => state
            .normalizer
            .normalize(activity, &origin_of(actor), owner)
            .await
            .map(|_| ()),
    };

    if let Err(error) = result {
        tracing::info!(%actor, %kind, %error, "Inbound activity failed");
        tracing::debug!(%activity, "Failed activity");
    }
}

/// GET /u/:username/p/:id
///
/// Signed fetches are remembered so later updates reach the fetcher.
async fn object(
    State(state): State<AppState>,
    Path((username, id)): Path<(String, String)>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let user = find_user(&state, &username).await?;
    let post = state
        .db
        .get_post(&user.id, &id)
        .await?
        .filter(|post| post.is_public && post.object_uri == user.post_url(&id))
        .ok_or(AppError::NotFound)?;

    if headers.contains_key("signature") {
        match verify_inbound(&state.keys, "GET", request_target(&uri), &headers, None).await {
            Ok(sender) => state.tracker.record(&post.object_uri, &sender.owner),
            Err(error) => tracing::debug!(%error, "Unverified signed fetch"),
        }
    }

    let mut object = builder::object(&user, &post);
    object["@context"] = json!("https://www.w3.org/ns/activitystreams");
    Ok(activity_json(object))
}

/// GET /u/:username/outbox
///
/// The user's own recent public posts.
async fn outbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    let user = find_user(&state, &username).await?;
    let posts = state
        .db
        .list_public_posts_by_actor(&user.id, &user.url, HARVEST_LIMIT as i64)
        .await?;

    let items: Vec<Value> = posts
        .iter()
        .map(|post| builder::for_post(&user, post))
        .collect();

    Ok(activity_json(json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "OrderedCollection",
        "id": user.outbox_url(),
        "totalItems": items.len(),
        "orderedItems": items
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actor_may_be_embedded() {
        let activity = json!({"actor": {"id": "https://b.example/u/bob", "type": "Person"}});
        assert_eq!(
            activity_actor(&activity).as_deref(),
            Some("https://b.example/u/bob")
        );
        assert_eq!(activity_actor(&json!({"actor": 7})), None);
    }

    #[test]
    fn object_id_reads_uri_or_embedded_object() {
        assert_eq!(
            object_id(&json!({"object": "https://a.example/u/admin"})),
            Some("https://a.example/u/admin")
        );
        assert_eq!(
            object_id(&json!({"object": {"id": "https://b.example/follows/1"}})),
            Some("https://b.example/follows/1")
        );
    }

    #[test]
    fn request_target_keeps_query() {
        let uri: Uri = "/u/admin/inbox?x=1".parse().unwrap();
        assert_eq!(request_target(&uri), "/u/admin/inbox?x=1");
    }
}
