//! Well-known endpoints
//!
//! - /.well-known/webfinger
//! - /.well-known/host-meta

use axum::{
    Router,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Json, Response},
    routing::get,
};
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;
use crate::federation::{JRD_ACCEPT, generate_webfinger_response, parse_handle};

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/webfinger
/// - GET /.well-known/host-meta
pub fn wellknown_router() -> Router<AppState> {
    Router::new()
        .route("/.well-known/webfinger", get(webfinger))
        .route("/.well-known/host-meta", get(host_meta))
}

#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: String,
}

/// GET /.well-known/webfinger
///
/// Query: ?resource=acct:user@domain
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<Response, AppError> {
    let (username, domain) = parse_handle(&query.resource)
        .ok_or_else(|| AppError::Validation("Invalid acct format".to_string()))?;

    if !domain.eq_ignore_ascii_case(&state.config.server.domain) {
        return Err(AppError::NotFound);
    }

    let user = state
        .db
        .get_user_by_username(username)
        .await?
        .ok_or(AppError::NotFound)?;

    let jrd = generate_webfinger_response(&user.username, &state.config.server.domain, &user.url);
    Ok(([(header::CONTENT_TYPE, JRD_ACCEPT)], Json(jrd)).into_response())
}

/// GET /.well-known/host-meta
///
/// XRD pointing older clients at the WebFinger endpoint.
async fn host_meta(State(state): State<AppState>) -> impl IntoResponse {
    let base_url = state.config.server.base_url();
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<XRD xmlns="http://docs.oasis-open.org/ns/xri/xrd-1.0">
  <Link rel="lrdd" template="{base_url}/.well-known/webfinger?resource={{uri}}"/>
</XRD>"#
    );

    ([(header::CONTENT_TYPE, "application/xrd+xml")], xml)
}
