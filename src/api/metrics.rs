//! Prometheus metrics endpoint

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder, TextEncoder};

use crate::AppState;
use crate::metrics::{DELIVERY_QUEUE_DEPTH, REGISTRY};

/// GET /metrics
///
/// The delivery queue gauge is refreshed from the database before
/// gathering, so it is current even between sweeps.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.db.count_delivery_jobs().await {
        Ok(depth) => DELIVERY_QUEUE_DEPTH.set(depth),
        Err(error) => tracing::warn!(%error, "Unable to count delivery jobs"),
    }

    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&REGISTRY.gather()) {
        Ok(text) => ([(header::CONTENT_TYPE, encoder.format_type())], text).into_response(),
        Err(error) => {
            tracing::error!(%error, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

/// Create metrics router
///
/// Exposes `/metrics`.
pub fn metrics_router() -> Router<AppState> {
    Router::new().route("/metrics", get(metrics_handler))
}
