//! Error types for Tidepool
//!
//! All errors in the engine are converted to `AppError`,
//! which implements `IntoResponse` for HTTP error responses.
//! Protocol failures are answered with a generic body so peers
//! cannot use the response to map out the verifier.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Authentication required (401)
    #[error("Authentication required")]
    Unauthorized,

    /// Signature verification failed (401)
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// Malformed or disallowed peer input (400)
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Object claimed by a host other than the one it came from (400)
    #[error("Origin mismatch: {object_uri} is not from {origin}")]
    OriginMismatch { object_uri: String, origin: String },

    /// Content type outside the accept list (406)
    #[error("Unsupported content type: {0}")]
    UnsupportedMediaType(String),

    /// Local validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Federation error (502)
    #[error("Federation error: {0}")]
    Federation(String),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<crate::federation::TransportError> for AppError {
    fn from(err: crate::federation::TransportError) -> Self {
        AppError::Federation(err.to_string())
    }
}

impl AppError {
    /// Short label used for the error metric.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound => "not_found",
            AppError::Unauthorized => "unauthorized",
            AppError::InvalidSignature(_) => "invalid_signature",
            AppError::Protocol(_) => "protocol",
            AppError::OriginMismatch { .. } => "origin_mismatch",
            AppError::UnsupportedMediaType(_) => "unsupported_media_type",
            AppError::Validation(_) => "validation",
            AppError::Database(_) => "database",
            AppError::HttpClient(_) => "http_client",
            AppError::Federation(_) => "federation",
            AppError::Config(_) => "config",
            AppError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_message) = match &self {
            AppError::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::Unauthorized | AppError::InvalidSignature(_) => {
                (StatusCode::UNAUTHORIZED, "Authentication required".to_string())
            }
            AppError::Protocol(_) | AppError::OriginMismatch { .. } => {
                (StatusCode::BAD_REQUEST, "Request rejected".to_string())
            }
            AppError::UnsupportedMediaType(_) => (
                StatusCode::NOT_ACCEPTABLE,
                "Unsupported content type".to_string(),
            ),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Federation(_) | AppError::HttpClient(_) => {
                (StatusCode::BAD_GATEWAY, "Upstream error".to_string())
            }
            AppError::Database(_) | AppError::Config(_) | AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        match status {
            StatusCode::INTERNAL_SERVER_ERROR | StatusCode::BAD_GATEWAY => {
                tracing::error!(error = %self, "request failed");
            }
            _ => tracing::debug!(error = %self, "request rejected"),
        }

        crate::metrics::ERRORS_TOTAL
            .with_label_values(&[self.kind()])
            .inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
