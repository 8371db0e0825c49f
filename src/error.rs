//! Crate-wide error taxonomy
//!
//! Individual components surface the narrowest error kind they can identify
//! through their own `thiserror` enums; everything converges on [`AppError`]
//! at the service boundary, where each kind maps to exactly one HTTP status.
//!
//! The write pipeline never surfaces errors to an async caller that already
//! received a 2xx; those are reflected through cache flags and sync-log
//! entries instead (see `sync`).

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::json;
use thiserror::Error;

/// Result alias used throughout the crate
pub type AppResult<T> = Result<T, AppError>;

/// Service-level error taxonomy
///
/// Variants carry owned strings so errors can be fanned out to every waiter
/// of a single-flight load.
#[derive(Error, Debug, Clone)]
pub enum AppError {
    /// Payload or query string fails the declared schema (400)
    #[error("Validation failed: {0}")]
    Validation(String),

    /// No such entity (404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency check failed (409); carries the current
    /// server-side state for the client to rebase on
    #[error("Version mismatch on {entity_id}")]
    VersionMismatch {
        /// Entity the stale write targeted
        entity_id: String,
        /// Current upstream `updatedAt`
        current_updated_at: String,
        /// Current server-side state
        current: serde_json::Value,
    },

    /// Authentication failed (401)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated but not allowed (403)
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Upstream 429 or local limiter overflow (429)
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Upstream 5xx or transport failure after the retry budget (502)
    #[error("Upstream failure: {0}")]
    Upstream(String),

    /// Deadline exceeded (504)
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Unclassified (500)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// HTTP status this kind maps to
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::VersionMismatch { .. } => StatusCode::CONFLICT,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error code for the response envelope
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::VersionMismatch { .. } => "VERSION_MISMATCH",
            AppError::Unauthorized(_) => "UNAUTHORIZED",
            AppError::Forbidden(_) => "FORBIDDEN",
            AppError::RateLimited(_) => "RATE_LIMITED",
            AppError::Upstream(_) => "UPSTREAM_FAILURE",
            AppError::Timeout(_) => "TIMEOUT",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        let body = match &self {
            AppError::VersionMismatch {
                entity_id,
                current_updated_at,
                current,
            } => json!({
                "error": {
                    "code": self.code(),
                    "message": self.to_string(),
                },
                "conflict": {
                    "type": "version_mismatch",
                    "entityId": entity_id,
                    "currentUpdatedAt": current_updated_at,
                    "current": current,
                },
                "timestamp": Utc::now(),
            }),
            _ => json!({
                "error": {
                    "code": self.code(),
                    "message": self.to_string(),
                },
                "timestamp": Utc::now(),
            }),
        };

        (status, Json(body)).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AppError::NotFound("row not found".to_string()),
            other => AppError::Internal(format!("database error: {}", other)),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(format!("serialization error: {}", err))
    }
}
