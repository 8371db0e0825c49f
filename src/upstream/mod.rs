//! Upstream access layer
//!
//! Everything that talks to the external document service lives here:
//!
//! - `limiter`: prioritized token-bucket scheduler every call goes through
//! - `retry`: exponential-backoff wrapper around individual attempts
//! - `client`: typed CRUD over the five entity kinds, with pagination
//! - `mapping`: the property-ID mapping table and page conversions
//! - `discovery`: database schema retrieval and relation validation

pub mod client;
pub mod discovery;
pub mod limiter;
pub mod mapping;
pub mod retry;

pub use client::{ListFilter, NotionClient, TaskRangeQuery, UpstreamApi};
pub use discovery::{DatabaseSchema, DiscoveryService, PropertySpec, RelationReport};
pub use limiter::{
    RateLimiter, RateLimiterConfig, ScheduleError, PRIORITY_HIGH, PRIORITY_LOW, PRIORITY_NORMAL,
};
pub use retry::{retry, retry_with_backoff};

use crate::error::AppError;
use thiserror::Error;

/// Upstream failure classification
#[derive(Error, Debug)]
pub enum UpstreamError {
    /// No such page or database
    #[error("Upstream object not found: {0}")]
    NotFound(String),

    /// The upstream returned 429 despite local pacing (stale local limits),
    /// or the local limiter dropped the call
    #[error("Upstream rate limited: {0}")]
    RateLimited(String),

    /// Invalid or expired integration token
    #[error("Upstream rejected credentials: {0}")]
    Unauthorized(String),

    /// Upstream 5xx
    #[error("Upstream server error ({status}): {message}")]
    Upstream5xx {
        /// HTTP status
        status: u16,
        /// Upstream-provided message
        message: String,
    },

    /// A page did not match the expected property schema
    #[error("Upstream schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Connection-level failure
    #[error("Upstream network error: {0}")]
    Network(String),

    /// Call deadline exceeded
    #[error("Upstream call timed out: {0}")]
    Timeout(String),

    /// The caller's deadline expired while the call was still queued locally
    #[error("Upstream call cancelled while queued")]
    Cancelled,
}

impl UpstreamError {
    /// Whether the retry wrapper may attempt the call again
    ///
    /// Retryable: upstream 5xx, upstream 429, timeouts and connection-level
    /// failures. Everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UpstreamError::Upstream5xx { .. }
                | UpstreamError::RateLimited(_)
                | UpstreamError::Network(_)
                | UpstreamError::Timeout(_)
        )
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout(err.to_string())
        } else {
            UpstreamError::Network(err.to_string())
        }
    }
}

impl From<ScheduleError<UpstreamError>> for UpstreamError {
    fn from(err: ScheduleError<UpstreamError>) -> Self {
        match err {
            ScheduleError::Dropped => {
                UpstreamError::RateLimited("local limiter queue overflow".to_string())
            }
            ScheduleError::Cancelled => UpstreamError::Cancelled,
            ScheduleError::Task(inner) => inner,
        }
    }
}

impl From<UpstreamError> for AppError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::NotFound(msg) => AppError::NotFound(msg),
            UpstreamError::RateLimited(msg) => AppError::RateLimited(msg),
            UpstreamError::Unauthorized(msg) => AppError::Unauthorized(msg),
            UpstreamError::Timeout(msg) => AppError::Timeout(msg),
            UpstreamError::Cancelled => AppError::Timeout("cancelled while queued".to_string()),
            other => AppError::Upstream(other.to_string()),
        }
    }
}

/// Result type for upstream operations
pub type UpstreamResult<T> = Result<T, UpstreamError>;
