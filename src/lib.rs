//! # Traffic Sync
//!
//! A caching, synchronization and conflict-detection backend fronting a
//! rate-limited document upstream.
//!
//! ## Architecture
//!
//! - `config`: environment-derived startup configuration
//! - `error`: the crate-wide error taxonomy and its HTTP mapping
//! - `domain`: entity shapes, cache overlay flags, conflict records
//! - `upstream`: rate limiter, retry policy, typed client, schema discovery
//! - `cache`: KV store with per-kind TTLs, single-flight manager, warmup
//! - `sync`: the bounded asynchronous write queue and its worker
//! - `conflict`: scheduling conflict rules with hybrid data sourcing
//! - `webhook`: signed notification ingest and invalidation fan-out
//! - `jobs`: periodic cache refresh and warmup
//! - `metrics`: latency rings, hit/miss counters, activity tracking
//! - `db`: SQL repositories and token encryption
//! - `auth`: access token management
//! - `api`: the HTTP surface

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod conflict;
pub mod db;
pub mod domain;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod sync;
pub mod upstream;
pub mod webhook;

pub use config::Config;
pub use error::{AppError, AppResult};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
