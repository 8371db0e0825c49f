//! Application configuration
//!
//! Configuration is read once from the environment at startup. Missing
//! required values are fatal: the process logs the failure and exits with
//! code 1 (see `main.rs`).

use std::env;
use std::net::SocketAddr;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required environment variable is absent
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    /// A variable is present but cannot be parsed
    #[error("Invalid value for {name}: {reason}")]
    Invalid {
        /// Variable name
        name: &'static str,
        /// Why parsing failed
        reason: String,
    },
}

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Local development
    Development,
    /// Pre-production
    Staging,
    /// Production
    Production,
}

impl Environment {
    fn from_str(value: &str) -> Self {
        match value {
            "production" => Environment::Production,
            "staging" => Environment::Staging,
            _ => Environment::Development,
        }
    }

    /// Environment name as persisted in the upstream config table
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

/// Application configuration assembled from the environment
#[derive(Debug, Clone)]
pub struct Config {
    /// Socket the HTTP server binds to
    pub bind_addr: SocketAddr,

    /// Deployment environment
    pub environment: Environment,

    /// Upstream API base URL
    pub upstream_base_url: String,

    /// Upstream integration token; optional, the persisted per-environment
    /// config is the fallback source
    pub upstream_token: Option<String>,

    /// SQL store connection string
    pub database_url: String,

    /// Redis connection string; absent means the in-process cache backend
    pub cache_url: Option<String>,

    /// Secret for signing access tokens
    pub jwt_secret: String,

    /// Hex-encoded key material for token encryption
    pub encryption_key: String,

    /// Allowed CORS origins for the front-end
    pub frontend_origins: Vec<String>,
}

impl Config {
    /// Load configuration from the process environment
    pub fn from_env() -> ConfigResult<Self> {
        let bind_addr = env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:3000".to_string())
            .parse()
            .map_err(|e| ConfigError::Invalid {
                name: "BIND_ADDR",
                reason: format!("{}", e),
            })?;

        let environment = Environment::from_str(
            &env::var("NODE_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let upstream_base_url = env::var("UPSTREAM_BASE_URL")
            .unwrap_or_else(|_| "https://api.notion.com/v1".to_string());

        let upstream_token = env::var("UPSTREAM_TOKEN").ok().filter(|t| !t.is_empty());

        let database_url =
            env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        let cache_url = env::var("CACHE_URL").ok().filter(|u| !u.is_empty());

        let jwt_secret = env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?;

        let encryption_key =
            env::var("ENCRYPTION_KEY").map_err(|_| ConfigError::Missing("ENCRYPTION_KEY"))?;

        let frontend_origins = env::var("FRONTEND_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            bind_addr,
            environment,
            upstream_base_url,
            upstream_token,
            database_url,
            cache_url,
            jwt_secret,
            encryption_key,
            frontend_origins,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_parsing() {
        assert_eq!(Environment::from_str("production"), Environment::Production);
        assert_eq!(Environment::from_str("staging"), Environment::Staging);
        assert_eq!(Environment::from_str("anything"), Environment::Development);
        assert_eq!(Environment::Production.as_str(), "production");
    }
}
