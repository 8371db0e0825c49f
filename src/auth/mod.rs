//! Access token management
//!
//! Short-lived HS256 access tokens (~15 minutes). The long-lived side of the
//! session is the refresh token family handled by the token repository; this
//! module only mints and verifies the bearer tokens the middleware checks.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::users::UserRow;
use crate::error::{AppError, AppResult};

/// Access token lifetime, minutes
pub const ACCESS_TTL_MINUTES: i64 = 15;

/// Claims carried by an access token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// User id
    pub sub: String,
    /// Role
    pub role: String,
    /// Linked upstream member id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member_id: Option<String>,
    /// Token id
    pub jti: String,
    /// Issued at, unix seconds
    pub iat: i64,
    /// Expiry, unix seconds
    pub exp: i64,
}

impl TokenClaims {
    /// Whether the bearer holds the admin role
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

/// Mints and verifies access tokens
pub struct JwtManager {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl JwtManager {
    /// Build from the configured secret
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Mint an access token for a user
    pub fn issue(&self, user: &UserRow) -> AppResult<String> {
        let now = Utc::now();
        let claims = TokenClaims {
            sub: user.id.clone(),
            role: user.role.clone(),
            member_id: user.member_id.clone(),
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            exp: (now + Duration::minutes(ACCESS_TTL_MINUTES)).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| AppError::Internal(format!("token encoding failed: {}", e)))
    }

    /// Verify a bearer token and return its claims
    pub fn verify(&self, token: &str) -> AppResult<TokenClaims> {
        decode::<TokenClaims>(token, &self.decoding, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| AppError::Unauthorized(format!("invalid access token: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserRow {
        UserRow {
            id: "u1".into(),
            email: "a@example.com".into(),
            password_hash: String::new(),
            role: "admin".into(),
            member_id: Some("m1".into()),
            failed_logins: 0,
            locked_until: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_issue_and_verify() {
        let manager = JwtManager::new("test-secret");
        let token = manager.issue(&user()).unwrap();
        let claims = manager.verify(&token).unwrap();
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.member_id.as_deref(), Some("m1"));
        assert!(claims.is_admin());
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let manager = JwtManager::new("secret-a");
        let token = manager.issue(&user()).unwrap();
        let other = JwtManager::new("secret-b");
        assert!(matches!(
            other.verify(&token),
            Err(AppError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        let manager = JwtManager::new("secret");
        assert!(manager.verify("not-a-token").is_err());
    }
}
