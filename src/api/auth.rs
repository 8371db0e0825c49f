//! Authentication endpoints
//!
//! Password login issues a short-lived access token plus a 7-day refresh
//! token; refresh rotates within the token family, and replaying a rotated
//! token revokes the whole family.

use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::json;

use crate::auth::ACCESS_TTL_MINUTES;
use crate::error::{AppError, AppResult};

use super::AppState;

/// Login payload
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    /// Account email
    pub email: String,
    /// Account password
    pub password: String,
}

/// Refresh / logout payload
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    /// The refresh token being presented
    pub refresh_token: String,
}

/// POST /auth/login
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let user = state
        .users
        .authenticate(&request.email, &request.password)
        .await?;
    let access_token = state.jwt.issue(&user)?;
    let refresh = state.tokens.issue(&user.id).await?;

    state.metrics.activity.record_user(&user.id);

    Ok(Json(json!({
        "accessToken": access_token,
        "refreshToken": refresh.token,
        "expiresIn": ACCESS_TTL_MINUTES * 60,
        "user": { "id": user.id, "email": user.email, "role": user.role },
    })))
}

/// POST /auth/refresh
pub async fn refresh(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let rotated = state.tokens.rotate(&request.refresh_token).await?;
    let user = state
        .users
        .find_by_id(&rotated.user_id)
        .await?
        .ok_or_else(|| AppError::Unauthorized("user no longer exists".to_string()))?;
    let access_token = state.jwt.issue(&user)?;

    Ok(Json(json!({
        "accessToken": access_token,
        "refreshToken": rotated.token,
        "expiresIn": ACCESS_TTL_MINUTES * 60,
    })))
}

/// POST /auth/logout
pub async fn logout(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> AppResult<Json<serde_json::Value>> {
    if let Some(row) = state.tokens.find(&request.refresh_token).await? {
        state.tokens.revoke_family(&row.family_id).await?;
    }
    Ok(Json(json!({ "loggedOut": true })))
}
