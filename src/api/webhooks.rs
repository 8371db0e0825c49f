//! Webhook ingest endpoint
//!
//! The upstream expects a response within three seconds: the handler
//! validates (or captures) the request, replies `{received:true}`
//! immediately, and runs the invalidation fan-out on a detached task.

use std::collections::HashMap;

use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use serde_json::json;

use crate::error::AppResult;
use crate::webhook::IngestOutcome;

use super::AppState;

/// POST /webhooks/notion
pub async fn ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<serde_json::Value>> {
    let headers: HashMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();

    match state.webhook.authenticate(&headers, &body).await? {
        IngestOutcome::Captured => {}
        IngestOutcome::Accepted(envelope) => {
            // Fan-out runs after the 200 is on the wire.
            let service = state.webhook.clone();
            tokio::spawn(async move {
                service.process(envelope).await;
            });
        }
    }

    Ok(Json(json!({ "received": true })))
}
