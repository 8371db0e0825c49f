//! Webhook ingest
//!
//! Validates signed upstream notifications and fans out cache
//! invalidations. Two modes, switched by the persisted capture flag:
//!
//! - **capture**: records the entire incoming request (headers, body and any
//!   inferred secret) to the config row and disarms itself. One-time setup
//!   path for the HMAC secret; expires five minutes after being armed.
//! - **normal**: enforces HMAC-SHA256 of the raw body with a timing-safe
//!   compare; 401 on mismatch, 500 when no secret is configured.
//!
//! Ingest never calls the upstream synchronously: an accepted notification
//! only invalidates cache keys and appends a sync-log row, off the response
//! path.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{info, warn};

use crate::cache::keys::{calendar_pattern, kind_pattern};
use crate::cache::CacheStore;
use crate::db::notion_config::NotionConfigRepo;
use crate::db::sync_logs::SyncLogRepo;
use crate::domain::{EntityKind, SyncLog, SyncMethod};
use crate::error::{AppError, AppResult};

type HmacSha256 = Hmac<Sha256>;

/// Signature header on upstream notifications
pub const SIGNATURE_HEADER: &str = "x-notion-signature";

/// Headers capture mode inspects for the secret, in order
pub const CAPTURE_SECRET_HEADERS: &[&str] = &["x-hook-secret", "x-webhook-secret", "webhook-secret"];

/// Body keys capture mode inspects for the secret, in order
pub const CAPTURE_SECRET_KEYS: &[&str] = &["secret", "webhook_secret", "verification_token"];

/// The notification envelope
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    /// Event type, e.g. `page.updated`
    #[serde(rename = "type", default)]
    pub event_type: String,
    /// Event payload
    #[serde(default)]
    pub data: WebhookData,
    /// Upstream event id
    #[serde(default)]
    pub id: Option<String>,
}

/// Envelope payload
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookData {
    /// Affected page id
    #[serde(default)]
    pub id: Option<String>,
    /// Parent database reference
    #[serde(default)]
    pub parent: Option<WebhookParent>,
}

/// Parent database reference; the upstream uses either field name
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookParent {
    /// Classic field
    #[serde(default)]
    pub database_id: Option<String>,
    /// Newer field
    #[serde(default)]
    pub data_source_id: Option<String>,
}

impl WebhookEnvelope {
    /// The database id the event originated from
    pub fn database_id(&self) -> Option<&str> {
        self.data
            .parent
            .as_ref()
            .and_then(|p| p.database_id.as_deref().or(p.data_source_id.as_deref()))
    }
}

/// How an incoming request was handled
#[derive(Debug)]
pub enum IngestOutcome {
    /// Capture mode recorded the request and disarmed itself
    Captured,
    /// Signature verified; the envelope is ready for fan-out
    Accepted(WebhookEnvelope),
}

/// Compute the signature for a body (tests and outbound tooling)
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Timing-safe verification of a `sha256=<hex>` signature header
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(hex_sig) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(signature) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    // verify_slice is constant-time with respect to both inputs.
    mac.verify_slice(&signature).is_ok()
}

/// The ingest service behind the HTTP handler
pub struct WebhookService {
    config: Arc<NotionConfigRepo>,
    cache: Arc<CacheStore>,
    sync_logs: Arc<SyncLogRepo>,
}

impl WebhookService {
    /// Wire the service
    pub fn new(
        config: Arc<NotionConfigRepo>,
        cache: Arc<CacheStore>,
        sync_logs: Arc<SyncLogRepo>,
    ) -> Self {
        Self {
            config,
            cache,
            sync_logs,
        }
    }

    /// Validate an incoming request, or capture it when capture mode is
    /// armed. Must stay fast: the HTTP handler replies immediately after.
    pub async fn authenticate(
        &self,
        headers: &HashMap<String, String>,
        body: &[u8],
    ) -> AppResult<IngestOutcome> {
        let row = self.config.load().await?;

        if row.capture_active() {
            let inferred = self.infer_secret(headers, body);
            let payload = json!({
                "headers": headers,
                "body": String::from_utf8_lossy(body),
                "capturedAt": Utc::now(),
            });
            self.config
                .store_capture(&payload, inferred.as_deref())
                .await?;
            info!(secret_found = inferred.is_some(), "webhook request captured");
            return Ok(IngestOutcome::Captured);
        }

        let secret = self
            .config
            .webhook_secret()
            .await?
            .ok_or_else(|| AppError::Internal("webhook secret not configured".to_string()))?;

        let header = headers
            .get(SIGNATURE_HEADER)
            .ok_or_else(|| AppError::Unauthorized("missing signature".to_string()))?;

        if !verify_signature(&secret, body, header) {
            return Err(AppError::Unauthorized("invalid signature".to_string()));
        }

        let envelope: WebhookEnvelope = serde_json::from_slice(body)
            .map_err(|e| AppError::Validation(format!("malformed envelope: {}", e)))?;
        Ok(IngestOutcome::Accepted(envelope))
    }

    fn infer_secret(&self, headers: &HashMap<String, String>, body: &[u8]) -> Option<String> {
        for name in CAPTURE_SECRET_HEADERS {
            if let Some(value) = headers.get(*name) {
                return Some(value.clone());
            }
        }
        let parsed: Value = serde_json::from_slice(body).ok()?;
        for key in CAPTURE_SECRET_KEYS {
            if let Some(value) = parsed.get(*key).and_then(Value::as_str) {
                return Some(value.to_string());
            }
        }
        None
    }

    /// Fan out invalidations for an accepted notification; runs after the
    /// HTTP response has been sent
    pub async fn process(&self, envelope: WebhookEnvelope) {
        let started = Utc::now();
        let Some(database_id) = envelope.database_id().map(str::to_string) else {
            warn!(event = %envelope.event_type, "webhook without a parent database, skipping");
            return;
        };

        let kind = match self
            .config
            .load()
            .await
            .map(|row| row.parsed_database_map().kind_for(&database_id))
        {
            Ok(Some(kind)) => kind,
            Ok(None) => {
                // Unknown databases are logged and skipped; nothing is
                // surfaced to the sender.
                info!(database_id, "webhook for unmapped database, skipping");
                return;
            }
            Err(err) => {
                warn!(error = %err, "config load failed during webhook fan-out");
                return;
            }
        };

        let mut errors = Vec::new();
        let mut invalidated = 0usize;

        match self.cache.invalidate_pattern(&kind_pattern(kind)).await {
            Ok(count) => invalidated += count,
            Err(err) => errors.push(format!("kind invalidation: {}", err)),
        }
        if kind == EntityKind::Task {
            match self.cache.invalidate_pattern(&calendar_pattern()).await {
                Ok(count) => invalidated += count,
                Err(err) => errors.push(format!("calendar invalidation: {}", err)),
            }
            if let Err(err) = self.cache.invalidate_pattern("calendar:*").await {
                errors.push(format!("legacy calendar invalidation: {}", err));
            }
        }

        info!(
            kind = %kind,
            database_id,
            invalidated,
            "webhook invalidation complete"
        );

        let mut log = SyncLog::finished(
            kind.prefix(),
            &database_id,
            SyncMethod::Webhook,
            started,
            invalidated as u32,
            errors,
        );
        if let Some(event_id) = envelope.id {
            log = log.with_event_id(event_id);
        }
        // Sync-log writes are best-effort on this path.
        if let Err(err) = self.sync_logs.append(&log).await {
            warn!(error = %err, "webhook sync-log append failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheKind;
    use crate::db::crypto::TokenCipher;
    use crate::db::test_pool;
    use crate::upstream::mapping::DatabaseMap;

    async fn service() -> (WebhookService, Arc<NotionConfigRepo>, Arc<CacheStore>) {
        let pool = test_pool().await;
        let config = Arc::new(NotionConfigRepo::new(
            pool.clone(),
            TokenCipher::new("test"),
            "development",
        ));
        let cache = Arc::new(CacheStore::memory());
        let sync_logs = Arc::new(SyncLogRepo::new(pool));
        (
            WebhookService::new(Arc::clone(&config), Arc::clone(&cache), sync_logs),
            config,
            cache,
        )
    }

    fn envelope_body(database_id: &str, page_id: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "type": "page.updated",
            "data": { "id": page_id, "parent": { "database_id": database_id } }
        }))
        .unwrap()
    }

    #[test]
    fn test_signature_roundtrip_and_flip_rejection() {
        let body = br#"{"type":"page.updated"}"#;
        let header = sign("secret", body);
        assert!(verify_signature("secret", body, &header));

        // Any single-byte flip in body or signature fails.
        let mut flipped = body.to_vec();
        flipped[0] ^= 0x01;
        assert!(!verify_signature("secret", &flipped, &header));

        let mut bad_header = header.clone().into_bytes();
        let last = bad_header.len() - 1;
        bad_header[last] = if bad_header[last] == b'0' { b'1' } else { b'0' };
        assert!(!verify_signature(
            "secret",
            body,
            &String::from_utf8(bad_header).unwrap()
        ));

        assert!(!verify_signature("other-secret", body, &header));
        assert!(!verify_signature("secret", body, "md5=abcd"));
    }

    #[tokio::test]
    async fn test_valid_signature_accepted() {
        let (service, config, _) = service().await;
        config.set_webhook_secret("hook-secret").await.unwrap();

        let body = envelope_body("db-t", "T1");
        let headers = HashMap::from([(
            SIGNATURE_HEADER.to_string(),
            sign("hook-secret", &body),
        )]);

        match service.authenticate(&headers, &body).await.unwrap() {
            IngestOutcome::Accepted(envelope) => {
                assert_eq!(envelope.database_id(), Some("db-t"));
                assert_eq!(envelope.data.id.as_deref(), Some("T1"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bad_signature_unauthorized() {
        let (service, config, _) = service().await;
        config.set_webhook_secret("hook-secret").await.unwrap();

        let body = envelope_body("db-t", "T1");
        let headers = HashMap::from([(
            SIGNATURE_HEADER.to_string(),
            sign("wrong-secret", &body),
        )]);

        assert!(matches!(
            service.authenticate(&headers, &body).await.unwrap_err(),
            AppError::Unauthorized(_)
        ));
    }

    #[tokio::test]
    async fn test_missing_config_is_internal() {
        let (service, _, _) = service().await;
        let body = envelope_body("db-t", "T1");
        let headers = HashMap::from([(SIGNATURE_HEADER.to_string(), sign("x", &body))]);
        assert!(matches!(
            service.authenticate(&headers, &body).await.unwrap_err(),
            AppError::Internal(_)
        ));
    }

    #[tokio::test]
    async fn test_capture_mode_stores_secret_and_disarms() {
        let (service, config, _) = service().await;
        config.set_capture_mode(true).await.unwrap();

        let headers = HashMap::from([("x-hook-secret".to_string(), "captured!".to_string())]);
        let outcome = service.authenticate(&headers, b"{}").await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Captured));

        assert_eq!(
            config.webhook_secret().await.unwrap().as_deref(),
            Some("captured!")
        );
        assert!(!config.load().await.unwrap().capture_mode);
    }

    #[tokio::test]
    async fn test_capture_infers_secret_from_body() {
        let (service, config, _) = service().await;
        config.set_capture_mode(true).await.unwrap();

        let body = serde_json::to_vec(&json!({ "verification_token": "vt-123" })).unwrap();
        service.authenticate(&HashMap::new(), &body).await.unwrap();
        assert_eq!(
            config.webhook_secret().await.unwrap().as_deref(),
            Some("vt-123")
        );
    }

    #[tokio::test]
    async fn test_process_invalidates_kind_and_calendar() {
        let (service, config, cache) = service().await;
        config
            .set_database_map(&DatabaseMap {
                tasks: "db-t".into(),
                ..DatabaseMap::default()
            })
            .await
            .unwrap();

        cache
            .set("task:T1", json!({"id": "T1"}), CacheKind::Entity(EntityKind::Task))
            .await
            .unwrap();
        for i in 0..3 {
            cache
                .set(
                    &format!("tasks:calendar:start=2025-0{}-01:end=2025-0{}-28", i + 1, i + 1),
                    json!([]),
                    CacheKind::CalendarRange,
                )
                .await
                .unwrap();
        }

        let envelope: WebhookEnvelope =
            serde_json::from_slice(&envelope_body("db-t", "T1")).unwrap();
        service.process(envelope).await;

        assert!(cache.get("task:T1").await.unwrap().is_none());
        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.total_keys, 0);

        let logs = service.sync_logs.recent(10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].method, "webhook");
    }

    #[tokio::test]
    async fn test_unknown_database_is_skipped_quietly() {
        let (service, _, cache) = service().await;
        cache
            .set("task:T1", json!({"id": "T1"}), CacheKind::Entity(EntityKind::Task))
            .await
            .unwrap();

        let envelope: WebhookEnvelope =
            serde_json::from_slice(&envelope_body("unmapped-db", "T1")).unwrap();
        service.process(envelope).await;

        // Nothing invalidated, no sync log row.
        assert!(cache.get("task:T1").await.unwrap().is_some());
        assert!(service.sync_logs.recent(10).await.unwrap().is_empty());
    }
}
