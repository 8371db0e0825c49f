//! Key/value cache store
//!
//! The authoritative cache for upstream entities and derived query results.
//! Two backends share one contract:
//!
//! - [`MemoryCache`]: in-process, prefix-indexed so pattern invalidation is
//!   O(matches); memory figures are best-effort serialized-size estimates
//! - [`RedisCache`]: remote store driven through `SCAN` so pattern
//!   invalidation never blocks the server
//!
//! Setting a key always resets its TTL to the kind's default. `del` is
//! idempotent. Writes are last-writer-wins; there are no cross-key
//! transactions.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;

use crate::domain::EntityKind;

use super::keys::key_prefix;

/// Cache errors
#[derive(Error, Debug)]
pub enum CacheError {
    /// Backend I/O failure
    #[error("Cache backend error: {0}")]
    Backend(String),

    /// Value failed to (de)serialize
    #[error("Cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid invalidation pattern
    #[error("Invalid cache pattern: {0}")]
    InvalidPattern(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Backend(err.to_string())
    }
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// What a cached value represents; determines its TTL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    /// A single upstream entity
    Entity(EntityKind),
    /// A derived calendar range
    CalendarRange,
    /// Other derived aggregates
    Derived,
}

impl CacheKind {
    /// Default TTL for this kind
    pub fn ttl(&self) -> Duration {
        match self {
            CacheKind::Entity(EntityKind::Task) => Duration::from_secs(60 * 60),
            CacheKind::Entity(EntityKind::Project) => Duration::from_secs(24 * 60 * 60),
            CacheKind::Entity(EntityKind::Client) => Duration::from_secs(12 * 60 * 60),
            CacheKind::Entity(EntityKind::Member) => Duration::from_secs(7 * 24 * 60 * 60),
            CacheKind::Entity(EntityKind::Team) => Duration::from_secs(7 * 24 * 60 * 60),
            CacheKind::CalendarRange => Duration::from_secs(15 * 60),
            CacheKind::Derived => Duration::from_secs(5 * 60),
        }
    }
}

impl From<EntityKind> for CacheKind {
    fn from(kind: EntityKind) -> Self {
        CacheKind::Entity(kind)
    }
}

/// Store statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Live keys
    pub total_keys: usize,
    /// Live keys per first key segment
    pub keys_by_prefix: HashMap<String, usize>,
    /// Estimated bytes in use
    pub memory_used: u64,
    /// Peak of `memory_used`
    pub memory_peak: u64,
    /// Configured ceiling, 0 when unbounded
    pub max_memory: u64,
    /// Entries dropped by TTL expiry since start
    pub expired_count: u64,
}

/// Backend contract shared by the in-process and Redis stores
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Fetch a value, `None` on miss or expiry
    async fn get(&self, key: &str) -> CacheResult<Option<Value>>;

    /// Store a value with a TTL
    async fn set(&self, key: &str, value: Value, ttl: Duration) -> CacheResult<()>;

    /// Delete a key; `true` when it existed
    async fn del(&self, key: &str) -> CacheResult<bool>;

    /// Delete every key matching a glob pattern; returns the delete count
    async fn invalidate_pattern(&self, pattern: &str) -> CacheResult<usize>;

    /// Drop everything
    async fn clear(&self) -> CacheResult<()>;

    /// Usage statistics
    async fn stats(&self) -> CacheResult<CacheStats>;
}

fn glob_to_regex(pattern: &str) -> CacheResult<Regex> {
    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    Regex::new(&format!("^{}$", escaped))
        .map_err(|e| CacheError::InvalidPattern(format!("{}: {}", pattern, e)))
}

// ============================================================================
// In-process backend
// ============================================================================

struct Entry {
    value: Value,
    expires_at: Instant,
    size: usize,
}

/// DashMap-backed cache with a prefix index for fast pattern invalidation
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
    prefix_index: DashMap<String, HashSet<String>>,
    memory_used: AtomicUsize,
    memory_peak: AtomicUsize,
    max_memory: u64,
    expired: AtomicU64,
}

impl MemoryCache {
    /// Unbounded in-process cache
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            prefix_index: DashMap::new(),
            memory_used: AtomicUsize::new(0),
            memory_peak: AtomicUsize::new(0),
            max_memory: 0,
            expired: AtomicU64::new(0),
        }
    }

    fn index_insert(&self, key: &str) {
        self.prefix_index
            .entry(key_prefix(key).to_string())
            .or_default()
            .insert(key.to_string());
    }

    fn index_remove(&self, key: &str) {
        if let Some(mut keys) = self.prefix_index.get_mut(key_prefix(key)) {
            keys.remove(key);
        }
    }

    fn drop_entry(&self, key: &str, expired: bool) -> bool {
        match self.entries.remove(key) {
            Some((_, entry)) => {
                self.memory_used.fetch_sub(entry.size, Ordering::Relaxed);
                self.index_remove(key);
                if expired {
                    self.expired.fetch_add(1, Ordering::Relaxed);
                }
                true
            }
            None => false,
        }
    }

    /// Keys matching a pattern ending in `*`, via the prefix index
    fn prefix_matches(&self, stem: &str) -> Vec<String> {
        self.prefix_index
            .get(key_prefix(stem))
            .map(|keys| {
                keys.iter()
                    .filter(|k| k.starts_with(stem))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> CacheResult<Option<Value>> {
        let expired = match self.entries.get(key) {
            Some(entry) => {
                if entry.expires_at > Instant::now() {
                    return Ok(Some(entry.value.clone()));
                }
                true
            }
            None => return Ok(None),
        };
        if expired {
            self.drop_entry(key, true);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> CacheResult<()> {
        let size = serde_json::to_string(&value)?.len();
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
            size,
        };
        if let Some(old) = self.entries.insert(key.to_string(), entry) {
            self.memory_used.fetch_sub(old.size, Ordering::Relaxed);
        }
        let used = self.memory_used.fetch_add(size, Ordering::Relaxed) + size;
        self.memory_peak.fetch_max(used, Ordering::Relaxed);
        self.index_insert(key);
        Ok(())
    }

    async fn del(&self, key: &str) -> CacheResult<bool> {
        Ok(self.drop_entry(key, false))
    }

    async fn invalidate_pattern(&self, pattern: &str) -> CacheResult<usize> {
        let victims: Vec<String> = if pattern == "*" {
            self.entries.iter().map(|e| e.key().clone()).collect()
        } else if let Some(stem) = pattern
            .strip_suffix('*')
            .filter(|stem| !stem.contains('*'))
        {
            self.prefix_matches(stem)
        } else {
            let matcher = glob_to_regex(pattern)?;
            self.entries
                .iter()
                .filter(|e| matcher.is_match(e.key()))
                .map(|e| e.key().clone())
                .collect()
        };

        let mut deleted = 0;
        for key in victims {
            if self.drop_entry(&key, false) {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn clear(&self) -> CacheResult<()> {
        self.entries.clear();
        self.prefix_index.clear();
        self.memory_used.store(0, Ordering::Relaxed);
        Ok(())
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        // Sweep expired entries so counts reflect the live set.
        let now = Instant::now();
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.expires_at <= now)
            .map(|e| e.key().clone())
            .collect();
        for key in stale {
            self.drop_entry(&key, true);
        }

        let mut keys_by_prefix: HashMap<String, usize> = HashMap::new();
        for entry in self.entries.iter() {
            *keys_by_prefix
                .entry(key_prefix(entry.key()).to_string())
                .or_default() += 1;
        }

        Ok(CacheStats {
            total_keys: self.entries.len(),
            keys_by_prefix,
            memory_used: self.memory_used.load(Ordering::Relaxed) as u64,
            memory_peak: self.memory_peak.load(Ordering::Relaxed) as u64,
            max_memory: self.max_memory,
            expired_count: self.expired.load(Ordering::Relaxed),
        })
    }
}

// ============================================================================
// Redis backend
// ============================================================================

/// Redis-backed cache
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    /// Connect to a Redis instance
    pub async fn connect(url: &str) -> CacheResult<Self> {
        let client = redis::Client::open(url).map_err(CacheError::from)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    async fn scan_matching(&self, pattern: &str) -> CacheResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut self.conn.clone())
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    fn info_field(info: &str, field: &str) -> Option<u64> {
        let prefix = format!("{}:", field);
        info.lines()
            .find(|line| line.starts_with(&prefix))
            .and_then(|line| line.split(':').nth(1))
            .and_then(|v| v.trim().parse().ok())
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> CacheResult<Option<Value>> {
        let payload: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await?;
        match payload {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> CacheResult<()> {
        let payload = serde_json::to_string(&value)?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(payload)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> CacheResult<bool> {
        let removed: u64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(removed > 0)
    }

    async fn invalidate_pattern(&self, pattern: &str) -> CacheResult<usize> {
        let keys = self.scan_matching(pattern).await?;
        let mut deleted = 0usize;
        for chunk in keys.chunks(100) {
            let mut cmd = redis::cmd("DEL");
            for key in chunk {
                cmd.arg(key);
            }
            let removed: u64 = cmd.query_async(&mut self.conn.clone()).await?;
            deleted += removed as usize;
        }
        Ok(deleted)
    }

    async fn clear(&self) -> CacheResult<()> {
        let _: () = redis::cmd("FLUSHDB")
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(())
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        let total_keys: u64 = redis::cmd("DBSIZE")
            .query_async(&mut self.conn.clone())
            .await?;

        let mut keys_by_prefix: HashMap<String, usize> = HashMap::new();
        for key in self.scan_matching("*").await? {
            *keys_by_prefix
                .entry(key_prefix(&key).to_string())
                .or_default() += 1;
        }

        let info: String = redis::cmd("INFO")
            .arg("memory")
            .query_async(&mut self.conn.clone())
            .await?;
        let stats_info: String = redis::cmd("INFO")
            .arg("stats")
            .query_async(&mut self.conn.clone())
            .await?;

        Ok(CacheStats {
            total_keys: total_keys as usize,
            keys_by_prefix,
            memory_used: Self::info_field(&info, "used_memory").unwrap_or(0),
            memory_peak: Self::info_field(&info, "used_memory_peak").unwrap_or(0),
            max_memory: Self::info_field(&info, "maxmemory").unwrap_or(0),
            expired_count: Self::info_field(&stats_info, "expired_keys").unwrap_or(0),
        })
    }
}

// ============================================================================
// Store facade
// ============================================================================

/// The cache store handed to the rest of the system
///
/// Owns TTL policy; callers pass the kind, never a raw duration.
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
}

impl CacheStore {
    /// In-process store
    pub fn memory() -> Self {
        Self {
            backend: Arc::new(MemoryCache::new()),
        }
    }

    /// Redis-backed store
    pub async fn redis(url: &str) -> CacheResult<Self> {
        Ok(Self {
            backend: Arc::new(RedisCache::connect(url).await?),
        })
    }

    /// Wrap an arbitrary backend (tests)
    pub fn with_backend(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    /// Fetch a value
    pub async fn get(&self, key: &str) -> CacheResult<Option<Value>> {
        self.backend.get(key).await
    }

    /// Store a value with the kind's TTL
    pub async fn set(&self, key: &str, value: Value, kind: CacheKind) -> CacheResult<()> {
        self.backend.set(key, value, kind.ttl()).await
    }

    /// Delete a key
    pub async fn del(&self, key: &str) -> CacheResult<bool> {
        self.backend.del(key).await
    }

    /// Delete everything matching a glob pattern
    pub async fn invalidate_pattern(&self, pattern: &str) -> CacheResult<usize> {
        self.backend.invalidate_pattern(pattern).await
    }

    /// Drop everything
    pub async fn clear(&self) -> CacheResult<()> {
        self.backend.clear().await
    }

    /// Usage statistics
    pub async fn stats(&self) -> CacheResult<CacheStats> {
        self.backend.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_del_roundtrip() {
        let store = CacheStore::memory();
        store
            .set("task:1", json!({"id": "1"}), CacheKind::Entity(EntityKind::Task))
            .await
            .unwrap();
        assert_eq!(
            store.get("task:1").await.unwrap(),
            Some(json!({"id": "1"}))
        );
        assert!(store.del("task:1").await.unwrap());
        assert!(!store.del("task:1").await.unwrap());
        assert_eq!(store.get("task:1").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let cache = MemoryCache::new();
        cache
            .set("task:1", json!(1), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(cache.get("task:1").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get("task:1").await.unwrap().is_none());
        assert_eq!(cache.stats().await.unwrap().expired_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_resets_ttl() {
        let cache = MemoryCache::new();
        cache.set("k", json!(1), Duration::from_secs(60)).await.unwrap();
        tokio::time::advance(Duration::from_secs(50)).await;
        cache.set("k", json!(2), Duration::from_secs(60)).await.unwrap();
        tokio::time::advance(Duration::from_secs(50)).await;
        assert_eq!(cache.get("k").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_pattern_invalidation_by_prefix() {
        let cache = MemoryCache::new();
        for i in 0..5 {
            cache
                .set(&format!("task:{}", i), json!(i), Duration::from_secs(60))
                .await
                .unwrap();
        }
        cache
            .set("project:1", json!("p"), Duration::from_secs(60))
            .await
            .unwrap();
        cache
            .set(
                "tasks:calendar:start=2025-01-01:end=2025-01-31",
                json!([]),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        assert_eq!(cache.invalidate_pattern("task:*").await.unwrap(), 5);
        assert!(cache.get("project:1").await.unwrap().is_some());

        assert_eq!(cache.invalidate_pattern("tasks:calendar:*").await.unwrap(), 1);
        assert_eq!(cache.stats().await.unwrap().total_keys, 1);
    }

    #[tokio::test]
    async fn test_pattern_invalidation_generic_glob() {
        let cache = MemoryCache::new();
        cache.set("a:1:x", json!(1), Duration::from_secs(60)).await.unwrap();
        cache.set("a:2:x", json!(2), Duration::from_secs(60)).await.unwrap();
        cache.set("a:2:y", json!(3), Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.invalidate_pattern("a:*:x").await.unwrap(), 2);
        assert!(cache.get("a:2:y").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalidated_keys_read_null() {
        let cache = MemoryCache::new();
        for i in 0..3 {
            cache
                .set(&format!("calendar:{}", i), json!(i), Duration::from_secs(60))
                .await
                .unwrap();
        }
        cache.invalidate_pattern("calendar:*").await.unwrap();
        for i in 0..3 {
            assert!(cache
                .get(&format!("calendar:{}", i))
                .await
                .unwrap()
                .is_none());
        }
    }

    #[tokio::test]
    async fn test_memory_accounting() {
        let cache = MemoryCache::new();
        cache
            .set("task:1", json!({"data": "x".repeat(100)}), Duration::from_secs(60))
            .await
            .unwrap();
        let stats = cache.stats().await.unwrap();
        assert!(stats.memory_used > 100);
        assert!(stats.memory_peak >= stats.memory_used);

        cache.del("task:1").await.unwrap();
        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.memory_used, 0);
        assert!(stats.memory_peak > 0);
    }

    #[tokio::test]
    async fn test_stats_by_prefix() {
        let cache = MemoryCache::new();
        cache.set("task:1", json!(1), Duration::from_secs(60)).await.unwrap();
        cache.set("task:2", json!(2), Duration::from_secs(60)).await.unwrap();
        cache.set("member:1", json!(3), Duration::from_secs(60)).await.unwrap();
        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.keys_by_prefix.get("task"), Some(&2));
        assert_eq!(stats.keys_by_prefix.get("member"), Some(&1));
    }

    #[test]
    fn test_kind_ttls() {
        assert_eq!(
            CacheKind::Entity(EntityKind::Task).ttl(),
            Duration::from_secs(3600)
        );
        assert_eq!(
            CacheKind::Entity(EntityKind::Member).ttl(),
            Duration::from_secs(7 * 24 * 3600)
        );
        assert!(CacheKind::CalendarRange.ttl() <= Duration::from_secs(3600));
        assert!(CacheKind::CalendarRange.ttl() >= Duration::from_secs(300));
    }

    #[test]
    fn test_info_field_parsing() {
        let info = "# Memory\r\nused_memory:1024\r\nused_memory_peak:2048\r\nmaxmemory:0\r\n";
        assert_eq!(RedisCache::info_field(info, "used_memory"), Some(1024));
        assert_eq!(RedisCache::info_field(info, "maxmemory"), Some(0));
        assert_eq!(RedisCache::info_field(info, "missing"), None);
    }
}
