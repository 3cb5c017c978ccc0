//! Session store backends.
//!
//! A [`SessionStore`] is a keyed cache with per-key time-to-live. Expired
//! entries are indistinguishable from absent ones. Backends:
//!
//! - **Memory**: in-process map, for tests and single-process use
//! - **File**: one JSON file per key, survives restarts of a CLI
//! - **Redis**: shared multi-process store (feature `redis-backend`)

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use copilot_common::config::{StoreBackend, StoreConfig};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{SessionError, SessionResult};

/// Trait for session store implementations.
///
/// Operations are atomic per key; there are no multi-key transactions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Backend name (e.g., "memory", "redis")
    fn name(&self) -> &str;

    /// Read the value under `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> SessionResult<Option<String>>;

    /// Write `value` under `key`, replacing any previous value and resetting
    /// its time-to-live to `ttl`.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> SessionResult<()>;

    /// Remove `key`. Returns true if a live value existed.
    async fn delete(&self, key: &str) -> SessionResult<bool>;
}

/// Create a session store based on configuration.
pub async fn create_store(config: &StoreConfig) -> SessionResult<Arc<dyn SessionStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::File => {
            let store = FileStore::open(config.dir_or_default()).await?;
            Ok(Arc::new(store))
        }
        #[cfg(feature = "redis-backend")]
        StoreBackend::Redis => {
            let store = RedisStore::connect(&config.redis_url).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis-backend"))]
        StoreBackend::Redis => Err(SessionError::Config(
            "Redis store requires the `redis-backend` feature".into(),
        )),
    }
}

// ============================================================================
// In-Memory Store
// ============================================================================

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-memory store.
///
/// Expiry uses the Tokio clock, so a paused test runtime controls it. Expired
/// entries are evicted when read and swept on every write.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, MemoryEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.read().await;
        entries.values().filter(|e| !e.is_expired(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> SessionResult<Option<String>> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return Ok(None),
                Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
            }
        }

        // Expired hit: evict under the write lock unless a writer refreshed it meanwhile.
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> SessionResult<()> {
        let now = Instant::now();
        let entry = MemoryEntry {
            value,
            expires_at: now + ttl,
        };
        let mut entries = self.entries.write().await;
        entries.retain(|_, e| !e.is_expired(now));
        entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> SessionResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        Ok(entries.remove(key).is_some_and(|e| !e.is_expired(now)))
    }
}

// ============================================================================
// File Store
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileRecord {
    expires_at: DateTime<Utc>,
    value: String,
}

/// File-backed store: one JSON record per key under a directory.
///
/// Expired records read as absent and are removed on access.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) the store directory.
    pub async fn open(dir: impl Into<PathBuf>) -> SessionResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| SessionError::Store(format!("create {}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_file_name(key)))
    }

    async fn remove_file(path: &Path) -> SessionResult<bool> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SessionError::Store(format!("remove {}: {e}", path.display()))),
        }
    }

    async fn read_record(path: &Path) -> SessionResult<Option<FileRecord>> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SessionError::Store(format!("read {}: {e}", path.display()))),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| SessionError::Store(format!("corrupt record {}: {e}", path.display())))
    }
}

/// Map a key to a portable file name: `[A-Za-z0-9._-]` kept, every other byte as `%XX`.
fn encode_file_name(key: &str) -> String {
    let mut name = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                name.push(byte as char);
            }
            other => name.push_str(&format!("%{other:02X}")),
        }
    }
    name
}

#[async_trait]
impl SessionStore for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn get(&self, key: &str) -> SessionResult<Option<String>> {
        let path = self.path_for(key);
        let Some(record) = Self::read_record(&path).await? else {
            return Ok(None);
        };
        if Utc::now() >= record.expires_at {
            tracing::debug!(key = %key, "Removing expired session record");
            Self::remove_file(&path).await?;
            return Ok(None);
        }
        Ok(Some(record.value))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> SessionResult<()> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| SessionError::Config(format!("ttl out of range: {e}")))?;
        let record = FileRecord {
            expires_at: Utc::now() + ttl,
            value,
        };
        let content = serde_json::to_string(&record)
            .map_err(|e| SessionError::Serialization(e.to_string()))?;

        let path = self.path_for(key);
        // Unique per write, so concurrent writers to one key never share a temp file.
        let tmp = self.dir.join(format!(
            "{}.{}.tmp",
            encode_file_name(key),
            Uuid::new_v4().simple()
        ));
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| SessionError::Store(format!("write {}: {e}", tmp.display())))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(SessionError::Store(format!("rename {}: {e}", path.display())));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> SessionResult<bool> {
        let path = self.path_for(key);
        let live = Self::read_record(&path)
            .await?
            .is_some_and(|r| Utc::now() < r.expires_at);
        Self::remove_file(&path).await?;
        Ok(live)
    }
}

// ============================================================================
// Redis Store (Feature-gated)
// ============================================================================

/// Redis-backed store using `SET key value PX ttl`.
#[cfg(feature = "redis-backend")]
pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
}

#[cfg(feature = "redis-backend")]
impl RedisStore {
    /// Connect to Redis at `url` (redis://host:port).
    pub async fn connect(url: &str) -> SessionResult<Self> {
        let client =
            redis::Client::open(url).map_err(|e| SessionError::Config(format!("redis url: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| SessionError::Store(e.to_string()))?;
        tracing::info!(url = %url, "Connected session store to Redis");
        Ok(Self { conn })
    }

    /// Check the connection with PING.
    pub async fn is_healthy(&self) -> bool {
        let mut conn = self.conn.clone();
        matches!(
            redis::cmd("PING").query_async::<String>(&mut conn).await,
            Ok(ref pong) if pong == "PONG"
        )
    }
}

#[cfg(feature = "redis-backend")]
#[async_trait]
impl SessionStore for RedisStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, key: &str) -> SessionResult<Option<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async::<Option<String>>(&mut conn)
            .await
            .map_err(|e| SessionError::Store(e.to_string()))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> SessionResult<()> {
        let ttl_ms = u64::try_from(ttl.as_millis())
            .map_err(|_| SessionError::Config("ttl out of range".into()))?
            .max(1);
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_ms)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| SessionError::Store(e.to_string()))
    }

    async fn delete(&self, key: &str) -> SessionResult<bool> {
        let mut conn = self.conn.clone();
        let removed = redis::cmd("DEL")
            .arg(key)
            .query_async::<i64>(&mut conn)
            .await
            .map_err(|e| SessionError::Store(e.to_string()))?;
        Ok(removed > 0)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_millis(43_200_000);

    #[tokio::test(start_paused = true)]
    async fn test_memory_store_set_get_delete() {
        let store = MemoryStore::new();
        assert_eq!(store.get("chat-session:a").await.unwrap(), None);

        store.set("chat-session:a", "state".into(), TTL).await.unwrap();
        assert_eq!(store.get("chat-session:a").await.unwrap().as_deref(), Some("state"));
        assert_eq!(store.len().await, 1);

        assert!(store.delete("chat-session:a").await.unwrap());
        assert!(!store.delete("chat-session:a").await.unwrap());
        assert!(store.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_store_expires_after_ttl() {
        let store = MemoryStore::new();
        store.set("k", "v".into(), TTL).await.unwrap();

        tokio::time::advance(TTL - Duration::from_millis(1)).await;
        assert!(store.get("k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_millis(2)).await;
        assert!(store.get("k").await.unwrap().is_none());
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_store_write_refreshes_ttl() {
        let store = MemoryStore::new();
        store.set("k", "v1".into(), TTL).await.unwrap();

        tokio::time::advance(TTL - Duration::from_secs(60)).await;
        store.set("k", "v2".into(), TTL).await.unwrap();

        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_store_evicts_expired_entries() {
        let store = MemoryStore::new();
        for i in 0..1000 {
            store
                .set(&format!("chat-session:{i}"), "v".into(), Duration::from_secs(1))
                .await
                .unwrap();
        }

        tokio::time::advance(Duration::from_secs(2)).await;
        for i in 0..1000 {
            assert!(store.get(&format!("chat-session:{i}")).await.unwrap().is_none());
        }
        assert_eq!(store.entries.read().await.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_store_write_sweeps_expired_entries() {
        let store = MemoryStore::new();
        store.set("old", "v".into(), Duration::from_secs(1)).await.unwrap();
        store.set("long", "v".into(), TTL).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        store.set("new", "v".into(), TTL).await.unwrap();
        assert_eq!(store.entries.read().await.len(), 2);
        assert_eq!(store.len().await, 2);
    }

    #[test]
    fn test_encode_file_name() {
        assert_eq!(encode_file_name("chat-session:abc_1.2"), "chat-session%3Aabc_1.2");
        assert_eq!(encode_file_name("a/b"), "a%2Fb");
        assert_ne!(encode_file_name("a:b"), encode_file_name("a_b"));
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("sessions")).await.unwrap();

        store.set("chat-session:abc", "{\"x\":1}".into(), TTL).await.unwrap();
        assert_eq!(
            store.get("chat-session:abc").await.unwrap().as_deref(),
            Some("{\"x\":1}")
        );
        assert!(store.dir().join("chat-session%3Aabc.json").exists());

        assert!(store.delete("chat-session:abc").await.unwrap());
        assert_eq!(store.get("chat-session:abc").await.unwrap(), None);
        assert!(!store.delete("chat-session:abc").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_file_store_concurrent_writes_last_one_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::open(dir.path()).await.unwrap());

        for round in 0..20 {
            let writers: Vec<_> = (0..8)
                .map(|i| {
                    let store = Arc::clone(&store);
                    tokio::spawn(async move {
                        store
                            .set("chat-session:abc", format!("{round}-{i}"), TTL)
                            .await
                    })
                })
                .collect();
            for writer in writers {
                writer.await.unwrap().unwrap();
            }

            let value = store.get("chat-session:abc").await.unwrap().unwrap();
            assert!(value.starts_with(&format!("{round}-")), "read {value}");
        }

        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().path().extension().is_some_and(|x| x == "tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_file_store_expired_record_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();

        store.set("k", "v".into(), Duration::ZERO).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.dir().join("k.json").exists());
    }

    #[tokio::test]
    async fn test_file_store_corrupt_record_is_store_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        std::fs::write(dir.path().join("k.json"), "garbage").unwrap();

        let err = store.get("k").await.unwrap_err();
        assert!(err.is_store());
    }

    #[tokio::test]
    async fn test_create_store_from_config() {
        let store = create_store(&StoreConfig::default()).await.unwrap();
        assert_eq!(store.name(), "memory");

        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            backend: StoreBackend::File,
            dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let store = create_store(&config).await.unwrap();
        assert_eq!(store.name(), "file");
    }

    #[cfg(not(feature = "redis-backend"))]
    #[tokio::test]
    async fn test_redis_backend_requires_feature() {
        let config = StoreConfig {
            backend: StoreBackend::Redis,
            ..Default::default()
        };
        assert!(create_store(&config).await.err().unwrap().is_config());
    }
}

// ============================================================================
// Redis Integration Tests (requires running Redis server)
// ============================================================================

#[cfg(all(test, feature = "redis-backend"))]
mod redis_tests {
    use super::*;

    const REDIS_URL: &str = "redis://127.0.0.1:6379";

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_redis_store_set_get_delete() {
        let store = RedisStore::connect(REDIS_URL).await.unwrap();
        assert!(store.is_healthy().await);

        let key = format!("chat-session:test-{}", uuid::Uuid::new_v4());
        store.set(&key, "v".into(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("v"));
        assert!(store.delete(&key).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_redis_store_expires() {
        let store = RedisStore::connect(REDIS_URL).await.unwrap();
        let key = format!("chat-session:test-{}", uuid::Uuid::new_v4());
        store.set(&key, "v".into(), Duration::from_millis(50)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.get(&key).await.unwrap(), None);
    }
}
