//! Transient, TTL-bounded storage for binary payloads.
//!
//! The blob store is how large payloads travel between the request-facing
//! process and the workers: task messages carry a [`BlobKey`], never the
//! bytes. Keys have the form `<prefix>:<opaque-id>`; the prefix names the
//! payload class and decides the default TTL.
//!
//! ## Ownership transfer
//!
//! [`BlobStore::load`] with `destructive = true` is an atomic get-and-delete.
//! Whoever wins that call owns the bytes; every later load of the same key
//! fails with [`RelayError::BlobNotFound`]. A full-resolution page is always
//! claimed this way, so it can never be published twice.

use crate::config::BlobSettings;
use crate::error::RelayError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

// ── Keys ─────────────────────────────────────────────────────────────────

/// A `<prefix>:<opaque-id>` blob key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobKey(String);

impl BlobKey {
    /// Mint a fresh key under `prefix`.
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{prefix}:{}", uuid::Uuid::new_v4().simple()))
    }

    /// Validate an externally supplied key.
    pub fn parse(raw: &str) -> Result<Self, RelayError> {
        match raw.split_once(':') {
            Some((prefix, id)) if !prefix.is_empty() && !id.is_empty() => Ok(Self(raw.to_string())),
            _ => Err(RelayError::MalformedKey(raw.to_string())),
        }
    }

    pub fn prefix(&self) -> &str {
        self.0.split_once(':').map(|(p, _)| p).unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for BlobKey {
    type Error = RelayError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<BlobKey> for String {
    fn from(key: BlobKey) -> Self {
        key.0
    }
}

// ── TTL policy ───────────────────────────────────────────────────────────

/// Payload class, derived from a key prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobClass {
    Source,
    FullResolution,
    Preview,
}

/// Maps prefixes to payload classes and their default TTLs.
#[derive(Debug, Clone)]
pub struct BlobPolicy {
    settings: BlobSettings,
}

impl BlobPolicy {
    pub fn new(settings: BlobSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &BlobSettings {
        &self.settings
    }

    /// Unknown prefixes are treated as source uploads.
    pub fn class_of(&self, prefix: &str) -> BlobClass {
        if prefix == self.settings.fullres_prefix {
            BlobClass::FullResolution
        } else if prefix == self.settings.preview_prefix {
            BlobClass::Preview
        } else {
            BlobClass::Source
        }
    }

    pub fn default_ttl(&self, prefix: &str) -> Duration {
        match self.class_of(prefix) {
            BlobClass::Source => self.settings.source_ttl,
            BlobClass::FullResolution => self.settings.fullres_ttl,
            BlobClass::Preview => self.settings.preview_ttl,
        }
    }

    /// An explicit non-zero TTL wins over the class default.
    pub fn resolve_ttl(&self, prefix: &str, ttl: Option<Duration>) -> Duration {
        ttl.filter(|t| !t.is_zero())
            .unwrap_or_else(|| self.default_ttl(prefix))
    }
}

impl Default for BlobPolicy {
    fn default() -> Self {
        Self::new(BlobSettings::default())
    }
}

// ── Trait ────────────────────────────────────────────────────────────────

/// Keyed, TTL-bounded transient storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under a fresh key in `prefix`. `ttl = None` uses the class default.
    async fn store(
        &self,
        prefix: &str,
        bytes: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<BlobKey, RelayError>;

    /// Read a blob. `destructive` removes it atomically with the read.
    async fn load(&self, key: &BlobKey, destructive: bool) -> Result<Vec<u8>, RelayError>;

    /// Remove a blob. Missing keys are not an error.
    async fn delete(&self, key: &BlobKey) -> Result<(), RelayError>;

    /// Remove several blobs. Missing keys are not an error.
    async fn delete_many(&self, keys: &[BlobKey]) -> Result<(), RelayError> {
        for key in keys {
            self.delete(key).await?;
        }
        Ok(())
    }
}

// ── In-process store ─────────────────────────────────────────────────────

struct Entry {
    bytes: Vec<u8>,
    expires_at: Instant,
}

/// In-process blob store for single-process deployments and tests.
///
/// Expiry uses tokio's clock, so tests running with a paused clock can
/// advance time past a TTL.
pub struct MemoryBlobStore {
    policy: BlobPolicy,
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryBlobStore {
    pub fn new(policy: BlobPolicy) -> Self {
        Self {
            policy,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live (unexpired) blobs.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry and return how many went.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        // A poisoned map is still structurally valid; keep serving it.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new(BlobPolicy::default())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn store(
        &self,
        prefix: &str,
        bytes: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<BlobKey, RelayError> {
        let key = BlobKey::generate(prefix);
        let ttl = self.policy.resolve_ttl(prefix, ttl);
        debug!(key = %key, bytes = bytes.len(), ttl_secs = ttl.as_secs(), "Stored blob");
        self.lock().insert(
            key.as_str().to_string(),
            Entry {
                bytes,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(key)
    }

    async fn load(&self, key: &BlobKey, destructive: bool) -> Result<Vec<u8>, RelayError> {
        let now = Instant::now();
        let mut entries = self.lock();
        let live = entries
            .get(key.as_str())
            .map(|e| e.expires_at > now)
            .unwrap_or(false);
        if !live {
            entries.remove(key.as_str());
            return Err(RelayError::BlobNotFound {
                key: key.to_string(),
            });
        }
        if destructive {
            entries
                .remove(key.as_str())
                .map(|e| e.bytes)
                .ok_or_else(|| RelayError::BlobNotFound {
                    key: key.to_string(),
                })
        } else {
            entries
                .get(key.as_str())
                .map(|e| e.bytes.clone())
                .ok_or_else(|| RelayError::BlobNotFound {
                    key: key.to_string(),
                })
        }
    }

    async fn delete(&self, key: &BlobKey) -> Result<(), RelayError> {
        self.lock().remove(key.as_str());
        Ok(())
    }

    async fn delete_many(&self, keys: &[BlobKey]) -> Result<(), RelayError> {
        let mut entries = self.lock();
        for key in keys {
            entries.remove(key.as_str());
        }
        Ok(())
    }
}

// ── Redis store ──────────────────────────────────────────────────────────

#[cfg(feature = "redis")]
pub use self::redis_store::RedisBlobStore;

#[cfg(feature = "redis")]
mod redis_store {
    use super::*;
    use redis::aio::MultiplexedConnection;

    /// Blob store shared between processes through Redis.
    ///
    /// Destructive loads use `GETDEL`, which Redis executes atomically.
    pub struct RedisBlobStore {
        policy: BlobPolicy,
        conn: MultiplexedConnection,
    }

    impl RedisBlobStore {
        pub async fn connect(url: &str, policy: BlobPolicy) -> Result<Self, RelayError> {
            let client = redis::Client::open(url).map_err(backend)?;
            let conn = client
                .get_multiplexed_async_connection()
                .await
                .map_err(backend)?;
            Ok(Self { policy, conn })
        }
    }

    fn backend(err: redis::RedisError) -> RelayError {
        RelayError::BlobBackend(err.to_string())
    }

    #[async_trait]
    impl BlobStore for RedisBlobStore {
        async fn store(
            &self,
            prefix: &str,
            bytes: Vec<u8>,
            ttl: Option<Duration>,
        ) -> Result<BlobKey, RelayError> {
            let key = BlobKey::generate(prefix);
            let ttl = self.policy.resolve_ttl(prefix, ttl).as_secs().max(1);
            let mut conn = self.conn.clone();
            redis::cmd("SET")
                .arg(key.as_str())
                .arg(bytes.as_slice())
                .arg("EX")
                .arg(ttl)
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(backend)?;
            debug!(key = %key, bytes = bytes.len(), ttl_secs = ttl, "Stored blob in redis");
            Ok(key)
        }

        async fn load(&self, key: &BlobKey, destructive: bool) -> Result<Vec<u8>, RelayError> {
            let mut conn = self.conn.clone();
            let command = if destructive { "GETDEL" } else { "GET" };
            let data: Option<Vec<u8>> = redis::cmd(command)
                .arg(key.as_str())
                .query_async(&mut conn)
                .await
                .map_err(backend)?;
            data.ok_or_else(|| RelayError::BlobNotFound {
                key: key.to_string(),
            })
        }

        async fn delete(&self, key: &BlobKey) -> Result<(), RelayError> {
            self.delete_many(std::slice::from_ref(key)).await
        }

        async fn delete_many(&self, keys: &[BlobKey]) -> Result<(), RelayError> {
            if keys.is_empty() {
                return Ok(());
            }
            let names: Vec<&str> = keys.iter().map(BlobKey::as_str).collect();
            let mut conn = self.conn.clone();
            redis::cmd("DEL")
                .arg(&names)
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(backend)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryBlobStore {
        MemoryBlobStore::default()
    }

    #[test]
    fn key_parsing() {
        let key = BlobKey::parse("renderpng:abc").unwrap();
        assert_eq!(key.prefix(), "renderpng");
        assert!(BlobKey::parse("nocolon").is_err());
        assert!(BlobKey::parse(":id").is_err());
        assert!(BlobKey::parse("prefix:").is_err());
    }

    #[test]
    fn generated_keys_are_unique_and_prefixed() {
        let a = BlobKey::generate("source");
        let b = BlobKey::generate("source");
        assert_ne!(a, b);
        assert_eq!(a.prefix(), "source");
    }

    #[test]
    fn key_serde_validates() {
        let ok: BlobKey = serde_json::from_str("\"preview:1\"").unwrap();
        assert_eq!(ok.as_str(), "preview:1");
        assert!(serde_json::from_str::<BlobKey>("\"broken\"").is_err());
    }

    #[test]
    fn ttl_resolution_by_class() {
        let policy = BlobPolicy::default();
        let s = policy.settings().clone();
        assert_eq!(policy.default_ttl("renderpng"), s.fullres_ttl);
        assert_eq!(policy.default_ttl("preview"), s.preview_ttl);
        assert_eq!(policy.default_ttl("whatever"), s.source_ttl);
        assert_eq!(
            policy.resolve_ttl("renderpng", Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
        assert_eq!(
            policy.resolve_ttl("renderpng", Some(Duration::ZERO)),
            s.fullres_ttl
        );
    }

    #[tokio::test]
    async fn peek_keeps_destructive_removes() {
        let store = store();
        let key = store.store("renderpng", b"png".to_vec(), None).await.unwrap();

        assert_eq!(store.load(&key, false).await.unwrap(), b"png");
        assert_eq!(store.load(&key, true).await.unwrap(), b"png");

        let err = store.load(&key, true).await.unwrap_err();
        assert!(matches!(err, RelayError::BlobNotFound { .. }));
        assert!(store.load(&key, false).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_destructive_loads_have_one_winner() {
        let store = std::sync::Arc::new(store());
        let key = store.store("renderpng", vec![1, 2, 3], None).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move { store.load(&key, true).await.is_ok() }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_blobs_are_not_found() {
        let store = store();
        let key = store
            .store("source", b"doc".to_vec(), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(matches!(
            store.load(&key, false).await,
            Err(RelayError::BlobNotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_only_expired() {
        let store = store();
        store
            .store("source", vec![0], Some(Duration::from_secs(1)))
            .await
            .unwrap();
        store
            .store("source", vec![1], Some(Duration::from_secs(100)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn deletes_are_idempotent() {
        let store = store();
        let a = store.store("source", vec![0], None).await.unwrap();
        let b = store.store("source", vec![1], None).await.unwrap();
        store.delete(&a).await.unwrap();
        store.delete(&a).await.unwrap();
        store.delete_many(&[a.clone(), b.clone()]).await.unwrap();
        store.delete_many(&[]).await.unwrap();
        assert!(store.is_empty());
    }
}
