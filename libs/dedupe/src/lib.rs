//! Dedupe cache (C1) and idempotency key builder (C3) for the inbound pipeline.
//!
//! The cache is eventually consistent: a local map is always consulted, and an
//! optional external backend can be layered on top so that dedupe survives
//! process restarts and is shared across replicas.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;
use tracing::warn;

/// Local cache size above which a stale sweep clears the whole map rather than
/// scanning entry by entry. Mirrors the source's `massivePurge` safety valve.
const MAX_LOCAL_ENTRIES: usize = 10_000;

/// Default TTL applied to message and ACK dedupe keys.
pub const DEFAULT_TTL: Duration = Duration::hours(24);

/// External dedupe backend (e.g. a shared cache) consulted before the local map.
#[async_trait]
pub trait DedupeBackend: Send + Sync {
    async fn has(&self, key: &str) -> anyhow::Result<bool>;
    async fn set(&self, key: &str, ttl: Duration) -> anyhow::Result<()>;
}

pub type SharedDedupeBackend = Arc<dyn DedupeBackend>;

/// TTL-bounded set of seen keys with an optional external backend.
#[derive(Clone)]
pub struct DedupeCache {
    local: Arc<RwLock<HashMap<String, OffsetDateTime>>>,
    backend: Option<SharedDedupeBackend>,
}

impl DedupeCache {
    pub fn new() -> Self {
        Self {
            local: Arc::new(RwLock::new(HashMap::new())),
            backend: None,
        }
    }

    pub fn with_backend(backend: SharedDedupeBackend) -> Self {
        Self {
            local: Arc::new(RwLock::new(HashMap::new())),
            backend: Some(backend),
        }
    }

    /// Returns `true` if `key` has already been seen (and should be skipped).
    /// Never registers the key itself. Sweeps expired entries out of the
    /// local map on every call, the same as `register`, so a key that is
    /// checked repeatedly but never re-registered is still reclaimed once it
    /// expires rather than lingering until the next write.
    pub async fn skip(&self, key: &str, ttl: Duration) -> bool {
        if ttl <= Duration::ZERO {
            return false;
        }
        if let Some(backend) = &self.backend {
            match backend.has(key).await {
                Ok(seen) => return seen,
                Err(err) => {
                    warn!(error = %err, "dedupe backend unavailable, falling back to local cache");
                }
            }
        }
        let now = OffsetDateTime::now_utc();
        let mut guard = self.local.write().await;
        guard.retain(|_, expires| *expires > now);
        matches!(guard.get(key), Some(expires) if *expires > now)
    }

    /// Registers `key` as seen for `ttl`. Idempotent.
    pub async fn register(&self, key: &str, ttl: Duration) {
        if ttl <= Duration::ZERO {
            return;
        }
        if let Some(backend) = &self.backend {
            if let Err(err) = backend.set(key, ttl).await {
                warn!(error = %err, "dedupe backend write failed, writing local only");
            }
        }
        let now = OffsetDateTime::now_utc();
        let mut guard = self.local.write().await;
        if guard.len() >= MAX_LOCAL_ENTRIES {
            warn!(size = guard.len(), "dedupe cache over capacity, clearing");
            guard.clear();
        }
        guard.retain(|_, expires| *expires > now);
        guard.insert(key.to_string(), now + ttl);
    }

    /// Clears the local cache. Intended for tests.
    pub async fn reset(&self) {
        self.local.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.local.read().await.len()
    }
}

impl Default for DedupeCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the stable idempotency key used to gate inbound messages and ACKs.
///
/// Unknown/empty fields are substituted with `"unknown"` so the resulting key
/// stays deterministic and never contains the field separator itself.
pub fn idempotency_key(tenant_id: &str, instance_id: &str, message_id: &str, index: usize) -> String {
    let clean = |s: &str| -> String {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            "unknown".to_string()
        } else {
            trimmed.replace('|', "_").to_lowercase()
        }
    };
    format!(
        "{}|{}|{}|{}",
        clean(tenant_id),
        clean(instance_id),
        clean(message_id),
        index
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cache_dedupes_within_ttl() {
        let cache = DedupeCache::new();
        let key = idempotency_key("tenant-A", "inst-1", "wamid-1", 0);
        assert!(!cache.skip(&key, DEFAULT_TTL).await);
        cache.register(&key, DEFAULT_TTL).await;
        assert!(cache.skip(&key, DEFAULT_TTL).await);
    }

    #[tokio::test]
    async fn zero_ttl_is_noop() {
        let cache = DedupeCache::new();
        let key = idempotency_key("t", "i", "m", 0);
        cache.register(&key, Duration::ZERO).await;
        assert!(!cache.skip(&key, Duration::ZERO).await);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn expired_entries_are_not_seen() {
        let cache = DedupeCache::new();
        let key = idempotency_key("t", "i", "m", 0);
        cache.register(&key, Duration::milliseconds(10)).await;
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(!cache.skip(&key, DEFAULT_TTL).await);
    }

    #[tokio::test]
    async fn skip_prunes_expired_entries_without_a_register_call() {
        let cache = DedupeCache::new();
        let key = idempotency_key("t", "i", "m", 0);
        cache.register(&key, Duration::milliseconds(10)).await;
        assert_eq!(cache.len().await, 1);
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(!cache.skip(&key, DEFAULT_TTL).await);
        assert_eq!(cache.len().await, 0);
    }

    #[test]
    fn key_normalizes_unknown_fields() {
        let key = idempotency_key("Tenant-A", "", "WAMID-1", 2);
        assert_eq!(key, "tenant-a|unknown|wamid-1|2");
    }

    #[test]
    fn key_is_stable_for_same_inputs() {
        let a = idempotency_key("t", "i", "m", 1);
        let b = idempotency_key("t", "i", "m", 1);
        assert_eq!(a, b);
    }

    struct FlakyBackend;

    #[async_trait]
    impl DedupeBackend for FlakyBackend {
        async fn has(&self, _key: &str) -> anyhow::Result<bool> {
            anyhow::bail!("backend down")
        }

        async fn set(&self, _key: &str, _ttl: Duration) -> anyhow::Result<()> {
            anyhow::bail!("backend down")
        }
    }

    #[tokio::test]
    async fn falls_back_to_local_when_backend_errors() {
        let cache = DedupeCache::with_backend(Arc::new(FlakyBackend));
        let key = idempotency_key("t", "i", "m", 0);
        assert!(!cache.skip(&key, DEFAULT_TTL).await);
        cache.register(&key, DEFAULT_TTL).await;
        assert!(cache.skip(&key, DEFAULT_TTL).await);
    }
}
