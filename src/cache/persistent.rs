use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::memory::PutOutcome;
use super::policy::{EvictionPolicy, EvictionView};
use crate::db::KvStore;

/// Per-entry bookkeeping, stored as a small JSON record beside the
/// payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryMeta {
    size_bytes: u64,
    access_count: u64,
    accessed_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

fn meta_namespace(namespace: &str) -> String {
    format!("{}.meta", namespace)
}

struct TierIndex {
    used_bytes: u64,
    meta: HashMap<String, EntryMeta>,
}

/// Bounded persistent cache tier over the key/value store. Payloads
/// are stored raw; each entry's bookkeeping lives in a sibling
/// `<namespace>.meta` record, so rebuilding the index on open and
/// bumping access counters never read or rewrite payload blobs.
pub struct PersistentTier {
    store: Arc<dyn KvStore>,
    namespace: String,
    meta_namespace: String,
    capacity_bytes: u64,
    policy: EvictionPolicy,
    index: Mutex<TierIndex>,
}

impl PersistentTier {
    pub async fn open(
        store: Arc<dyn KvStore>,
        namespace: &str,
        capacity_bytes: u64,
        policy: EvictionPolicy,
    ) -> Self {
        let meta_ns = meta_namespace(namespace);
        let mut meta = HashMap::new();
        let mut used_bytes = 0u64;

        match store.scan(&meta_ns).await {
            Ok(rows) => {
                for (key, bytes) in rows {
                    match serde_json::from_slice::<EntryMeta>(&bytes) {
                        Ok(entry_meta) => {
                            used_bytes += entry_meta.size_bytes;
                            meta.insert(key, entry_meta);
                        }
                        Err(e) => {
                            warn!(
                                "Dropping malformed cache metadata {}/{}: {}",
                                namespace, key, e
                            );
                            if let Err(e) = store.delete(&meta_ns, &key).await {
                                warn!("Could not delete malformed metadata {}: {}", key, e);
                            }
                            if let Err(e) = store.delete(namespace, &key).await {
                                warn!("Could not delete orphaned payload {}: {}", key, e);
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!("Could not scan cache namespace {}: {}", meta_ns, e);
            }
        }

        debug!(
            "Opened cache namespace {} with {} entries ({} bytes)",
            namespace,
            meta.len(),
            used_bytes
        );

        Self {
            store,
            namespace: namespace.to_string(),
            meta_namespace: meta_ns,
            capacity_bytes,
            policy,
            index: Mutex::new(TierIndex { used_bytes, meta }),
        }
    }

    /// Fetch a payload and bump its counters. Returns the payload and
    /// the updated access count so the caller can decide promotion.
    /// Storage failures read as a miss.
    pub async fn get(&self, key: &str) -> Option<(Vec<u8>, u64)> {
        let mut index = self.index.lock().await;
        let Some(mut meta) = index.meta.get(key).cloned() else {
            return None;
        };

        let payload = match self.store.get(&self.namespace, key).await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                // Index drifted from the store; heal it.
                if let Some(old) = index.meta.remove(key) {
                    index.used_bytes = index.used_bytes.saturating_sub(old.size_bytes);
                }
                if let Err(e) = self.store.delete(&self.meta_namespace, key).await {
                    warn!("Could not delete stale metadata {}: {}", key, e);
                }
                return None;
            }
            Err(e) => {
                warn!("Cache read failed for {}/{}: {}", self.namespace, key, e);
                return None;
            }
        };

        meta.access_count += 1;
        meta.accessed_at = Utc::now();
        match serde_json::to_vec(&meta) {
            Ok(bytes) => {
                if let Err(e) = self.store.put(&self.meta_namespace, key, &bytes).await {
                    warn!(
                        "Cache counter update dropped for {}/{}: {}",
                        self.namespace, key, e
                    );
                }
            }
            Err(e) => {
                warn!("Could not encode cache metadata {}: {}", key, e);
            }
        }

        let access_count = meta.access_count;
        index.meta.insert(key.to_string(), meta);
        Some((payload, access_count))
    }

    /// Store a payload, evicting per policy until it fits. Storage
    /// failures drop the write.
    pub async fn put(&self, key: &str, payload: &[u8]) -> PutOutcome {
        let size = payload.len() as u64;
        let mut evicted = 0;

        if size > self.capacity_bytes {
            return PutOutcome {
                stored: false,
                evicted,
            };
        }

        let mut index = self.index.lock().await;

        if let Some(old) = index.meta.remove(key) {
            index.used_bytes = index.used_bytes.saturating_sub(old.size_bytes);
        }

        while index.used_bytes + size > self.capacity_bytes {
            let victim = self
                .policy
                .pick_victim(index.meta.iter().map(|(k, m)| EvictionView {
                    key: k,
                    accessed_at: m.accessed_at,
                    access_count: m.access_count,
                    created_at: m.created_at,
                }));

            match victim {
                Some(victim_key) => {
                    if let Err(e) = self.store.delete(&self.namespace, &victim_key).await {
                        warn!(
                            "Cache eviction delete failed for {}/{}: {}",
                            self.namespace, victim_key, e
                        );
                    }
                    if let Err(e) = self.store.delete(&self.meta_namespace, &victim_key).await {
                        warn!(
                            "Cache eviction metadata delete failed for {}: {}",
                            victim_key, e
                        );
                    }
                    if let Some(old) = index.meta.remove(&victim_key) {
                        index.used_bytes = index.used_bytes.saturating_sub(old.size_bytes);
                        evicted += 1;
                    }
                }
                None => break,
            }
        }

        if index.used_bytes + size > self.capacity_bytes {
            return PutOutcome {
                stored: false,
                evicted,
            };
        }

        let now = Utc::now();
        let meta = EntryMeta {
            size_bytes: size,
            access_count: 0,
            accessed_at: now,
            created_at: now,
        };
        let meta_bytes = match serde_json::to_vec(&meta) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Could not encode cache metadata {}: {}", key, e);
                return PutOutcome {
                    stored: false,
                    evicted,
                };
            }
        };
        if let Err(e) = self.store.put(&self.namespace, key, payload).await {
            warn!("Cache write dropped for {}/{}: {}", self.namespace, key, e);
            return PutOutcome {
                stored: false,
                evicted,
            };
        }
        if let Err(e) = self.store.put(&self.meta_namespace, key, &meta_bytes).await {
            // Without its metadata the payload would be unreachable
            // after a reopen.
            warn!(
                "Cache metadata write dropped for {}/{}: {}",
                self.namespace, key, e
            );
            if let Err(e) = self.store.delete(&self.namespace, key).await {
                warn!("Could not delete unindexed payload {}: {}", key, e);
            }
            return PutOutcome {
                stored: false,
                evicted,
            };
        }

        index.used_bytes += size;
        index.meta.insert(key.to_string(), meta);

        PutOutcome {
            stored: true,
            evicted,
        }
    }

    /// Remove entries not accessed within `ttl`. Returns how many were
    /// removed.
    pub async fn sweep_expired(&self, ttl: Duration) -> usize {
        let Some(cutoff) = TimeDelta::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl))
        else {
            // A TTL too large to represent never expires anything.
            return 0;
        };
        let mut index = self.index.lock().await;

        let expired: Vec<String> = index
            .meta
            .iter()
            .filter(|(_, m)| m.accessed_at < cutoff)
            .map(|(k, _)| k.clone())
            .collect();

        let mut removed = 0;
        for key in expired {
            if let Err(e) = self.store.delete(&self.namespace, &key).await {
                warn!("Cache sweep delete failed for {}/{}: {}", self.namespace, key, e);
                continue;
            }
            if let Err(e) = self.store.delete(&self.meta_namespace, &key).await {
                warn!("Cache sweep metadata delete failed for {}: {}", key, e);
            }
            if let Some(old) = index.meta.remove(&key) {
                index.used_bytes = index.used_bytes.saturating_sub(old.size_bytes);
                removed += 1;
            }
        }

        if removed > 0 {
            debug!("Swept {} expired entries from {}", removed, self.namespace);
        }
        removed
    }

    pub async fn used_bytes(&self) -> u64 {
        self.index.lock().await.used_bytes
    }

    pub async fn entry_count(&self) -> usize {
        self.index.lock().await.meta.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{KvError, MemoryKv};

    fn kv() -> Arc<dyn KvStore> {
        Arc::new(MemoryKv::new())
    }

    /// Wraps the in-memory store and records which namespaces each
    /// read-side call touches.
    #[derive(Default)]
    struct RecordingKv {
        inner: MemoryKv,
        scans: std::sync::Mutex<Vec<String>>,
        gets: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl KvStore for RecordingKv {
        async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, KvError> {
            self.gets.lock().unwrap().push(namespace.to_string());
            self.inner.get(namespace, key).await
        }

        async fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), KvError> {
            self.inner.put(namespace, key, value).await
        }

        async fn delete(&self, namespace: &str, key: &str) -> Result<(), KvError> {
            self.inner.delete(namespace, key).await
        }

        async fn scan(&self, namespace: &str) -> Result<Vec<(String, Vec<u8>)>, KvError> {
            self.scans.lock().unwrap().push(namespace.to_string());
            self.inner.scan(namespace).await
        }
    }

    #[tokio::test]
    async fn test_roundtrip_bumps_access_count() {
        let tier = PersistentTier::open(kv(), "transcripts", 1000, EvictionPolicy::Lru).await;
        let outcome = tier.put("abc", b"hello").await;
        assert!(outcome.stored);

        let (payload, count) = tier.get("abc").await.unwrap();
        assert_eq!(payload, b"hello");
        assert_eq!(count, 1);

        let (_, count) = tier.get("abc").await.unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_eviction_respects_capacity_and_lru() {
        let tier = PersistentTier::open(kv(), "chunk-audio", 100, EvictionPolicy::Lru).await;
        tier.put("a", &[0u8; 40]).await;
        tier.put("b", &[0u8; 40]).await;
        assert!(tier.get("a").await.is_some());

        let outcome = tier.put("c", &[0u8; 40]).await;
        assert!(outcome.stored);
        assert_eq!(outcome.evicted, 1);
        assert!(tier.get("b").await.is_none());
        assert!(tier.get("a").await.is_some());
        assert!(tier.used_bytes().await <= 100);
    }

    #[tokio::test]
    async fn test_index_rebuilds_after_reopen() {
        let store = kv();
        {
            let tier =
                PersistentTier::open(Arc::clone(&store), "ns", 1000, EvictionPolicy::Lru).await;
            tier.put("persisted", b"payload bytes").await;
        }

        let reopened = PersistentTier::open(store, "ns", 1000, EvictionPolicy::Lru).await;
        assert_eq!(reopened.entry_count().await, 1);
        assert_eq!(reopened.used_bytes().await, 13);
        let (payload, _) = reopened.get("persisted").await.unwrap();
        assert_eq!(payload, b"payload bytes");
    }

    #[tokio::test]
    async fn test_reopen_reads_metadata_records_only() {
        let store = Arc::new(RecordingKv::default());
        {
            let tier = PersistentTier::open(
                Arc::clone(&store) as Arc<dyn KvStore>,
                "ns",
                1000,
                EvictionPolicy::Lru,
            )
            .await;
            tier.put("a", &[0u8; 64]).await;
            tier.put("b", &[0u8; 64]).await;
        }

        store.scans.lock().unwrap().clear();
        let reopened = PersistentTier::open(
            Arc::clone(&store) as Arc<dyn KvStore>,
            "ns",
            1000,
            EvictionPolicy::Lru,
        )
        .await;

        assert_eq!(reopened.entry_count().await, 2);
        assert_eq!(reopened.used_bytes().await, 128);
        assert_eq!(*store.scans.lock().unwrap(), vec!["ns.meta".to_string()]);
        assert!(store.gets.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_drops_malformed_metadata() {
        let store = kv();
        store.put("ns", "bad", b"payload").await.unwrap();
        store.put("ns.meta", "bad", b"not json").await.unwrap();

        let tier =
            PersistentTier::open(Arc::clone(&store), "ns", 1000, EvictionPolicy::Lru).await;
        assert_eq!(tier.entry_count().await, 0);
        assert!(tier.get("bad").await.is_none());
        // Both records are gone, not just invisible.
        assert!(store.get("ns", "bad").await.unwrap().is_none());
        assert!(store.get("ns.meta", "bad").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweep_removes_stale_entries() {
        let tier = PersistentTier::open(kv(), "ns", 1000, EvictionPolicy::Lru).await;
        tier.put("stale", b"old").await;

        let removed = tier.sweep_expired(Duration::ZERO).await;
        assert_eq!(removed, 1);
        assert!(tier.get("stale").await.is_none());
        assert_eq!(tier.used_bytes().await, 0);
    }
}
