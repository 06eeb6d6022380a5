mod memory;
mod persistent;
mod policy;

pub use policy::EvictionPolicy;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::config::CacheConfig;
use crate::db::KvStore;
use memory::MemoryTier;
use persistent::PersistentTier;

/// Namespace holding raw chunk audio, keyed by content hash.
pub const AUDIO_NAMESPACE: &str = "chunk-audio";
/// Namespace holding transcription results, keyed by
/// hash + model + language.
pub const TRANSCRIPT_NAMESPACE: &str = "transcripts";

/// Compose the transcript-namespace key for one chunk's result.
pub fn transcript_key(audio_hash: &str, model: &str, language: Option<&str>) -> String {
    format!("{}:{}:{}", audio_hash, model, language.unwrap_or("auto"))
}

#[derive(Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    writes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writes: u64,
    pub memory_entries: usize,
    pub memory_bytes: u64,
}

/// Content-addressable cache: a bounded memory tier in front of a
/// bounded persistent tier. Never fails the caller; storage trouble
/// degrades to misses and dropped writes.
pub struct CacheStore {
    namespace: String,
    memory: MemoryTier,
    persistent: PersistentTier,
    promote_after: u64,
    ttl: Duration,
    stats: CacheStats,
}

impl CacheStore {
    pub async fn open(config: &CacheConfig, store: Arc<dyn KvStore>, namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            memory: MemoryTier::new(config.memory.capacity_bytes, config.memory.eviction),
            persistent: PersistentTier::open(
                store,
                namespace,
                config.persistent.capacity_bytes,
                config.persistent.eviction,
            )
            .await,
            promote_after: config.promote_after_accesses,
            ttl: config.ttl(),
            stats: CacheStats::default(),
        }
    }

    /// Memory tier first; on a persistent hit the entry is promoted
    /// into memory once its access count crosses the threshold.
    pub async fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        if let Some(payload) = self.memory.get(key) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Some(payload);
        }

        match self.persistent.get(key).await {
            Some((payload, access_count)) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                let payload = Arc::new(payload);
                if access_count >= self.promote_after {
                    let outcome = self.memory.put(key, Arc::clone(&payload));
                    self.stats.evictions.fetch_add(outcome.evicted, Ordering::Relaxed);
                    if outcome.stored {
                        debug!("Promoted {} into memory tier of {}", key, self.namespace);
                    }
                }
                Some(payload)
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Write through both tiers. A payload neither tier can fit is
    /// silently refused.
    pub async fn put(&self, key: &str, payload: Arc<Vec<u8>>) {
        let memory_outcome = self.memory.put(key, Arc::clone(&payload));
        self.stats
            .evictions
            .fetch_add(memory_outcome.evicted, Ordering::Relaxed);

        let persistent_outcome = self.persistent.put(key, &payload).await;
        self.stats
            .evictions
            .fetch_add(persistent_outcome.evicted, Ordering::Relaxed);

        if memory_outcome.stored || persistent_outcome.stored {
            self.stats.writes.fetch_add(1, Ordering::Relaxed);
        } else {
            debug!(
                "Cache put refused for {} in {} (entry does not fit)",
                key, self.namespace
            );
        }
    }

    /// Drop persistent entries unread for longer than the TTL.
    pub async fn sweep_expired(&self) -> usize {
        let swept = self.persistent.sweep_expired(self.ttl).await;
        debug!(
            "{}: swept {}, persistent tier holds {} entries ({} bytes)",
            self.namespace,
            swept,
            self.persistent.entry_count().await,
            self.persistent.used_bytes().await
        );
        swept
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            writes: self.stats.writes.load(Ordering::Relaxed),
            memory_entries: self.memory.entry_count(),
            memory_bytes: self.memory.used_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheTierConfig;
    use crate::db::MemoryKv;

    fn config(memory_capacity: u64, persistent_capacity: u64) -> CacheConfig {
        CacheConfig {
            memory: CacheTierConfig {
                capacity_bytes: memory_capacity,
                eviction: EvictionPolicy::Lru,
            },
            persistent: CacheTierConfig {
                capacity_bytes: persistent_capacity,
                eviction: EvictionPolicy::Lru,
            },
            ttl_secs: 3600,
            promote_after_accesses: 2,
        }
    }

    async fn open_store(memory_capacity: u64, persistent_capacity: u64) -> CacheStore {
        CacheStore::open(
            &config(memory_capacity, persistent_capacity),
            Arc::new(MemoryKv::new()),
            "test-ns",
        )
        .await
    }

    #[tokio::test]
    async fn test_miss_then_hit_counts() {
        let store = open_store(1000, 1000).await;

        assert!(store.get("k").await.is_none());
        store.put("k", Arc::new(vec![1, 2, 3])).await;
        let payload = store.get("k").await.unwrap();
        assert_eq!(*payload, vec![1, 2, 3]);

        let stats = store.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.writes, 1);
    }

    #[tokio::test]
    async fn test_promotion_after_threshold() {
        // Memory holds one 40 byte entry at a time, so "a" gets pushed
        // out and must come back through the persistent tier.
        let store = open_store(50, 1000).await;
        store.put("a", Arc::new(vec![0; 40])).await;
        store.put("b", Arc::new(vec![0; 40])).await;
        assert!(store.memory.get("a").is_none());

        // First persistent hit: count 1, below the threshold of 2.
        assert!(store.get("a").await.is_some());
        assert!(store.memory.get("a").is_none());

        // Second hit crosses the threshold and promotes.
        assert!(store.get("a").await.is_some());
        assert!(store.memory.get("a").is_some());

        // Third read is served from memory.
        assert!(store.get("a").await.is_some());
        assert_eq!(store.stats().hits, 3);
    }

    #[tokio::test]
    async fn test_oversized_put_is_noop() {
        let store = open_store(10, 10).await;
        store.put("big", Arc::new(vec![0; 100])).await;

        assert!(store.get("big").await.is_none());
        let stats = store.stats();
        assert_eq!(stats.writes, 0);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_duplicate_content_shares_one_entry() {
        let store = open_store(1000, 1000).await;
        store.put("hash", Arc::new(vec![7; 10])).await;
        store.put("hash", Arc::new(vec![7; 10])).await;

        assert_eq!(store.memory.entry_count(), 1);
        assert!(store.get("hash").await.is_some());
    }

    #[test]
    fn test_transcript_key_composition() {
        assert_eq!(
            transcript_key("abc123", "whisper-1", Some("en")),
            "abc123:whisper-1:en"
        );
        assert_eq!(
            transcript_key("abc123", "whisper-1", None),
            "abc123:whisper-1:auto"
        );
    }
}
