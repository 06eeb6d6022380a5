use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::policy::{EvictionPolicy, EvictionView};

struct MemoryEntry {
    payload: Arc<Vec<u8>>,
    size_bytes: u64,
    access_count: u64,
    accessed_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

/// What a `put` did: whether the entry was stored and how many
/// victims were evicted to make room.
pub struct PutOutcome {
    pub stored: bool,
    pub evicted: u64,
}

/// Bounded in-memory cache tier. Reads go straight through the
/// concurrent map; writes are serialized so the capacity invariant
/// holds across eviction and insert.
pub struct MemoryTier {
    entries: DashMap<String, MemoryEntry>,
    used_bytes: AtomicU64,
    capacity_bytes: u64,
    policy: EvictionPolicy,
    write_lock: Mutex<()>,
}

impl MemoryTier {
    pub fn new(capacity_bytes: u64, policy: EvictionPolicy) -> Self {
        Self {
            entries: DashMap::new(),
            used_bytes: AtomicU64::new(0),
            capacity_bytes,
            policy,
            write_lock: Mutex::new(()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        let mut entry = self.entries.get_mut(key)?;
        entry.access_count += 1;
        entry.accessed_at = Utc::now();
        Some(Arc::clone(&entry.payload))
    }

    /// Insert `payload` under `key`, evicting per policy until it
    /// fits. An entry larger than the whole tier is refused.
    pub fn put(&self, key: &str, payload: Arc<Vec<u8>>) -> PutOutcome {
        let size = payload.len() as u64;
        let mut evicted = 0;

        if size > self.capacity_bytes {
            return PutOutcome {
                stored: false,
                evicted,
            };
        }

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        // Replacing an existing entry frees its space first.
        if let Some((_, old)) = self.entries.remove(key) {
            self.used_bytes.fetch_sub(old.size_bytes, Ordering::Relaxed);
        }

        while self.used_bytes.load(Ordering::Relaxed) + size > self.capacity_bytes {
            let views: Vec<(String, DateTime<Utc>, u64, DateTime<Utc>)> = self
                .entries
                .iter()
                .map(|e| (e.key().clone(), e.accessed_at, e.access_count, e.created_at))
                .collect();
            let victim = self
                .policy
                .pick_victim(views.iter().map(|(k, accessed, count, created)| {
                    EvictionView {
                        key: k,
                        accessed_at: *accessed,
                        access_count: *count,
                        created_at: *created,
                    }
                }));

            match victim {
                Some(victim_key) => {
                    if let Some((_, old)) = self.entries.remove(&victim_key) {
                        self.used_bytes.fetch_sub(old.size_bytes, Ordering::Relaxed);
                        evicted += 1;
                    }
                }
                None => break,
            }
        }

        if self.used_bytes.load(Ordering::Relaxed) + size > self.capacity_bytes {
            return PutOutcome {
                stored: false,
                evicted,
            };
        }

        let now = Utc::now();
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                payload,
                size_bytes: size,
                access_count: 0,
                accessed_at: now,
                created_at: now,
            },
        );
        self.used_bytes.fetch_add(size, Ordering::Relaxed);

        PutOutcome {
            stored: true,
            evicted,
        }
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Relaxed)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}
