use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Rule for choosing which entry to remove when a cache tier is over
/// capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Evict the entry with the oldest access time.
    Lru,
    /// Evict the entry with the lowest access count.
    Lfu,
    /// Evict the entry with the oldest creation time.
    Fifo,
}

/// The bookkeeping a policy needs to rank one entry.
pub struct EvictionView<'a> {
    pub key: &'a str,
    pub accessed_at: DateTime<Utc>,
    pub access_count: u64,
    pub created_at: DateTime<Utc>,
}

impl EvictionPolicy {
    /// Pick the key to evict next, or `None` when there is nothing
    /// left to evict.
    pub fn pick_victim<'a>(
        &self,
        entries: impl Iterator<Item = EvictionView<'a>>,
    ) -> Option<String> {
        let victim = match self {
            EvictionPolicy::Lru => entries.min_by_key(|e| e.accessed_at),
            EvictionPolicy::Lfu => entries.min_by_key(|e| (e.access_count, e.accessed_at)),
            EvictionPolicy::Fifo => entries.min_by_key(|e| e.created_at),
        };
        victim.map(|e| e.key.to_string())
    }
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EvictionPolicy::Lru => "lru",
            EvictionPolicy::Lfu => "lfu",
            EvictionPolicy::Fifo => "fifo",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for EvictionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lru" => Ok(EvictionPolicy::Lru),
            "lfu" => Ok(EvictionPolicy::Lfu),
            "fifo" => Ok(EvictionPolicy::Fifo),
            other => Err(format!("unknown eviction policy: {}", other)),
        }
    }
}
