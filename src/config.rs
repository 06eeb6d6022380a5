use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::EvictionPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Immutable application configuration. Built once at startup from
/// defaults, optionally deep-merged with a JSON file, then passed by
/// reference to every component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub strategy: StrategyConfig,
    pub chunking: ChunkingConfig,
    pub workers: WorkerConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub checkpoint: CheckpointConfig,
    pub engine: EngineConfig,
}

impl AppConfig {
    /// Load configuration, merging the JSON file at `path` (if given)
    /// over defaults. Missing sections and fields keep their defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                Ok(serde_json::from_str(&raw)?)
            }
            None => Ok(Self::default()),
        }
    }
}

/// Size thresholds steering strategy selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Files at or under this size skip chunking entirely.
    pub direct_limit_bytes: u64,
    /// Upper bound of the smart_split bucket.
    pub smart_split_limit_bytes: u64,
    /// Upper bound of the streaming_parallel bucket; larger files use
    /// full_streaming.
    pub streaming_limit_bytes: u64,
    /// Available/total memory ratio below which the controller forces
    /// a conservative strategy.
    pub low_memory_fraction: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            direct_limit_bytes: 100 * 1024 * 1024,
            smart_split_limit_bytes: 500 * 1024 * 1024,
            streaming_limit_bytes: 2 * 1024 * 1024 * 1024,
            low_memory_fraction: 0.15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub target_chunk_bytes: u64,
    /// Chunk size used when memory pressure forces the smallest cuts.
    pub min_chunk_bytes: u64,
    /// Hard per-chunk duration cap, independent of bitrate.
    pub max_chunk_duration_secs: f64,
    pub overlap_seconds: f64,
    /// Silence detection runs only for audio shorter than this.
    pub silence_analysis_limit_secs: f64,
    pub silence_threshold: f32,
    pub min_silence_duration_secs: f64,
    /// Fraction of the target duration a silence cut may deviate from
    /// the exact boundary.
    pub cut_tolerance_fraction: f64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_chunk_bytes: 25 * 1024 * 1024,
            min_chunk_bytes: 5 * 1024 * 1024,
            max_chunk_duration_secs: 600.0,
            overlap_seconds: 2.0,
            silence_analysis_limit_secs: 1800.0,
            silence_threshold: 0.01,
            min_silence_duration_secs: 0.5,
            cut_tolerance_fraction: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub task_timeout_secs: u64,
    /// Idle units beyond the minimum are retired after this long.
    pub idle_timeout_secs: u64,
    /// Cadence of the auto-scale and health sweep.
    pub maintenance_interval_ms: u64,
    /// Extra time past the task timeout before a unit is declared
    /// unresponsive and replaced.
    pub unresponsive_grace_secs: u64,
}

impl WorkerConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    pub fn unresponsive_grace(&self) -> Duration {
        Duration::from_secs(self.unresponsive_grace_secs)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 4,
            task_timeout_secs: 120,
            idle_timeout_secs: 30,
            maintenance_interval_ms: 500,
            unresponsive_grace_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt, so a task runs at most
    /// `max_retries + 1` times.
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl RetryConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub memory: CacheTierConfig,
    pub persistent: CacheTierConfig,
    /// Persistent entries unread for this long are swept.
    pub ttl_secs: u64,
    /// Persistent-tier access count after which an entry is promoted
    /// into the memory tier.
    pub promote_after_accesses: u64,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory: CacheTierConfig {
                capacity_bytes: 256 * 1024 * 1024,
                eviction: EvictionPolicy::Lru,
            },
            persistent: CacheTierConfig {
                capacity_bytes: 1024 * 1024 * 1024,
                eviction: EvictionPolicy::Lru,
            },
            ttl_secs: 7 * 24 * 3600,
            promote_after_accesses: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheTierConfig {
    pub capacity_bytes: u64,
    pub eviction: EvictionPolicy,
}

impl Default for CacheTierConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 256 * 1024 * 1024,
            eviction: EvictionPolicy::Lru,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub autosave_interval_secs: u64,
    /// Terminal sessions older than this are eligible for pruning.
    pub retention_days: i64,
}

impl CheckpointConfig {
    pub fn autosave_interval(&self) -> Duration {
        Duration::from_secs(self.autosave_interval_secs)
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            autosave_interval_secs: 10,
            retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub endpoint: String,
    pub model: String,
    pub request_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/audio/transcriptions".to_string(),
            model: "whisper-1".to_string(),
            request_timeout_secs: 300,
        }
    }
}
