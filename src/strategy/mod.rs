use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::AppConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Single transcription call, no chunking.
    Direct,
    /// Chunked with silence-aware cuts, moderate parallelism.
    SmartSplit,
    /// Chunked with an explicit worker count.
    StreamingParallel,
    /// Windowed submission with checkpointing for very large files.
    FullStreaming,
}

impl StrategyKind {
    pub fn is_chunked(&self) -> bool {
        !matches!(self, StrategyKind::Direct)
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StrategyKind::Direct => "direct",
            StrategyKind::SmartSplit => "smart_split",
            StrategyKind::StreamingParallel => "streaming_parallel",
            StrategyKind::FullStreaming => "full_streaming",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "direct" => Ok(StrategyKind::Direct),
            "smart_split" => Ok(StrategyKind::SmartSplit),
            "streaming_parallel" => Ok(StrategyKind::StreamingParallel),
            "full_streaming" => Ok(StrategyKind::FullStreaming),
            other => Err(format!("unknown strategy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StrategyParams {
    pub chunk_size_bytes: u64,
    pub overlap_seconds: f64,
    pub worker_count: usize,
}

/// The chunking/parallelism parameters chosen for one file. Immutable
/// for the lifetime of a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Strategy {
    pub kind: StrategyKind,
    pub params: StrategyParams,
}

#[derive(Debug, Clone, Copy)]
pub struct MemorySignal {
    pub available_bytes: u64,
    pub total_bytes: u64,
}

impl MemorySignal {
    pub fn is_low(&self, low_fraction: f64) -> bool {
        self.total_bytes > 0
            && (self.available_bytes as f64 / self.total_bytes as f64) < low_fraction
    }
}

/// Read the current memory signal from /proc/meminfo. Returns `None`
/// off Linux, which callers treat as no pressure.
pub fn read_system_memory() -> Option<MemorySignal> {
    let contents = std::fs::read_to_string("/proc/meminfo").ok()?;
    let mut available = None;
    let mut total = None;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = parse_meminfo_kib(rest);
        } else if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = parse_meminfo_kib(rest);
        }
    }
    Some(MemorySignal {
        available_bytes: available?,
        total_bytes: total?,
    })
}

fn parse_meminfo_kib(rest: &str) -> Option<u64> {
    rest.split_whitespace()
        .next()?
        .parse::<u64>()
        .ok()
        .map(|kib| kib * 1024)
}

/// Pick the processing strategy for a file. Pure decision over the
/// inputs; an explicit override wins, then memory pressure, then the
/// size buckets.
pub fn select_strategy(
    file_size: u64,
    mime_type: Option<&str>,
    memory: Option<MemorySignal>,
    override_kind: Option<StrategyKind>,
    config: &AppConfig,
) -> Strategy {
    let strategy = if let Some(kind) = override_kind {
        Strategy {
            kind,
            params: params_for(kind, file_size, config),
        }
    } else if memory.is_some_and(|m| m.is_low(config.strategy.low_memory_fraction)) {
        // Low memory forces small chunks regardless of file size.
        let mut params = params_for(StrategyKind::StreamingParallel, file_size, config);
        params.chunk_size_bytes = config.chunking.min_chunk_bytes;
        Strategy {
            kind: StrategyKind::StreamingParallel,
            params,
        }
    } else {
        let kind = if file_size < config.strategy.direct_limit_bytes {
            StrategyKind::Direct
        } else if file_size < config.strategy.smart_split_limit_bytes {
            StrategyKind::SmartSplit
        } else if file_size < config.strategy.streaming_limit_bytes {
            StrategyKind::StreamingParallel
        } else {
            StrategyKind::FullStreaming
        };
        Strategy {
            kind,
            params: params_for(kind, file_size, config),
        }
    };

    debug!(
        "Strategy {} for {} byte file (mime {}): chunk_size={} workers={}",
        strategy.kind,
        file_size,
        mime_type.unwrap_or("unknown"),
        strategy.params.chunk_size_bytes,
        strategy.params.worker_count
    );
    strategy
}

fn params_for(kind: StrategyKind, file_size: u64, config: &AppConfig) -> StrategyParams {
    match kind {
        StrategyKind::Direct => StrategyParams {
            chunk_size_bytes: file_size.max(1),
            overlap_seconds: 0.0,
            worker_count: 1,
        },
        StrategyKind::SmartSplit | StrategyKind::StreamingParallel | StrategyKind::FullStreaming => {
            let chunk_size = config.chunking.target_chunk_bytes.max(1);
            let estimated_chunks = file_size.div_ceil(chunk_size).max(1) as usize;
            StrategyParams {
                chunk_size_bytes: chunk_size,
                overlap_seconds: config.chunking.overlap_seconds,
                worker_count: estimated_chunks.clamp(1, config.workers.max_workers),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_size_buckets() {
        let config = AppConfig::default();
        let pick = |size| select_strategy(size, None, None, None, &config).kind;

        assert_eq!(pick(50 * MB), StrategyKind::Direct);
        assert_eq!(pick(120 * MB), StrategyKind::SmartSplit);
        assert_eq!(pick(1024 * MB), StrategyKind::StreamingParallel);
        assert_eq!(pick(3 * 1024 * MB), StrategyKind::FullStreaming);
    }

    #[test]
    fn test_direct_limit_is_exclusive() {
        let config = AppConfig::default();
        let at_limit = select_strategy(config.strategy.direct_limit_bytes, None, None, None, &config);
        assert_eq!(at_limit.kind, StrategyKind::SmartSplit);

        let below = select_strategy(config.strategy.direct_limit_bytes - 1, None, None, None, &config);
        assert_eq!(below.kind, StrategyKind::Direct);
    }

    #[test]
    fn test_chunked_params_bound_workers_by_chunk_count() {
        // 120MB at 25MB per chunk is five chunks; four workers suffice.
        let config = AppConfig::default();
        let strategy = select_strategy(120 * MB, Some("audio/wav"), None, None, &config);
        assert_eq!(strategy.kind, StrategyKind::SmartSplit);
        assert_eq!(strategy.params.chunk_size_bytes, 25 * MB);
        assert_eq!(strategy.params.worker_count, 4);

        // Two chunks only need two workers.
        let small = select_strategy(30 * MB, None, None, Some(StrategyKind::SmartSplit), &config);
        assert_eq!(small.params.worker_count, 2);
    }

    #[test]
    fn test_low_memory_forces_streaming_with_min_chunks() {
        let config = AppConfig::default();
        let signal = MemorySignal {
            available_bytes: 100 * MB,
            total_bytes: 8 * 1024 * MB,
        };
        assert!(signal.is_low(config.strategy.low_memory_fraction));

        // Even a file small enough for direct gets downgraded.
        let strategy = select_strategy(10 * MB, None, Some(signal), None, &config);
        assert_eq!(strategy.kind, StrategyKind::StreamingParallel);
        assert_eq!(
            strategy.params.chunk_size_bytes,
            config.chunking.min_chunk_bytes
        );
    }

    #[test]
    fn test_override_beats_memory_pressure() {
        let config = AppConfig::default();
        let signal = MemorySignal {
            available_bytes: 1,
            total_bytes: 100,
        };
        let strategy = select_strategy(
            10 * MB,
            None,
            Some(signal),
            Some(StrategyKind::Direct),
            &config,
        );
        assert_eq!(strategy.kind, StrategyKind::Direct);
        assert_eq!(strategy.params.worker_count, 1);
    }

    #[test]
    fn test_kind_parse_display_roundtrip() {
        for kind in [
            StrategyKind::Direct,
            StrategyKind::SmartSplit,
            StrategyKind::StreamingParallel,
            StrategyKind::FullStreaming,
        ] {
            assert_eq!(kind.to_string().parse::<StrategyKind>().unwrap(), kind);
        }
        assert!("turbo".parse::<StrategyKind>().is_err());
    }

    #[test]
    fn test_meminfo_parsing() {
        assert_eq!(parse_meminfo_kib("  1024 kB"), Some(1024 * 1024));
        assert_eq!(parse_meminfo_kib("garbage"), None);
    }
}
