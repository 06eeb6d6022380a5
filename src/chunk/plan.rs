use std::sync::Arc;

use tracing::{debug, info};

use super::silence::silence_cut_candidates;
use crate::audio::DecodedAudio;
use crate::config::ChunkingConfig;
use crate::strategy::StrategyParams;
use crate::transcribe::ChunkPayload;

/// Final chunks shorter than this are folded into their predecessor.
const MIN_FINAL_CHUNK_SECS: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub start_secs: f64,
    pub end_secs: f64,
}

impl TimeRange {
    pub fn duration(&self) -> f64 {
        self.end_secs - self.start_secs
    }

    pub fn contains(&self, t: f64) -> bool {
        t >= self.start_secs && t < self.end_secs
    }
}

/// Where a chunk sits in the source. Time spans carry both the
/// canonical range (reassembly bookkeeping) and the actual range
/// (what is transcribed, extended by overlap at interior boundaries).
#[derive(Debug, Clone, Copy)]
pub enum ChunkSpan {
    Time {
        canonical: TimeRange,
        actual: TimeRange,
    },
    Bytes {
        start: u64,
        end: u64,
    },
}

#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub index: usize,
    pub span: ChunkSpan,
    pub size_bytes: u64,
}

impl AudioChunk {
    pub fn canonical(&self) -> Option<TimeRange> {
        match self.span {
            ChunkSpan::Time { canonical, .. } => Some(canonical),
            ChunkSpan::Bytes { .. } => None,
        }
    }

    pub fn actual(&self) -> Option<TimeRange> {
        match self.span {
            ChunkSpan::Time { actual, .. } => Some(actual),
            ChunkSpan::Bytes { .. } => None,
        }
    }
}

enum ChunkSource {
    Pcm(Arc<DecodedAudio>),
    Raw(Arc<Vec<u8>>),
}

/// An ordered chunk list plus the shared audio it slices. Payloads are
/// materialized per task attempt rather than held per chunk.
pub struct ChunkPlan {
    pub chunks: Vec<AudioChunk>,
    source: ChunkSource,
    pub precision_loss: bool,
    pub total_duration_secs: Option<f64>,
}

impl ChunkPlan {
    /// Materialize the audio for one chunk's actual range.
    pub fn payload(&self, chunk: &AudioChunk) -> Option<ChunkPayload> {
        match (&self.source, &chunk.span) {
            (ChunkSource::Pcm(audio), ChunkSpan::Time { actual, .. }) => {
                let rate = audio.sample_rate as f64;
                let start = ((actual.start_secs * rate).round() as usize).min(audio.samples.len());
                let end = ((actual.end_secs * rate).round() as usize).clamp(start, audio.samples.len());
                Some(ChunkPayload::Pcm {
                    samples: audio.samples[start..end].to_vec(),
                    sample_rate: audio.sample_rate,
                })
            }
            (ChunkSource::Raw(bytes), ChunkSpan::Bytes { start, end }) => {
                let start = (*start as usize).min(bytes.len());
                let end = (*end as usize).clamp(start, bytes.len());
                Some(ChunkPayload::Raw {
                    bytes: bytes[start..end].to_vec(),
                })
            }
            _ => None,
        }
    }
}

/// Plan time-bounded chunks over decoded audio. Cut points prefer
/// silence midpoints near each target boundary; interior boundaries
/// are extended by half the overlap on each side.
pub fn plan_time_chunks(
    audio: Arc<DecodedAudio>,
    file_size_bytes: u64,
    params: &StrategyParams,
    config: &ChunkingConfig,
) -> ChunkPlan {
    let duration = audio.duration_secs;
    if audio.samples.is_empty() || duration <= 0.0 {
        return ChunkPlan {
            chunks: Vec::new(),
            source: ChunkSource::Pcm(audio),
            precision_loss: false,
            total_duration_secs: Some(0.0),
        };
    }

    let bytes_per_second = file_size_bytes as f64 / duration;
    let target_duration = if bytes_per_second > 0.0 {
        (params.chunk_size_bytes as f64 / bytes_per_second)
            .max(1.0)
            .min(config.max_chunk_duration_secs)
    } else {
        config.max_chunk_duration_secs
    };

    let candidates = if duration < config.silence_analysis_limit_secs {
        silence_cut_candidates(
            &audio.samples,
            audio.sample_rate,
            config.silence_threshold,
            config.min_silence_duration_secs,
        )
    } else {
        debug!(
            "Skipping silence analysis for {:.0}s of audio (limit {:.0}s)",
            duration, config.silence_analysis_limit_secs
        );
        Vec::new()
    };

    let boundaries = cut_boundaries(
        duration,
        target_duration,
        &candidates,
        config.cut_tolerance_fraction,
    );

    let half_overlap = (params.overlap_seconds / 2.0).max(0.0);
    let last = boundaries.len() - 2;
    let mut chunks = Vec::with_capacity(boundaries.len() - 1);
    for i in 0..boundaries.len() - 1 {
        let canonical = TimeRange {
            start_secs: boundaries[i],
            end_secs: boundaries[i + 1],
        };
        // The very first start and very last end are never extended.
        let actual = TimeRange {
            start_secs: if i == 0 {
                canonical.start_secs
            } else {
                (canonical.start_secs - half_overlap).max(0.0)
            },
            end_secs: if i == last {
                canonical.end_secs
            } else {
                (canonical.end_secs + half_overlap).min(duration)
            },
        };
        chunks.push(AudioChunk {
            index: i,
            span: ChunkSpan::Time { canonical, actual },
            size_bytes: (actual.duration() * bytes_per_second).ceil() as u64,
        });
    }

    info!(
        "Planned {} chunks over {:.1}s (target {:.1}s per chunk, {} silence candidates)",
        chunks.len(),
        duration,
        target_duration,
        candidates.len()
    );

    ChunkPlan {
        chunks,
        source: ChunkSource::Pcm(audio),
        precision_loss: false,
        total_duration_secs: Some(duration),
    }
}

/// Choose chunk boundaries: each target cut snaps to the nearest
/// silence candidate within tolerance, else cuts exactly on target.
/// Always returns at least `[0, duration]`.
fn cut_boundaries(
    duration: f64,
    target_duration: f64,
    candidates: &[f64],
    tolerance_fraction: f64,
) -> Vec<f64> {
    let tolerance = target_duration * tolerance_fraction;
    let mut boundaries = vec![0.0];
    let mut cursor = 0.0;

    while cursor + target_duration < duration - MIN_FINAL_CHUNK_SECS {
        let target = cursor + target_duration;
        let chosen = candidates
            .iter()
            .copied()
            .filter(|&c| c > cursor && c < duration - MIN_FINAL_CHUNK_SECS)
            .filter(|&c| (c - target).abs() <= tolerance)
            .min_by(|a, b| (a - target).abs().total_cmp(&(b - target).abs()))
            .unwrap_or(target);
        boundaries.push(chosen);
        cursor = chosen;
    }

    boundaries.push(duration);
    boundaries
}

/// Fixed byte-range fallback for audio that would not decode. Carries
/// no timing information, so the plan is tagged with precision loss.
pub fn plan_byte_chunks(bytes: Arc<Vec<u8>>, chunk_size_bytes: u64) -> ChunkPlan {
    let total = bytes.len() as u64;
    let chunk_size = chunk_size_bytes.max(1);

    let mut chunks = Vec::new();
    let mut start = 0u64;
    while start < total {
        let end = (start + chunk_size).min(total);
        chunks.push(AudioChunk {
            index: chunks.len(),
            span: ChunkSpan::Bytes { start, end },
            size_bytes: end - start,
        });
        start = end;
    }

    info!(
        "Planned {} byte-range chunks over {} bytes (timestamps will be unreliable)",
        chunks.len(),
        total
    );

    ChunkPlan {
        chunks,
        source: ChunkSource::Raw(bytes),
        precision_loss: true,
        total_duration_secs: None,
    }
}

/// One chunk covering the entire file, for direct processing.
pub fn plan_direct(bytes: Arc<Vec<u8>>) -> ChunkPlan {
    let total = bytes.len() as u64;
    ChunkPlan {
        chunks: vec![AudioChunk {
            index: 0,
            span: ChunkSpan::Bytes {
                start: 0,
                end: total,
            },
            size_bytes: total,
        }],
        source: ChunkSource::Raw(bytes),
        precision_loss: false,
        total_duration_secs: None,
    }
}
