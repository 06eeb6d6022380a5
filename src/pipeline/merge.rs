use serde::Serialize;

use crate::chunk::{AudioChunk, ChunkPlan};
use crate::transcribe::{EngineOutput, TranscribedSegment};

/// Overlap trimming at chunk seams only considers matches at least this
/// many characters long; shorter coincidences are left alone.
const MIN_SEAM_OVERLAP_CHARS: usize = 4;

/// How far back into the previous chunk's text the seam scan looks.
const SEAM_SCAN_CHARS: usize = 256;

/// The reassembled transcript of a whole file, in source order with
/// absolute timestamps.
#[derive(Debug, Clone, Serialize)]
pub struct MergedTranscript {
    pub text: String,
    pub segments: Vec<TranscribedSegment>,
    pub language: Option<String>,
    pub duration_secs: Option<f64>,
}

/// Stitch per-chunk engine outputs back into one transcript.
///
/// Chunks are visited in index order. Time chunks are transcribed with
/// overlap at interior boundaries, so a segment can be reported by two
/// neighbours; each segment is attributed to the chunk whose canonical
/// range contains its absolute midpoint, and dropped from the other.
/// When the owning chunk produced no output, the neighbour's copy is
/// kept so the speech is not lost with it. Whatever duplicate wording
/// survives range attribution is trimmed textually at the seam.
pub fn merge_outputs(plan: &ChunkPlan, outputs: &[Option<EngineOutput>]) -> MergedTranscript {
    let last = plan.chunks.len().saturating_sub(1);
    let mut text = String::new();
    let mut segments: Vec<TranscribedSegment> = Vec::new();
    let mut language: Option<String> = None;

    for (index, chunk) in plan.chunks.iter().enumerate() {
        let Some(output) = outputs.get(index).and_then(|slot| slot.as_ref()) else {
            continue;
        };
        if language.is_none() {
            language = output.language.clone();
        }

        let kept = attribute_segments(index, last, chunk, output, outputs);
        let block = if kept.is_empty() && output.segments.is_empty() {
            // No segment structure at all; fall back to the flat text.
            output.text.trim().to_string()
        } else {
            kept.iter()
                .map(|seg| seg.text.trim())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        };

        segments.extend(kept);
        append_block(&mut text, &block);
    }

    clamp_monotonic(&mut segments);

    // Direct plans carry no duration of their own; the transcript end
    // stands in. Byte-split plans stay unset, their timestamps are
    // chunk-relative.
    let duration_secs = plan.total_duration_secs.or_else(|| {
        if plan.precision_loss {
            None
        } else {
            segments.last().map(|seg| seg.end_secs as f64)
        }
    });

    MergedTranscript {
        text,
        segments,
        language,
        duration_secs,
    }
}

/// Shift one chunk's segments to absolute time and keep those this
/// chunk owns. Byte-range chunks carry no time information and are
/// kept verbatim.
fn attribute_segments(
    index: usize,
    last: usize,
    chunk: &AudioChunk,
    output: &EngineOutput,
    outputs: &[Option<EngineOutput>],
) -> Vec<TranscribedSegment> {
    let (Some(actual), Some(canonical)) = (chunk.actual(), chunk.canonical()) else {
        return output.segments.clone();
    };

    let anchor = actual.start_secs;
    let mut kept = Vec::with_capacity(output.segments.len());
    for seg in &output.segments {
        let start = anchor + seg.start_secs as f64;
        let end = anchor + seg.end_secs as f64;
        let midpoint = (start + end) / 2.0;

        // The final chunk's canonical range is closed on the right so a
        // segment ending exactly at the file boundary is not orphaned.
        let owner = if canonical.contains(midpoint) {
            Some(index)
        } else if midpoint < canonical.start_secs {
            index.checked_sub(1)
        } else if index != last {
            Some(index + 1)
        } else {
            Some(index)
        };

        let keep = match owner {
            Some(owner) if owner == index => true,
            // A neighbour owns it; keep it anyway if the neighbour has
            // nothing, so its audio is not silently dropped.
            Some(owner) => outputs.get(owner).is_none_or(|slot| slot.is_none()),
            None => true,
        };
        if keep {
            kept.push(TranscribedSegment {
                start_secs: start as f32,
                end_secs: end as f32,
                text: seg.text.clone(),
            });
        }
    }
    kept
}

/// Append a chunk's text, trimming wording already present at the tail
/// of what came before and guarding the single-space separator.
fn append_block(text: &mut String, block: &str) {
    let block = block.trim();
    if block.is_empty() {
        return;
    }
    if text.is_empty() {
        text.push_str(block);
        return;
    }

    let overlap = seam_overlap_chars(text, block);
    let rest: String = block.chars().skip(overlap).collect();
    let rest = rest.trim_start();
    if rest.is_empty() {
        return;
    }
    text.push(' ');
    text.push_str(rest);
}

/// Length in chars of the longest suffix of `previous` that is also a
/// prefix of `current`, within the scan window. Zero when the longest
/// match is shorter than the minimum.
fn seam_overlap_chars(previous: &str, current: &str) -> usize {
    let prev: Vec<char> = previous.chars().collect();
    let cur: Vec<char> = current.chars().collect();
    let tail = &prev[prev.len().saturating_sub(SEAM_SCAN_CHARS)..];
    let head = &cur[..cur.len().min(SEAM_SCAN_CHARS)];

    let longest = tail.len().min(head.len());
    for len in (MIN_SEAM_OVERLAP_CHARS..=longest).rev() {
        if tail[tail.len() - len..] == head[..len] {
            return len;
        }
    }
    0
}

/// Engines occasionally report segments that step backwards across a
/// seam; clamp starts to be non-decreasing and ends to follow starts.
fn clamp_monotonic(segments: &mut [TranscribedSegment]) {
    let mut last_start = 0.0f32;
    for seg in segments.iter_mut() {
        if seg.start_secs < last_start {
            seg.start_secs = last_start;
        }
        if seg.end_secs < seg.start_secs {
            seg.end_secs = seg.start_secs;
        }
        last_start = seg.start_secs;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::chunk::{plan_byte_chunks, plan_direct, plan_time_chunks};
    use crate::config::ChunkingConfig;
    use crate::strategy::StrategyParams;
    use crate::audio::DecodedAudio;

    /// 100 seconds of non-silent audio that splits into four 25-second
    /// canonical chunks, with interior boundaries extended by 1s of
    /// half-overlap on each side (actual ranges anchored at 0/24/49/74).
    fn four_chunk_plan() -> ChunkPlan {
        let audio = DecodedAudio::new(vec![0.5; 1000], 10);
        let params = StrategyParams {
            chunk_size_bytes: 250,
            overlap_seconds: 2.0,
            worker_count: 2,
        };
        plan_time_chunks(Arc::new(audio), 1000, &params, &ChunkingConfig::default())
    }

    fn output(segments: Vec<(f32, f32, &str)>) -> EngineOutput {
        let segments: Vec<TranscribedSegment> = segments
            .into_iter()
            .map(|(start_secs, end_secs, text)| TranscribedSegment {
                start_secs,
                end_secs,
                text: text.to_string(),
            })
            .collect();
        let text = segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        EngineOutput {
            text,
            segments,
            language: Some("en".to_string()),
        }
    }

    #[test]
    fn test_segments_shift_to_absolute_time_in_chunk_order() {
        let plan = four_chunk_plan();
        assert_eq!(plan.chunks.len(), 4);

        let outputs: Vec<Option<EngineOutput>> = (0..4)
            .map(|i| Some(output(vec![(3.0, 4.0, ["a", "b", "c", "d"][i])])))
            .collect();

        let merged = merge_outputs(&plan, &outputs);
        assert_eq!(merged.text, "a b c d");
        assert_eq!(merged.segments.len(), 4);
        let starts: Vec<f32> = merged.segments.iter().map(|s| s.start_secs).collect();
        assert_eq!(starts, vec![3.0, 27.0, 52.0, 77.0]);
        assert_eq!(merged.language.as_deref(), Some("en"));
        assert_eq!(merged.duration_secs, Some(100.0));
    }

    #[test]
    fn test_overlap_segment_attributed_to_owning_chunk_only() {
        let plan = four_chunk_plan();

        // Both neighbours of the 25s boundary report the same speech:
        // chunk 0 at 24.5..25.5 absolute, chunk 1 likewise.
        let mut outputs = vec![None, None, None, None];
        outputs[0] = Some(output(vec![(1.0, 2.0, "alpha"), (24.5, 25.5, "hello")]));
        outputs[1] = Some(output(vec![(0.5, 1.5, "hello"), (4.0, 5.0, "beta")]));

        let merged = merge_outputs(&plan, &outputs);
        assert_eq!(merged.text, "alpha hello beta");
        let hellos = merged.segments.iter().filter(|s| s.text == "hello").count();
        assert_eq!(hellos, 1);
        // The kept copy is chunk 1's, anchored at its actual start of 24s.
        assert_eq!(merged.segments[1].start_secs, 24.5);
    }

    #[test]
    fn test_neighbour_copy_salvaged_when_owner_produced_nothing() {
        let plan = four_chunk_plan();

        let mut outputs = vec![None, None, None, None];
        outputs[0] = Some(output(vec![(1.0, 2.0, "alpha"), (24.5, 25.5, "hello")]));

        let merged = merge_outputs(&plan, &outputs);
        assert_eq!(merged.text, "alpha hello");
        assert_eq!(merged.segments.len(), 2);
    }

    #[test]
    fn test_failed_chunk_skipped_without_disturbing_order() {
        let plan = four_chunk_plan();

        let mut outputs: Vec<Option<EngineOutput>> = (0..4)
            .map(|i| Some(output(vec![(3.0, 4.0, ["a", "b", "c", "d"][i])])))
            .collect();
        outputs[1] = None;

        let merged = merge_outputs(&plan, &outputs);
        assert_eq!(merged.text, "a c d");
        let starts: Vec<f32> = merged.segments.iter().map(|s| s.start_secs).collect();
        assert_eq!(starts, vec![3.0, 52.0, 77.0]);
    }

    #[test]
    fn test_seam_text_dedup_trims_repeated_wording() {
        let plan = four_chunk_plan();

        let mut outputs = vec![None, None, None, None];
        outputs[0] = Some(output(vec![(22.0, 24.0, "the quick brown fox")]));
        outputs[1] = Some(output(vec![(2.0, 4.0, "brown fox jumps over")]));

        let merged = merge_outputs(&plan, &outputs);
        assert_eq!(merged.text, "the quick brown fox jumps over");
    }

    #[test]
    fn test_seam_matches_below_minimum_are_kept() {
        assert_eq!(seam_overlap_chars("end a", "a new"), 0);
        assert_eq!(seam_overlap_chars("wholly unrelated", "text follows"), 0);
        assert_eq!(seam_overlap_chars("say hello", "hello there"), 5);
    }

    #[test]
    fn test_byte_chunks_join_in_order_and_clamp_timestamps() {
        let bytes = Arc::new(vec![7u8; 100]);
        let plan = plan_byte_chunks(bytes, 50);
        assert_eq!(plan.chunks.len(), 2);

        let outputs = vec![
            Some(output(vec![(2.0, 6.0, "first part")])),
            Some(output(vec![(1.0, 3.0, "second part")])),
        ];

        let merged = merge_outputs(&plan, &outputs);
        assert_eq!(merged.text, "first part second part");
        // Chunk-relative times from the second chunk step backwards and
        // get clamped forward.
        assert_eq!(merged.segments[1].start_secs, 2.0);
        assert_eq!(merged.segments[1].end_secs, 3.0);
        assert!(merged.duration_secs.is_none());
    }

    #[test]
    fn test_direct_plan_takes_duration_from_last_segment() {
        let plan = plan_direct(Arc::new(vec![7u8; 10]));
        let outputs = vec![Some(output(vec![
            (0.0, 2.5, "hello there"),
            (2.5, 4.0, "general"),
        ]))];

        let merged = merge_outputs(&plan, &outputs);
        assert_eq!(merged.duration_secs, Some(4.0));
    }

    #[test]
    fn test_flat_text_used_when_engine_reports_no_segments() {
        let bytes = Arc::new(vec![7u8; 10]);
        let plan = plan_byte_chunks(bytes, 100);

        let outputs = vec![Some(EngineOutput {
            text: "  raw words  ".to_string(),
            segments: Vec::new(),
            language: None,
        })];

        let merged = merge_outputs(&plan, &outputs);
        assert_eq!(merged.text, "raw words");
        assert!(merged.segments.is_empty());
    }

    #[test]
    fn test_all_chunks_failed_yields_empty_transcript() {
        let plan = four_chunk_plan();
        let merged = merge_outputs(&plan, &[None, None, None, None]);
        assert!(merged.text.is_empty());
        assert!(merged.segments.is_empty());
        assert!(merged.language.is_none());
    }
}
