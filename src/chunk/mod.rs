mod plan;
mod silence;

pub use plan::{
    AudioChunk, ChunkPlan, ChunkSpan, TimeRange, plan_byte_chunks, plan_direct, plan_time_chunks,
};
pub use silence::{SILENCE_WINDOW_SECS, find_silence_runs, is_silence_window, silence_cut_candidates};
