mod fingerprint;
mod store;

pub use fingerprint::fingerprint;
pub use store::{AutosaveHandle, CheckpointStore, SESSION_NAMESPACE, spawn_autosave};

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transcribe::EngineOutput;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("invalid session transition from {from} to {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },
    #[error("storage error: {0}")]
    Storage(#[from] crate::db::KvError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initialized,
    Processing,
    Paused,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }

    /// The session state machine. Terminal states admit no
    /// transitions; completion only happens out of `Processing`.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Initialized, Processing)
                | (Processing, Paused)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Paused, Processing)
                | (Paused, Failed)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStatus::Initialized => "initialized",
            SessionStatus::Processing => "processing",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionProgress {
    pub overall_percent: f64,
    pub completed_chunks: Vec<usize>,
    pub failed_chunks: Vec<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub total_chunks: usize,
    pub total_duration_secs: Option<f64>,
    pub strategy: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub paused_time: Option<DateTime<Utc>>,
}

/// One chunk's transcription, persisted as soon as it completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkResult {
    pub chunk_index: usize,
    pub output: EngineOutput,
}

/// Persisted processing state for one file, keyed by fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingSession {
    pub id: String,
    pub file_fingerprint: String,
    pub file_name: String,
    pub file_size: u64,
    pub status: SessionStatus,
    pub progress: SessionProgress,
    pub metadata: SessionMetadata,
    pub results: Vec<ChunkResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessingSession {
    pub fn new(id: String, file_fingerprint: String, file_name: String, file_size: u64) -> Self {
        let now = Utc::now();
        Self {
            id,
            file_fingerprint,
            file_name,
            file_size,
            status: SessionStatus::Initialized,
            progress: SessionProgress::default(),
            metadata: SessionMetadata::default(),
            results: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, stamping the relevant metadata timestamps.
    pub fn transition_to(&mut self, next: SessionStatus) -> Result<(), CheckpointError> {
        if !self.status.can_transition_to(next) {
            return Err(CheckpointError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        match next {
            SessionStatus::Processing => {
                if self.metadata.start_time.is_none() {
                    self.metadata.start_time = Some(now);
                }
            }
            SessionStatus::Paused => self.metadata.paused_time = Some(now),
            SessionStatus::Completed | SessionStatus::Failed => {
                self.metadata.end_time = Some(now)
            }
            SessionStatus::Initialized => {}
        }

        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn is_chunk_completed(&self, chunk_index: usize) -> bool {
        self.progress.completed_chunks.contains(&chunk_index)
    }

    /// Record a completed chunk and its output. Idempotent per index.
    pub fn mark_chunk_completed(&mut self, chunk_index: usize, output: EngineOutput) {
        if !self.progress.completed_chunks.contains(&chunk_index) {
            self.progress.completed_chunks.push(chunk_index);
        }
        self.progress.failed_chunks.retain(|&i| i != chunk_index);
        if !self.results.iter().any(|r| r.chunk_index == chunk_index) {
            self.results.push(ChunkResult {
                chunk_index,
                output,
            });
        }
        self.updated_at = Utc::now();
    }

    pub fn mark_chunk_failed(&mut self, chunk_index: usize) {
        if !self.progress.failed_chunks.contains(&chunk_index)
            && !self.progress.completed_chunks.contains(&chunk_index)
        {
            self.progress.failed_chunks.push(chunk_index);
        }
        self.updated_at = Utc::now();
    }

    pub fn set_overall_percent(&mut self, percent: f64) {
        self.progress.overall_percent = percent.clamp(0.0, 100.0);
        self.updated_at = Utc::now();
    }
}
