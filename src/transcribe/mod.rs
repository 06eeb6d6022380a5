mod http;

pub use http::HttpEngine;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("transcription request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("transcription API returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("could not parse transcription response: {0}")]
    Decode(String),
}

/// Audio handed to the engine for one task. Either decoded PCM cut at
/// sample precision, or a raw byte slice of the source container.
#[derive(Debug, Clone)]
pub enum ChunkPayload {
    Pcm { samples: Vec<f32>, sample_rate: u32 },
    Raw { bytes: Vec<u8> },
}

impl ChunkPayload {
    pub fn size_bytes(&self) -> u64 {
        match self {
            ChunkPayload::Pcm { samples, .. } => (samples.len() * 4) as u64,
            ChunkPayload::Raw { bytes } => bytes.len() as u64,
        }
    }

    /// Content hash used as the cache key for this audio.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        match self {
            ChunkPayload::Pcm {
                samples,
                sample_rate,
            } => {
                hasher.update(b"pcm");
                hasher.update(sample_rate.to_le_bytes());
                for sample in samples {
                    hasher.update(sample.to_le_bytes());
                }
            }
            ChunkPayload::Raw { bytes } => {
                hasher.update(b"raw");
                hasher.update(bytes);
            }
        }
        format!("{:x}", hasher.finalize())
    }

    /// Encode as a WAV file for transport. Raw payloads are assumed to
    /// already carry their container format.
    pub fn to_wav_bytes(&self) -> Vec<u8> {
        match self {
            ChunkPayload::Pcm {
                samples,
                sample_rate,
            } => crate::audio::samples_to_wav_bytes(samples, *sample_rate),
            ChunkPayload::Raw { bytes } => bytes.clone(),
        }
    }
}

/// Optional knobs forwarded with every engine request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscriptionHints {
    pub language: Option<String>,
    pub prompt: Option<String>,
    pub temperature: Option<f32>,
}

/// One timed segment of transcribed speech, relative to the start of
/// the audio the engine was given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscribedSegment {
    pub start_secs: f32,
    pub end_secs: f32,
    pub text: String,
}

/// What the engine produced for one chunk of audio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineOutput {
    pub text: String,
    pub segments: Vec<TranscribedSegment>,
    pub language: Option<String>,
}

#[async_trait]
pub trait TranscriptionEngine: Send + Sync {
    /// Transcribe one chunk of audio, already encoded for transport
    /// (WAV for decoded chunks, the source container for byte splits).
    async fn transcribe(
        &self,
        audio: &[u8],
        hints: &TranscriptionHints,
    ) -> Result<EngineOutput, EngineError>;

    /// Identifier composed into result cache keys, so output from one
    /// model is never served for another.
    fn model_id(&self) -> &str;
}
