use std::io::Cursor;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("wav parse error: {0}")]
    Wav(#[from] hound::Error),
    #[error("unsupported audio format: {0}")]
    Unsupported(String),
    #[error("audio stream contains no samples")]
    Empty,
}

/// Decoded PCM audio, downmixed to a single channel and normalized
/// to [-1.0, 1.0].
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub duration_secs: f64,
}

impl DecodedAudio {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        let duration_secs = samples.len() as f64 / sample_rate as f64;
        Self {
            samples,
            sample_rate,
            duration_secs,
        }
    }
}

/// The opaque decode primitive: container bytes in, mono PCM out.
pub trait AudioDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<DecodedAudio, DecodeError>;
}

/// WAV decoder backing the decode primitive.
pub struct WavDecoder;

impl AudioDecoder for WavDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<DecodedAudio, DecodeError> {
        let mut reader = hound::WavReader::new(Cursor::new(bytes))?;
        let spec = reader.spec();

        let interleaved: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
            (hound::SampleFormat::Float, 32) => {
                reader.samples::<f32>().collect::<Result<_, _>>()?
            }
            (hound::SampleFormat::Int, 16) => reader
                .samples::<i16>()
                .map(|s| s.map(|v| v as f32 / 32768.0))
                .collect::<Result<_, _>>()?,
            (hound::SampleFormat::Int, bits @ (24 | 32)) => {
                let scale = (1i64 << (bits - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<_, _>>()?
            }
            (format, bits) => {
                return Err(DecodeError::Unsupported(format!(
                    "{:?} at {} bits per sample",
                    format, bits
                )))
            }
        };

        if interleaved.is_empty() {
            return Err(DecodeError::Empty);
        }

        let samples = downmix_to_mono(&interleaved, spec.channels as usize);

        debug!(
            "Decoded {} samples at {}Hz from {} channel(s)",
            samples.len(),
            spec.sample_rate,
            spec.channels
        );

        Ok(DecodedAudio::new(samples, spec.sample_rate))
    }
}

/// Average interleaved channels down to one.
fn downmix_to_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }

    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}
