use std::time::Duration;

use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::debug;

use super::{EngineError, EngineOutput, TranscribedSegment, TranscriptionEngine};
use crate::config::EngineConfig;

/// Transcription engine that ships each chunk to an OpenAI-style
/// `audio/transcriptions` endpoint as a multipart upload.
pub struct HttpEngine {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpEngine {
    pub fn new(config: &EngineConfig, api_key: Option<String>) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key,
        })
    }
}

#[async_trait::async_trait]
impl TranscriptionEngine for HttpEngine {
    async fn transcribe(
        &self,
        audio: &[u8],
        hints: &super::TranscriptionHints,
    ) -> Result<EngineOutput, EngineError> {
        debug!(
            "Uploading {} byte chunk to {} (model {})",
            audio.len(),
            self.endpoint,
            self.model
        );

        let part = Part::bytes(audio.to_vec())
            .file_name("chunk.wav")
            .mime_str("audio/wav")?;

        let mut form = Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("response_format", "verbose_json");
        if let Some(language) = &hints.language {
            form = form.text("language", language.clone());
        }
        if let Some(prompt) = &hints.prompt {
            form = form.text("prompt", prompt.clone());
        }
        if let Some(temperature) = hints.temperature {
            form = form.text("temperature", temperature.to_string());
        }

        let mut request = self.client.post(&self.endpoint).multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message: String = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(300)
                .collect();
            return Err(EngineError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.text().await?;
        parse_response(&body)
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

#[derive(Deserialize)]
struct ApiResponse {
    text: String,
    #[serde(default)]
    segments: Vec<ApiSegment>,
    language: Option<String>,
}

#[derive(Deserialize)]
struct ApiSegment {
    start: f32,
    end: f32,
    text: String,
}

fn parse_response(body: &str) -> Result<EngineOutput, EngineError> {
    let parsed: ApiResponse =
        serde_json::from_str(body).map_err(|e| EngineError::Decode(e.to_string()))?;

    let segments = parsed
        .segments
        .into_iter()
        .map(|s| TranscribedSegment {
            start_secs: s.start,
            end_secs: s.end,
            text: s.text.trim().to_string(),
        })
        .collect();

    Ok(EngineOutput {
        text: parsed.text.trim().to_string(),
        segments,
        language: parsed.language,
    })
}
