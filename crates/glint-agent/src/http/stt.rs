//! Speech-to-text over a HuggingFace-inference-style endpoint.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::json;

use super::retry::{call_with_retry, RetryPolicy};
use super::{env_optional, env_string, map_error_status, map_request_error};
use crate::clients::{SpeechToText, Transcription};
use crate::errors::{Result, StageError};
use glint_core::audio;
use glint_core::CANONICAL_SAMPLE_RATE;

#[derive(Debug, Clone)]
pub struct SttConfig {
    pub endpoint: String,
    pub model: String,
    pub api_token: Option<String>,
    pub language: Option<String>,
}

impl SttConfig {
    pub fn from_env() -> Self {
        Self {
            endpoint: env_string("GLINT_STT_URL", "https://api-inference.huggingface.co"),
            model: env_string("GLINT_STT_MODEL", "distil-whisper/distil-large-v3.5"),
            api_token: env_optional("GLINT_HF_TOKEN"),
            language: Some(env_string("GLINT_STT_LANGUAGE", "en")),
        }
    }
}

pub struct HttpSpeechToText {
    client: reqwest::Client,
    config: SttConfig,
    policy: RetryPolicy,
}

impl HttpSpeechToText {
    pub fn new(config: SttConfig, deadline: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(deadline)
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            config,
            policy: RetryPolicy::with_deadline(deadline),
        }
    }

    fn request_url(&self) -> String {
        format!(
            "{}/models/{}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.model
        )
    }

    fn request_payload(&self, samples: &[f32], sample_rate: u32) -> serde_json::Value {
        let canonical = audio::resample_linear(samples, sample_rate, CANONICAL_SAMPLE_RATE);
        let pcm = audio::to_i16_pcm_bytes(&full_scale(canonical));
        json!({
            "inputs": BASE64.encode(pcm),
            "parameters": {
                "return_timestamps": false,
                "language": self.config.language,
            }
        })
    }
}

/// Bring quiet speech up to full scale before quantisation.
fn full_scale(mut samples: Vec<f32>) -> Vec<f32> {
    let peak = samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
    if peak > 0.0 {
        for s in samples.iter_mut() {
            *s /= peak;
        }
    }
    samples
}

fn parse_transcription_text(value: &serde_json::Value) -> Result<String> {
    value
        .get("text")
        .and_then(|t| t.as_str())
        .map(|t| t.trim().to_string())
        .ok_or_else(|| {
            StageError::UpstreamRejected("transcription response had no `text` field".to_string())
        })
}

#[async_trait]
impl SpeechToText for HttpSpeechToText {
    async fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<Transcription> {
        if samples.is_empty() {
            return Err(StageError::InvalidInput("empty audio buffer".to_string()));
        }
        if sample_rate == 0 {
            return Err(StageError::InvalidInput("zero sample rate".to_string()));
        }
        let started = Instant::now();
        let url = self.request_url();
        let payload = self.request_payload(samples, sample_rate);

        let text = call_with_retry(self.policy, "transcribe", || {
            let payload = payload.clone();
            let url = url.clone();
            async move {
                let mut request = self.client.post(&url).json(&payload);
                if let Some(token) = &self.config.api_token {
                    request = request.bearer_auth(token);
                }
                let response = request.send().await.map_err(map_request_error)?;
                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(map_error_status(status, &body));
                }
                let value: serde_json::Value = response.json().await.map_err(|e| {
                    StageError::UpstreamRejected(format!("malformed transcription response: {e}"))
                })?;
                parse_transcription_text(&value)
            }
        })
        .await?;

        Ok(Transcription {
            text,
            confidence: None,
            processing_ms: started.elapsed().as_millis() as u64,
        })
    }
}
