//! Text-to-speech over a HuggingFace-inference-style endpoint.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::retry::{call_with_retry, RetryPolicy};
use super::{env_optional, env_string, map_error_status, map_request_error};
use crate::clients::{SpeechSynthesis, SynthesizedSpeech};
use crate::errors::{Result, StageError};
use glint_core::audio;

/// Spoken text longer than this is trimmed to its leading sentences.
const MAX_SPEAK_CHARS: usize = 500;
const OUTPUT_PEAK: f32 = 0.8;

#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub endpoint: String,
    pub model: String,
    pub api_token: Option<String>,
}

impl TtsConfig {
    pub fn from_env() -> Self {
        Self {
            endpoint: env_string("GLINT_TTS_URL", "https://api-inference.huggingface.co"),
            model: env_string("GLINT_TTS_MODEL", "microsoft/speecht5_tts"),
            api_token: env_optional("GLINT_HF_TOKEN"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TtsResponse {
    audio: Vec<f32>,
    sampling_rate: u32,
}

pub struct HttpSpeechSynthesis {
    client: reqwest::Client,
    config: TtsConfig,
    policy: RetryPolicy,
}

impl HttpSpeechSynthesis {
    pub fn new(config: TtsConfig, deadline: Duration) -> Self {
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

    fn request_payload(&self, text: &str, voice_preset: &str) -> serde_json::Value {
        let mut parameters = json!({"vocoder": "hifigan"});
        if voice_preset != "default" {
            parameters["speaker_id"] = json!(voice_preset);
        }
        json!({"inputs": text, "parameters": parameters})
    }
}

/// Clean text for synthesis: spell out symbols the voice stumbles over and
/// cap the length to the leading sentences.
fn prepare_text(text: &str) -> String {
    let mut prepared = text.trim().to_string();
    for (from, to) in [
        ("&", " and "),
        ("@", " at "),
        ("#", " hashtag "),
        ("$", " dollar "),
        ("%", " percent "),
        ("...", ". "),
    ] {
        prepared = prepared.replace(from, to);
    }
    if prepared.len() > MAX_SPEAK_CHARS {
        let sentences: Vec<&str> = prepared
            .split_inclusive(". ")
            .take(3)
            .collect();
        prepared = sentences.concat().trim().to_string();
        if !prepared.ends_with('.') {
            prepared.push('.');
        }
    }
    prepared
}

#[async_trait]
impl SpeechSynthesis for HttpSpeechSynthesis {
    async fn synthesize(&self, text: &str, voice_preset: &str) -> Result<SynthesizedSpeech> {
        let prepared = prepare_text(text);
        if prepared.is_empty() {
            return Err(StageError::InvalidInput(
                "nothing to synthesize".to_string(),
            ));
        }
        let started = Instant::now();
        let url = self.request_url();
        let payload = self.request_payload(&prepared, voice_preset);

        let response = call_with_retry(self.policy, "synthesize", || {
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
                response.json::<TtsResponse>().await.map_err(|e| {
                    StageError::UpstreamRejected(format!("malformed synthesis response: {e}"))
                })
            }
        })
        .await?;

        if response.audio.is_empty() || response.sampling_rate == 0 {
            return Err(StageError::UpstreamRejected(
                "synthesis returned no audio".to_string(),
            ));
        }

        let mut samples = response.audio;
        audio::peak_normalize(&mut samples, OUTPUT_PEAK);
        let duration_s = audio::duration_s(samples.len(), response.sampling_rate) as f64;
        Ok(SynthesizedSpeech {
            samples,
            sample_rate: response.sampling_rate,
            duration_s,
            processing_ms: started.elapsed().as_millis() as u64,
        })
    }
}
