//! Conversational language model over a Gemini-style `generateContent` API.
//!
//! Two extra responsibilities beyond plain text generation: rendering the
//! bounded memory snapshot into the request, and the screen-capture sentinel.
//! The model is instructed to open its reply with `[[SCREEN_CAPTURE]]` when it
//! genuinely needs to see the user's screen; the adapter strips the token and
//! surfaces the request as a typed flag.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::json;
use tracing::warn;

use super::retry::{call_with_retry, RetryPolicy};
use super::{env_optional, env_string, map_error_status, map_request_error, strip_data_uri};
use crate::clients::{LanguageModel, LlmReply, RespondRequest};
use crate::errors::{Result, StageError};
use crate::memory::ConversationTurn;

pub const SCREEN_SENTINEL: &str = "[[SCREEN_CAPTURE]]";

const SYSTEM_PROMPT: &str = "You are a helpful voice assistant with conversation memory and, when \
the user shares it, access to their screen. Reply with concise spoken-friendly language and no \
markdown. Reference earlier parts of the conversation when relevant. If answering genuinely \
requires seeing the user's current screen and no screen image is attached, start your reply with \
the exact token [[SCREEN_CAPTURE]] followed by your best answer without it.";

const SCREEN_ANALYSIS_PROMPT: &str = "Analyze this screen image and provide a concise description \
of what you see. Focus on the main UI elements and text, the application in use, and any error \
messages or important status indicators. Two or three sentences.";

const SUMMARY_PROMPT: &str = "Progressively summarize the conversation turns below, folding them \
into the existing summary. Keep facts the assistant may need later (names, decisions, open \
questions) and stay under 150 words. Reply with the new summary only.";

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub system_prompt: String,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self {
            endpoint: env_string(
                "GLINT_LLM_URL",
                "https://generativelanguage.googleapis.com/v1beta",
            ),
            model: env_string("GLINT_LLM_MODEL", "gemini-1.5-flash"),
            api_key: env_optional("GLINT_GEMINI_API_KEY"),
            system_prompt: env_string("GLINT_SYSTEM_PROMPT", SYSTEM_PROMPT),
        }
    }
}

pub struct HttpLanguageModel {
    client: reqwest::Client,
    config: LlmConfig,
    policy: RetryPolicy,
}

impl HttpLanguageModel {
    pub fn new(config: LlmConfig, deadline: Duration) -> Self {
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
            "{}/models/{}:generateContent",
            self.config.endpoint.trim_end_matches('/'),
            self.config.model
        )
    }

    async fn generate(&self, body: serde_json::Value) -> Result<String> {
        let url = self.request_url();
        call_with_retry(self.policy, "generate", || {
            let body = body.clone();
            let url = url.clone();
            async move {
                let mut request = self.client.post(&url).json(&body);
                if let Some(key) = &self.config.api_key {
                    request = request.query(&[("key", key)]);
                }
                let response = request.send().await.map_err(map_request_error)?;
                let status = response.status();
                if !status.is_success() {
                    let text = response.text().await.unwrap_or_default();
                    return Err(map_error_status(status, &text));
                }
                let value: serde_json::Value = response.json().await.map_err(|e| {
                    StageError::UpstreamRejected(format!("malformed model response: {e}"))
                })?;
                parse_candidate_text(&value)
            }
        })
        .await
    }

    /// Describe an attached screen image. Failures degrade to "no summary"
    /// rather than failing the whole turn.
    async fn analyze_screen(&self, image_b64: &str) -> Option<String> {
        let body = json!({
            "contents": [{
                "role": "user",
                "parts": [
                    {"text": SCREEN_ANALYSIS_PROMPT},
                    {"inline_data": {"mime_type": "image/jpeg", "data": image_b64}},
                ],
            }],
        });
        match self.generate(body).await {
            Ok(summary) => Some(summary),
            Err(err) => {
                warn!(error = %err, "screen analysis failed, continuing without summary");
                None
            }
        }
    }
}

fn decode_image(image: &str) -> Result<String> {
    let body = strip_data_uri(image);
    BASE64
        .decode(body)
        .map_err(|_| StageError::InvalidInput("screen image is not valid base64".to_string()))?;
    Ok(body.to_string())
}

/// Render the snapshot and the current user text into `generateContent`
/// messages. The rolling summary rides as a leading exchange so the model
/// treats it as established context.
fn build_contents(
    request: &RespondRequest,
    image_b64: Option<&str>,
    screen_analysis: Option<&str>,
) -> serde_json::Value {
    let mut contents = Vec::new();
    if let Some(summary) = request
        .memory
        .summary
        .as_deref()
        .filter(|s| !s.is_empty())
    {
        contents.push(json!({
            "role": "user",
            "parts": [{"text": format!("Summary of our conversation so far: {summary}")}],
        }));
        contents.push(json!({
            "role": "model",
            "parts": [{"text": "Understood."}],
        }));
    }
    for turn in &request.memory.turns {
        contents.push(json!({
            "role": "user",
            "parts": [{"text": turn.user_text}],
        }));
        contents.push(json!({
            "role": "model",
            "parts": [{"text": turn.assistant_text}],
        }));
    }

    let mut user_text = request.user_text.clone();
    if let Some(analysis) = screen_analysis {
        user_text = format!("{user_text}\n\nScreen context: {analysis}");
    }
    let mut parts = vec![json!({"text": user_text})];
    if let Some(data) = image_b64 {
        parts.push(json!({"inline_data": {"mime_type": "image/jpeg", "data": data}}));
    }
    contents.push(json!({"role": "user", "parts": parts}));
    json!(contents)
}

fn parse_candidate_text(value: &serde_json::Value) -> Result<String> {
    let parts = value
        .pointer("/candidates/0/content/parts")
        .and_then(|p| p.as_array())
        .ok_or_else(|| {
            StageError::UpstreamRejected("model response had no candidates".to_string())
        })?;
    let text = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect::<Vec<_>>()
        .join("");
    Ok(text.trim().to_string())
}

/// Split a leading screen-capture sentinel off the reply text.
fn split_sentinel(text: &str) -> (bool, String) {
    let trimmed = text.trim();
    match trimmed.strip_prefix(SCREEN_SENTINEL) {
        Some(rest) => (true, rest.trim().to_string()),
        None => (false, trimmed.to_string()),
    }
}

fn render_turns(turns: &[ConversationTurn]) -> String {
    let mut rendered = String::new();
    for turn in turns {
        rendered.push_str("User: ");
        rendered.push_str(&turn.user_text);
        rendered.push('\n');
        rendered.push_str("Assistant: ");
        rendered.push_str(&turn.assistant_text);
        rendered.push('\n');
        if let Some(screen) = &turn.screen_summary {
            rendered.push_str("(Screen at the time: ");
            rendered.push_str(screen);
            rendered.push_str(")\n");
        }
    }
    rendered
}

#[async_trait]
impl LanguageModel for HttpLanguageModel {
    async fn respond(&self, request: RespondRequest) -> Result<LlmReply> {
        if request.user_text.trim().is_empty() {
            return Err(StageError::InvalidInput("empty user text".to_string()));
        }
        let started = Instant::now();

        let image_b64 = match &request.screen_image {
            Some(image) => Some(decode_image(image)?),
            None => None,
        };
        let screen_summary = match &image_b64 {
            Some(data) => self.analyze_screen(data).await,
            None => None,
        };

        let body = json!({
            "system_instruction": {"parts": [{"text": self.config.system_prompt}]},
            "contents": build_contents(&request, image_b64.as_deref(), screen_summary.as_deref()),
        });
        let raw = self.generate(body).await?;
        let (needs_screen, text) = split_sentinel(&raw);

        Ok(LlmReply {
            text,
            // A request for a screen the model already has is meaningless;
            // the attached image wins.
            needs_screen: needs_screen && image_b64.is_none(),
            screen_summary,
            processing_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn summarize(
        &self,
        turns: &[ConversationTurn],
        existing_summary: Option<&str>,
    ) -> Result<String> {
        if turns.is_empty() {
            return Ok(existing_summary.unwrap_or_default().to_string());
        }
        let mut prompt = String::from(SUMMARY_PROMPT);
        prompt.push_str("\n\nExisting summary: ");
        prompt.push_str(existing_summary.unwrap_or("(none)"));
        prompt.push_str("\n\nTurns to fold in:\n");
        prompt.push_str(&render_turns(turns));

        let body = json!({
            "contents": [{"role": "user", "parts": [{"text": prompt}]}],
        });
        self.generate(body).await
    }
}
