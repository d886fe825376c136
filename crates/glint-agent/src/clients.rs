//! Typed client traits for the external inference backends.
//!
//! The coordinator only ever sees these traits; concrete HTTP adapters live in
//! [`crate::http`] and tests substitute fakes. Adapters are stateless values,
//! constructed once at startup and shared across connections.

use async_trait::async_trait;

use crate::errors::Result;
use crate::memory::{ConversationTurn, MemorySnapshot};

/// Result of one transcription call.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcription {
    pub text: String,
    pub confidence: Option<f32>,
    pub processing_ms: u64,
}

/// One language-model invocation: the user's words, the bounded conversation
/// state, and optionally the screen the user is looking at.
#[derive(Debug, Clone)]
pub struct RespondRequest {
    pub user_text: String,
    pub memory: MemorySnapshot,
    /// Base64 JPEG (optionally a data URI), as delivered by the client.
    pub screen_image: Option<String>,
    /// Stable per-connection identifier, forwarded for backend-side affinity.
    pub session_hint: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmReply {
    pub text: String,
    /// The model signalled that it needs a current screen image to answer.
    pub needs_screen: bool,
    /// Short description of the screen, present when an image was attached.
    pub screen_summary: Option<String>,
    pub processing_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedSpeech {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub duration_s: f64,
    pub processing_ms: u64,
}

#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<Transcription>;
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn respond(&self, request: RespondRequest) -> Result<LlmReply>;

    /// Fold the given turns into a rolling summary. Shares the deadline and
    /// retry policy of [`respond`](Self::respond).
    async fn summarize(
        &self,
        turns: &[ConversationTurn],
        existing_summary: Option<&str>,
    ) -> Result<String>;
}

#[async_trait]
pub trait SpeechSynthesis: Send + Sync {
    async fn synthesize(&self, text: &str, voice_preset: &str) -> Result<SynthesizedSpeech>;
}
