//! HTTP adapters for the external inference backends.
//!
//! Each adapter is a stateless value over a pooled [`reqwest::Client`],
//! enforcing the per-call deadline and bounded retry of [`retry`]. Adapter
//! construction reads `GLINT_*` environment variables so the server binary
//! can assemble the whole stack in `main` and hand it down explicitly.

pub mod llm;
pub mod retry;
pub mod stt;
pub mod tts;

pub use llm::{HttpLanguageModel, LlmConfig};
pub use retry::{call_with_retry, RetryPolicy};
pub use stt::{HttpSpeechToText, SttConfig};
pub use tts::{HttpSpeechSynthesis, TtsConfig};

use crate::errors::StageError;

pub(crate) fn map_request_error(err: reqwest::Error) -> StageError {
    if err.is_timeout() {
        StageError::Timeout
    } else {
        StageError::UpstreamUnavailable(err.to_string())
    }
}

/// Map a non-success HTTP status onto the failure taxonomy: server-side
/// trouble (model loading, overload) is transient, everything else is a hard
/// refusal.
pub(crate) fn map_error_status(status: reqwest::StatusCode, body: &str) -> StageError {
    let detail = format!("{status}: {}", body.trim());
    if status.is_server_error() || status.as_u16() == 429 {
        StageError::UpstreamUnavailable(detail)
    } else {
        StageError::UpstreamRejected(detail)
    }
}

/// Drop a `data:image/...;base64,` prefix if present.
pub(crate) fn strip_data_uri(image: &str) -> &str {
    match image.split_once(',') {
        Some((prefix, body)) if prefix.starts_with("data:") => body,
        _ => image,
    }
}

pub(crate) use glint_core::config::env_string_or as env_string;

pub(crate) fn env_optional(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
