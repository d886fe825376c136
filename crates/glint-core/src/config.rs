//! Process-wide configuration for the orchestrator.
//!
//! Every knob resolves from an environment variable with a canonical default,
//! so the server binary can run with nothing but API credentials set.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Canonical inbound/outbound audio rate in Hz.
pub const CANONICAL_SAMPLE_RATE: u32 = 16_000;

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Canonical audio rate; frames at other rates are resampled on ingest.
    pub sample_rate: u32,
    /// Sessions shorter than this are discarded without transcription.
    pub min_speech_duration_s: f32,
    /// Sessions reaching this duration are force-closed.
    pub max_speech_duration_s: f32,
    /// Per-connection conversation memory budget (estimated tokens).
    pub memory_max_tokens: usize,
    pub stage_deadline_stt_s: u64,
    pub stage_deadline_llm_s: u64,
    pub stage_deadline_tts_s: u64,
    /// Send a server heartbeat after this much inbound silence.
    pub keepalive_after_s: u64,
    /// Close the connection after this much inbound silence.
    pub idle_close_s: u64,
    /// Per-connection outbound event buffer.
    pub outbound_queue_depth: usize,
    /// How long to wait for a `screen_capture_response` before giving up.
    pub screen_capture_wait_s: u64,
    /// How long a memory snapshot waits on an in-flight summarisation.
    pub summarize_wait_s: u64,
    /// How long a disconnected client's memory is retained for re-attach.
    pub reconnect_grace_s: u64,
    pub voice_preset: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            sample_rate: CANONICAL_SAMPLE_RATE,
            min_speech_duration_s: 0.5,
            max_speech_duration_s: 30.0,
            memory_max_tokens: 2000,
            stage_deadline_stt_s: 20,
            stage_deadline_llm_s: 30,
            stage_deadline_tts_s: 45,
            keepalive_after_s: 45,
            idle_close_s: 90,
            outbound_queue_depth: 64,
            screen_capture_wait_s: 5,
            summarize_wait_s: 5,
            reconnect_grace_s: 30,
            voice_preset: "default".to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// Resolve the configuration from `GLINT_*` environment variables,
    /// falling back to the canonical defaults for anything unset or invalid.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            sample_rate: env_or("GLINT_SAMPLE_RATE", defaults.sample_rate),
            min_speech_duration_s: env_or("GLINT_MIN_SPEECH_S", defaults.min_speech_duration_s),
            max_speech_duration_s: env_or("GLINT_MAX_SPEECH_S", defaults.max_speech_duration_s),
            memory_max_tokens: env_or("GLINT_MEMORY_MAX_TOKENS", defaults.memory_max_tokens),
            stage_deadline_stt_s: env_or("GLINT_STT_DEADLINE_S", defaults.stage_deadline_stt_s),
            stage_deadline_llm_s: env_or("GLINT_LLM_DEADLINE_S", defaults.stage_deadline_llm_s),
            stage_deadline_tts_s: env_or("GLINT_TTS_DEADLINE_S", defaults.stage_deadline_tts_s),
            keepalive_after_s: env_or("GLINT_KEEPALIVE_AFTER_S", defaults.keepalive_after_s),
            idle_close_s: env_or("GLINT_IDLE_CLOSE_S", defaults.idle_close_s),
            outbound_queue_depth: env_or("GLINT_OUTBOUND_QUEUE", defaults.outbound_queue_depth),
            screen_capture_wait_s: env_or("GLINT_SCREEN_WAIT_S", defaults.screen_capture_wait_s),
            summarize_wait_s: env_or("GLINT_SUMMARIZE_WAIT_S", defaults.summarize_wait_s),
            reconnect_grace_s: env_or("GLINT_RECONNECT_GRACE_S", defaults.reconnect_grace_s),
            voice_preset: env_string_or("GLINT_VOICE_PRESET", &defaults.voice_preset),
        }
    }

    pub fn min_speech_samples(&self) -> usize {
        (self.min_speech_duration_s * self.sample_rate as f32) as usize
    }

    pub fn max_speech_samples(&self) -> usize {
        (self.max_speech_duration_s * self.sample_rate as f32) as usize
    }

    pub fn stt_deadline(&self) -> Duration {
        Duration::from_secs(self.stage_deadline_stt_s)
    }

    pub fn llm_deadline(&self) -> Duration {
        Duration::from_secs(self.stage_deadline_llm_s)
    }

    pub fn tts_deadline(&self) -> Duration {
        Duration::from_secs(self.stage_deadline_tts_s)
    }

    pub fn screen_capture_wait(&self) -> Duration {
        Duration::from_secs(self.screen_capture_wait_s)
    }

    pub fn summarize_wait(&self) -> Duration {
        Duration::from_secs(self.summarize_wait_s)
    }

    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_secs(self.reconnect_grace_s)
    }
}

/// Parse an environment variable, warning and falling back on invalid values.
pub fn env_or<T>(name: &str, default: T) -> T
where
    T: FromStr + Copy,
{
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("Invalid {}='{}', falling back to default", name, raw);
                default
            }
        },
        Err(_) => default,
    }
}

/// Non-empty string environment variable with a default.
pub fn env_string_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, MutexGuard, OnceLock};

    fn env_lock() -> MutexGuard<'static, ()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .expect("environment lock poisoned")
    }

    #[test]
    fn defaults_match_canonical_bounds() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.sample_rate, 16_000);
        assert_eq!(config.min_speech_samples(), 8_000);
        assert_eq!(config.max_speech_samples(), 480_000);
        assert_eq!(config.memory_max_tokens, 2000);
        assert_eq!(config.outbound_queue_depth, 64);
    }

    #[test]
    fn environment_overrides_defaults() {
        let _guard = env_lock();
        std::env::set_var("GLINT_MEMORY_MAX_TOKENS", "512");
        let config = OrchestratorConfig::from_env();
        assert_eq!(config.memory_max_tokens, 512);
        std::env::remove_var("GLINT_MEMORY_MAX_TOKENS");
    }

    #[test]
    fn invalid_environment_value_falls_back() {
        let _guard = env_lock();
        std::env::set_var("GLINT_IDLE_CLOSE_S", "soon");
        let config = OrchestratorConfig::from_env();
        assert_eq!(config.idle_close_s, 90);
        std::env::remove_var("GLINT_IDLE_CLOSE_S");
    }

    #[test]
    fn blank_string_values_fall_back() {
        let _guard = env_lock();
        std::env::set_var("GLINT_VOICE_PRESET", "   ");
        assert_eq!(env_string_or("GLINT_VOICE_PRESET", "default"), "default");
        std::env::set_var("GLINT_VOICE_PRESET", "narrator");
        assert_eq!(env_string_or("GLINT_VOICE_PRESET", "default"), "narrator");
        std::env::remove_var("GLINT_VOICE_PRESET");
    }
}
