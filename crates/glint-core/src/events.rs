//! Wire messages for the `/ws` endpoint.
//!
//! Everything is text-framed JSON with a `type` tag. Inbound messages carry a
//! client-clock `timestamp` in milliseconds since epoch; outbound events are
//! stamped with the server clock at construction.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Per-frame voice-activity verdict computed by the client.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VadVerdict {
    pub is_speaking: bool,
    #[serde(default)]
    pub energy: f32,
    #[serde(default)]
    pub confidence: f32,
}

fn default_sample_rate() -> u32 {
    crate::config::CANONICAL_SAMPLE_RATE
}

/// Client → server messages.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    AudioData {
        #[serde(default)]
        data: Vec<f32>,
        #[serde(default = "default_sample_rate")]
        sample_rate: u32,
        vad: VadVerdict,
        #[serde(default)]
        screen_image: Option<String>,
        #[serde(default)]
        timestamp: Option<u64>,
    },
    VadState {
        vad: VadVerdict,
        #[serde(default)]
        timestamp: Option<u64>,
    },
    VoiceAssistantStart,
    VoiceAssistantStop,
    ScreenShareStart,
    ScreenShareStop,
    ScreenCaptureResponse {
        #[serde(default)]
        screen_image: Option<String>,
        #[serde(default)]
        request_data: Option<serde_json::Value>,
        #[serde(default)]
        timestamp: Option<u64>,
    },
    Heartbeat,
}

/// Why an inbound frame could not be dispatched.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON payload: {0}")]
    Malformed(String),
    /// Forward-compatible: logged and ignored by the caller.
    #[error("unknown message type `{0}`")]
    UnknownType(String),
}

impl ClientMessage {
    /// Decode one inbound text frame, distinguishing malformed JSON (client
    /// error) from an unrecognised `type` (ignored for forward compatibility).
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| DecodeError::Malformed("missing `type` field".to_string()))?
            .to_string();
        match serde_json::from_value(value) {
            Ok(message) => Ok(message),
            Err(e) => {
                if KNOWN_TYPES.contains(&kind.as_str()) {
                    Err(DecodeError::Malformed(e.to_string()))
                } else {
                    Err(DecodeError::UnknownType(kind))
                }
            }
        }
    }
}

const KNOWN_TYPES: &[&str] = &[
    "audio_data",
    "vad_state",
    "voice_assistant_start",
    "voice_assistant_stop",
    "screen_share_start",
    "screen_share_stop",
    "screen_capture_response",
    "heartbeat",
];

/// Error kinds surfaced to the client on `error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SttFailed,
    LlmFailed,
    TtsFailed,
    ScreenUnavailable,
    Backpressure,
    /// A queued utterance was displaced by a newer one before it could run.
    SessionDropped,
    InvalidMessage,
    Internal,
}

/// Server → client events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected {
        connection_id: String,
        server_time_ms: u64,
    },
    SpeechActive {
        timestamp: u64,
    },
    SpeechInactive {
        timestamp: u64,
    },
    TranscriptionResult {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        confidence: Option<f32>,
        processing_time: f64,
        timestamp: u64,
    },
    AiResponse {
        text: String,
        processing_time: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        screen_context: Option<String>,
        timestamp: u64,
    },
    AudioResponse {
        audio_data: Vec<f32>,
        sample_rate: u32,
        duration: f64,
        processing_time: f64,
        timestamp: u64,
    },
    ScreenCaptureRequest {
        reason: String,
        original_text: String,
        timestamp: u64,
    },
    ScreenShareStarted {
        screen_share_on: bool,
        timestamp: u64,
    },
    ScreenShareStopped {
        screen_share_on: bool,
        timestamp: u64,
    },
    VoiceAssistantStarted {
        timestamp: u64,
    },
    VoiceAssistantStopped {
        timestamp: u64,
    },
    Error {
        kind: ErrorKind,
        message: String,
        timestamp: u64,
    },
    Heartbeat {
        timestamp: u64,
    },
    HeartbeatAck {
        timestamp: u64,
    },
}

impl ServerEvent {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
            timestamp: now_unix_millis(),
        }
    }

    /// Critical events must reach the client; non-critical ones (status
    /// chatter, keepalives) may be evicted when the outbound queue is full.
    pub fn is_critical(&self) -> bool {
        !matches!(
            self,
            Self::SpeechActive { .. }
                | Self::SpeechInactive { .. }
                | Self::Heartbeat { .. }
                | Self::HeartbeatAck { .. }
        )
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::SpeechActive { .. } => "speech_active",
            Self::SpeechInactive { .. } => "speech_inactive",
            Self::TranscriptionResult { .. } => "transcription_result",
            Self::AiResponse { .. } => "ai_response",
            Self::AudioResponse { .. } => "audio_response",
            Self::ScreenCaptureRequest { .. } => "screen_capture_request",
            Self::ScreenShareStarted { .. } => "screen_share_started",
            Self::ScreenShareStopped { .. } => "screen_share_stopped",
            Self::VoiceAssistantStarted { .. } => "voice_assistant_started",
            Self::VoiceAssistantStopped { .. } => "voice_assistant_stopped",
            Self::Error { .. } => "error",
            Self::Heartbeat { .. } => "heartbeat",
            Self::HeartbeatAck { .. } => "heartbeat_ack",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_audio_data_frame() {
        let text = r#"{
            "type": "audio_data",
            "data": [0.0, 0.1, -0.1],
            "sample_rate": 16000,
            "vad": {"isSpeaking": true, "energy": 0.4, "confidence": 0.9},
            "timestamp": 1700000000000
        }"#;
        match ClientMessage::decode(text).expect("should decode") {
            ClientMessage::AudioData {
                data,
                sample_rate,
                vad,
                screen_image,
                timestamp,
            } => {
                assert_eq!(data.len(), 3);
                assert_eq!(sample_rate, 16_000);
                assert!(vad.is_speaking);
                assert!(screen_image.is_none());
                assert_eq!(timestamp, Some(1_700_000_000_000));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_reported_as_such() {
        let err = ClientMessage::decode(r#"{"type": "telemetry", "x": 1}"#).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownType(kind) if kind == "telemetry"));
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(matches!(
            ClientMessage::decode("{not json"),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            ClientMessage::decode(r#"{"data": []}"#),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn known_type_with_bad_fields_is_malformed_not_unknown() {
        let err = ClientMessage::decode(r#"{"type": "audio_data", "vad": "loud"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn outbound_events_use_snake_case_tags() {
        let event = ServerEvent::error(ErrorKind::SttFailed, "backend down");
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "error");
        assert_eq!(json["kind"], "stt_failed");
        assert_eq!(json["message"], "backend down");
    }

    #[test]
    fn keepalives_and_status_chatter_are_droppable() {
        let now = now_unix_millis();
        assert!(!ServerEvent::SpeechActive { timestamp: now }.is_critical());
        assert!(!ServerEvent::HeartbeatAck { timestamp: now }.is_critical());
        assert!(ServerEvent::TranscriptionResult {
            text: "hi".into(),
            confidence: None,
            processing_time: 0.1,
            timestamp: now,
        }
        .is_critical());
    }
}
