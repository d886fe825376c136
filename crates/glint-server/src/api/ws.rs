//! The `/ws` endpoint and per-connection supervision.
//!
//! Three tasks per connection: this reader loop (demux, aggregation,
//! keepalive), the coordinator task (pipeline), and the writer task. The
//! writer is the only place that touches the outbound half of the socket, so
//! event order is exactly enqueue order.

use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::outbound::EventQueue;
use crate::state::AppState;
use glint_agent::{Command, EventSink, PipelineCoordinator};
use glint_core::{
    now_unix_millis, AggregatorOutput, ClientMessage, DecodeError, ErrorKind, ServerEvent,
    SessionAggregator,
};

/// How often the keepalive timer re-checks inbound idleness.
const KEEPALIVE_TICK: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    /// Connection id from a previous session, for memory re-attachment
    /// within the grace period.
    #[serde(default)]
    connection: Option<String>,
}

pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.connection))
}

async fn handle_socket(socket: WebSocket, state: AppState, requested_id: Option<String>) {
    state.connection_opened();
    let (connection_id, memory) = state.adopt_connection(requested_id).await;
    info!(connection_id = %connection_id, "websocket connection established");

    let (ws_tx, mut ws_rx) = socket.split();
    let queue = EventQueue::new(state.config.outbound_queue_depth);
    let mut writer = tokio::spawn(writer_task(ws_tx, queue.clone()));
    let mut writer_done = false;

    queue.push(ServerEvent::Connected {
        connection_id: connection_id.clone(),
        server_time_ms: now_unix_millis(),
    });

    let coordinator = PipelineCoordinator::new(
        state.stt.clone(),
        state.llm.clone(),
        state.tts.clone(),
        memory,
        std::sync::Arc::new(queue.clone()),
        state.config.clone(),
        connection_id.clone(),
    );
    let (commands, coordinator_handle) = coordinator.spawn();

    let mut actor = ConnectionActor {
        queue: queue.clone(),
        commands,
        aggregator: SessionAggregator::new(&state.config),
        screen_share_on: false,
    };

    let keepalive_after = Duration::from_secs(state.config.keepalive_after_s);
    let idle_close = Duration::from_secs(state.config.idle_close_s);
    let mut last_inbound = Instant::now();
    let mut heartbeat_sent = false;
    let mut keepalive = tokio::time::interval(KEEPALIVE_TICK);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let close_reason = loop {
        tokio::select! {
            message = ws_rx.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    last_inbound = Instant::now();
                    heartbeat_sent = false;
                    actor.on_text(text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | None => break "client closed",
                Some(Ok(_)) => {
                    // Binary frames and transport-level pings carry no
                    // application payload but still count as liveness.
                    last_inbound = Instant::now();
                }
                Some(Err(err)) => {
                    warn!(connection_id = %connection_id, error = %err, "websocket receive error");
                    break "receive error";
                }
            },
            _ = keepalive.tick() => {
                let idle = last_inbound.elapsed();
                if idle >= idle_close {
                    break "idle timeout";
                }
                if idle >= keepalive_after && !heartbeat_sent {
                    queue.push(ServerEvent::Heartbeat { timestamp: now_unix_millis() });
                    heartbeat_sent = true;
                }
            },
            _ = &mut writer, if !writer_done => {
                writer_done = true;
                break "outbound path closed";
            },
        }
    };

    info!(connection_id = %connection_id, reason = close_reason, "connection shutting down");
    if queue.was_overflowed() {
        warn!(connection_id = %connection_id, "connection closed under outbound backpressure");
    }

    // Teardown order: the coordinator first so cancellation fires before the
    // memory is parked, then the writer drains what is left.
    drop(actor);
    let memory = match coordinator_handle.await {
        Ok(memory) => Some(memory),
        Err(err) => {
            error!(connection_id = %connection_id, error = %err, "coordinator task failed");
            queue.push(ServerEvent::error(
                ErrorKind::Internal,
                "pipeline failed, closing connection",
            ));
            None
        }
    };
    queue.close();
    if !writer_done {
        let _ = writer.await;
    }
    if let Some(memory) = memory {
        state.park_memory(connection_id.clone(), memory).await;
    }
    state.connection_closed();
}

/// Drain the outbound queue into the socket. On overflow-close, a final
/// backpressure diagnostic goes out before the socket shuts.
async fn writer_task(mut ws_tx: SplitSink<WebSocket, Message>, queue: EventQueue) {
    while let Some(event) = queue.pop().await {
        let json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(err) => {
                warn!(error = %err, "failed to serialize outbound event");
                continue;
            }
        };
        if ws_tx.send(Message::Text(json.into())).await.is_err() {
            queue.close();
            return;
        }
    }
    if queue.was_overflowed() {
        let diagnostic = ServerEvent::error(
            ErrorKind::Backpressure,
            "outbound queue overflow, closing connection",
        );
        if let Ok(json) = serde_json::to_string(&diagnostic) {
            let _ = ws_tx.send(Message::Text(json.into())).await;
        }
    }
    let _ = ws_tx.close().await;
}

/// Demultiplexes decoded inbound messages to the aggregator, the coordinator,
/// and the outbound queue. Owned by the reader loop; dropping it closes the
/// coordinator's command channel.
struct ConnectionActor {
    queue: EventQueue,
    commands: mpsc::Sender<Command>,
    aggregator: SessionAggregator,
    screen_share_on: bool,
}

impl ConnectionActor {
    async fn on_text(&mut self, text: &str) {
        match ClientMessage::decode(text) {
            Ok(message) => self.dispatch(message).await,
            Err(DecodeError::UnknownType(kind)) => {
                warn!(kind = %kind, "ignoring unknown message type");
            }
            Err(DecodeError::Malformed(detail)) => {
                self.queue.emit(ServerEvent::error(
                    ErrorKind::InvalidMessage,
                    format!("invalid message: {detail}"),
                ));
            }
        }
    }

    async fn dispatch(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::AudioData {
                data,
                sample_rate,
                vad,
                screen_image,
                timestamp,
            } => {
                let now_ms = timestamp.unwrap_or_else(now_unix_millis);
                let outputs =
                    self.aggregator
                        .handle_frame(&data, sample_rate, &vad, screen_image, now_ms);
                self.forward(outputs).await;
            }
            ClientMessage::VadState { vad, timestamp } => {
                let now_ms = timestamp.unwrap_or_else(now_unix_millis);
                let outputs = self.aggregator.handle_silence(&vad, now_ms);
                self.forward(outputs).await;
            }
            ClientMessage::VoiceAssistantStart => {
                self.aggregator.set_enabled(true);
                self.queue.emit(ServerEvent::VoiceAssistantStarted {
                    timestamp: now_unix_millis(),
                });
            }
            ClientMessage::VoiceAssistantStop => {
                self.aggregator.set_enabled(false);
                self.queue.emit(ServerEvent::VoiceAssistantStopped {
                    timestamp: now_unix_millis(),
                });
            }
            ClientMessage::ScreenShareStart => {
                self.screen_share_on = true;
                let _ = self.commands.send(Command::ScreenShare(true)).await;
                self.queue.emit(ServerEvent::ScreenShareStarted {
                    screen_share_on: self.screen_share_on,
                    timestamp: now_unix_millis(),
                });
            }
            ClientMessage::ScreenShareStop => {
                self.screen_share_on = false;
                let _ = self.commands.send(Command::ScreenShare(false)).await;
                self.queue.emit(ServerEvent::ScreenShareStopped {
                    screen_share_on: self.screen_share_on,
                    timestamp: now_unix_millis(),
                });
            }
            ClientMessage::ScreenCaptureResponse { screen_image, .. } => {
                let _ = self
                    .commands
                    .send(Command::ScreenCaptureResponse {
                        image: screen_image,
                    })
                    .await;
            }
            ClientMessage::Heartbeat => {
                self.queue.emit(ServerEvent::HeartbeatAck {
                    timestamp: now_unix_millis(),
                });
            }
        }
    }

    async fn forward(&mut self, outputs: Vec<AggregatorOutput>) {
        for output in outputs {
            match output {
                AggregatorOutput::SpeechStarted => {
                    self.queue.emit(ServerEvent::SpeechActive {
                        timestamp: now_unix_millis(),
                    });
                }
                AggregatorOutput::SilenceNoted => {
                    self.queue.emit(ServerEvent::SpeechInactive {
                        timestamp: now_unix_millis(),
                    });
                }
                AggregatorOutput::SessionComplete(session) => {
                    debug!(
                        session_id = session.id,
                        duration_s = session.duration_s(),
                        "handing completed utterance to the pipeline"
                    );
                    if self.commands.send(Command::Session(session)).await.is_err() {
                        warn!("pipeline coordinator is gone, dropping utterance");
                    }
                }
                AggregatorOutput::SessionDiscarded { duration_s } => {
                    debug!(duration_s, "discarded sub-minimum utterance");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glint_core::OrchestratorConfig;

    fn actor() -> (ConnectionActor, mpsc::Receiver<Command>, EventQueue) {
        let (tx, rx) = mpsc::channel(4);
        let queue = EventQueue::new(16);
        let actor = ConnectionActor {
            queue: queue.clone(),
            commands: tx,
            aggregator: SessionAggregator::new(&OrchestratorConfig::default()),
            screen_share_on: false,
        };
        (actor, rx, queue)
    }

    fn audio_frame_json(is_speaking: bool, samples: usize, timestamp: u64) -> String {
        let data = vec![0.1f32; samples];
        serde_json::json!({
            "type": "audio_data",
            "data": data,
            "sample_rate": 16_000,
            "vad": {"isSpeaking": is_speaking, "energy": 0.5, "confidence": 0.9},
            "timestamp": timestamp,
        })
        .to_string()
    }

    #[tokio::test]
    async fn heartbeat_is_acknowledged_exactly_once() {
        let (mut actor, _rx, queue) = actor();
        actor
            .on_text(r#"{"type": "heartbeat", "timestamp": 1}"#)
            .await;
        let event = queue.pop().await.expect("ack expected");
        assert_eq!(event.kind_name(), "heartbeat_ack");
    }

    #[tokio::test]
    async fn speech_frames_produce_speech_active_then_a_session() {
        let (mut actor, mut rx, queue) = actor();
        actor.on_text(&audio_frame_json(true, 16_000, 0)).await;
        assert_eq!(
            queue.pop().await.expect("event").kind_name(),
            "speech_active"
        );
        actor
            .on_text(
                &serde_json::json!({
                    "type": "vad_state",
                    "vad": {"isSpeaking": false, "energy": 0.0, "confidence": 0.1},
                    "timestamp": 1_000,
                })
                .to_string(),
            )
            .await;
        match rx.try_recv() {
            Ok(Command::Session(session)) => assert!((session.duration_s() - 1.0).abs() < 0.01),
            other => panic!("expected a session handoff, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn screen_share_start_acks_and_notifies_the_pipeline() {
        let (mut actor, mut rx, queue) = actor();
        actor
            .on_text(r#"{"type": "screen_share_start", "timestamp": 1}"#)
            .await;
        assert!(matches!(rx.try_recv(), Ok(Command::ScreenShare(true))));
        assert_eq!(
            queue.pop().await.expect("event").kind_name(),
            "screen_share_started"
        );
        assert!(actor.screen_share_on);
    }

    #[tokio::test]
    async fn capture_response_is_forwarded_to_the_coordinator() {
        let (mut actor, mut rx, _queue) = actor();
        actor
            .on_text(
                &serde_json::json!({
                    "type": "screen_capture_response",
                    "screen_image": "data:image/jpeg;base64,abc",
                    "timestamp": 1,
                })
                .to_string(),
            )
            .await;
        match rx.try_recv() {
            Ok(Command::ScreenCaptureResponse { image }) => {
                assert_eq!(image.as_deref(), Some("data:image/jpeg;base64,abc"))
            }
            other => panic!("expected a capture response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_types_are_ignored_and_bad_json_is_reported() {
        let (mut actor, _rx, queue) = actor();
        actor.on_text(r#"{"type": "telemetry"}"#).await;
        actor.on_text("{oops").await;
        let event = queue.pop().await.expect("error event");
        match event {
            ServerEvent::Error { kind, .. } => assert_eq!(kind, ErrorKind::InvalidMessage),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn frames_are_ignored_while_the_assistant_is_stopped() {
        let (mut actor, mut rx, queue) = actor();
        actor
            .on_text(r#"{"type": "voice_assistant_stop", "timestamp": 1}"#)
            .await;
        assert_eq!(
            queue.pop().await.expect("ack").kind_name(),
            "voice_assistant_stopped"
        );
        actor.on_text(&audio_frame_json(true, 16_000, 0)).await;
        assert!(rx.try_recv().is_err());
        actor
            .on_text(r#"{"type": "voice_assistant_start", "timestamp": 2}"#)
            .await;
        assert_eq!(
            queue.pop().await.expect("ack").kind_name(),
            "voice_assistant_started"
        );
    }
}
