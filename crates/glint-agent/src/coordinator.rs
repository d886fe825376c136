//! Utterance pipeline coordination.
//!
//! One coordinator task per connection, owning the conversation memory and
//! driving each completed speech session through transcription, the language
//! model, and synthesis. The task consumes commands from the connection
//! supervisor over a bounded channel and is the only place pipeline state is
//! mutated, so no locks guard it.
//!
//! Preemption contract: while a job has not yet emitted its final AI text, a
//! newer session cancels it by dropping the in-flight stage future. Once the
//! AI text is out, the job runs to completion and the newer session waits in
//! a depth-1 slot; a third arrival displaces the waiting one.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clients::{LanguageModel, RespondRequest, SpeechSynthesis, SpeechToText};
use crate::memory::{ConversationMemory, ConversationTurn};
use crate::screen_triggers;
use glint_core::{now_unix_millis, ErrorKind, OrchestratorConfig, ServerEvent, SpeechSession};

/// Where the coordinator's outbound events go. The server backs this with the
/// per-connection writer queue; tests collect into a vector.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ServerEvent);
}

/// Supervisor → coordinator messages.
#[derive(Debug)]
pub enum Command {
    /// A completed speech session ready for the pipeline.
    Session(SpeechSession),
    /// Client reply to a `screen_capture_request`.
    ScreenCaptureResponse { image: Option<String> },
    /// Screen-share flag changed.
    ScreenShare(bool),
    Shutdown,
}

enum Raced<T> {
    Done(T),
    Superseded(Box<SpeechSession>),
    Disconnected,
}

enum ScreenWait {
    Image(Option<String>),
    TimedOut,
    Superseded(Box<SpeechSession>),
    Disconnected,
}

enum JobExit {
    Idle,
    Next(Box<SpeechSession>),
    Disconnected,
}

pub struct PipelineCoordinator {
    stt: Arc<dyn SpeechToText>,
    llm: Arc<dyn LanguageModel>,
    tts: Arc<dyn SpeechSynthesis>,
    memory: ConversationMemory,
    events: Arc<dyn EventSink>,
    config: OrchestratorConfig,
    connection_id: String,
    screen_share_on: bool,
}

impl PipelineCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stt: Arc<dyn SpeechToText>,
        llm: Arc<dyn LanguageModel>,
        tts: Arc<dyn SpeechSynthesis>,
        memory: ConversationMemory,
        events: Arc<dyn EventSink>,
        config: OrchestratorConfig,
        connection_id: impl Into<String>,
    ) -> Self {
        Self {
            stt,
            llm,
            tts,
            memory,
            events,
            config,
            connection_id: connection_id.into(),
            screen_share_on: false,
        }
    }

    /// Start the coordinator task. The returned sender is the bounded handoff
    /// from the supervisor; the join handle resolves to the conversation
    /// memory so it can be parked for the reconnect grace period.
    pub fn spawn(self) -> (mpsc::Sender<Command>, JoinHandle<ConversationMemory>) {
        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(self.run(rx));
        (tx, handle)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) -> ConversationMemory {
        let mut next: Option<Box<SpeechSession>> = None;
        loop {
            let session = match next.take() {
                Some(queued) => *queued,
                None => match commands.recv().await {
                    Some(Command::Session(session)) => session,
                    Some(Command::ScreenShare(on)) => {
                        self.screen_share_on = on;
                        continue;
                    }
                    Some(Command::ScreenCaptureResponse { .. }) => {
                        debug!("screen capture response with no pending request, ignoring");
                        continue;
                    }
                    Some(Command::Shutdown) | None => break,
                },
            };
            debug!(
                session_id = session.id,
                duration_s = session.duration_s(),
                "starting utterance pipeline"
            );
            match self.run_job(&mut commands, session).await {
                JobExit::Idle => {}
                JobExit::Next(session) => next = Some(session),
                JobExit::Disconnected => break,
            }
        }
        self.memory
    }

    async fn run_job(
        &mut self,
        commands: &mut mpsc::Receiver<Command>,
        session: SpeechSession,
    ) -> JobExit {
        let session_id = session.id;
        let SpeechSession {
            samples,
            sample_rate,
            mut screen_image,
            ..
        } = session;

        // Transcription. Cancellable: nothing user-visible exists yet.
        let stt = Arc::clone(&self.stt);
        let stt_future = async move { stt.transcribe(&samples, sample_rate).await };
        let transcription =
            match race_commands(commands, &mut self.screen_share_on, stt_future).await {
                Raced::Done(Ok(transcription)) => transcription,
                Raced::Done(Err(err)) => {
                    warn!(session_id, error = %err, "transcription failed");
                    self.events.emit(ServerEvent::error(
                        ErrorKind::SttFailed,
                        format!("transcription failed: {err}"),
                    ));
                    return JobExit::Idle;
                }
                Raced::Superseded(next) => {
                    info!(session_id, "superseded during transcription");
                    return JobExit::Next(next);
                }
                Raced::Disconnected => return JobExit::Disconnected,
            };

        let user_text = transcription.text.trim().to_string();
        if user_text.is_empty() {
            debug!(session_id, "empty transcription, dropping session");
            return JobExit::Idle;
        }
        self.events.emit(ServerEvent::TranscriptionResult {
            text: user_text.clone(),
            confidence: transcription.confidence,
            processing_time: transcription.processing_ms as f64 / 1000.0,
            timestamp: now_unix_millis(),
        });

        // Keyword pre-filter: fetch the screen before the first model call
        // when the user is plainly asking about it. Advisory; a timeout here
        // just proceeds without the image.
        if screen_image.is_none() && self.screen_share_on {
            if let Some(hit) = screen_triggers::should_capture(&user_text) {
                self.events.emit(ServerEvent::ScreenCaptureRequest {
                    reason: hit.reason.to_string(),
                    original_text: user_text.clone(),
                    timestamp: now_unix_millis(),
                });
                match await_screen_capture(
                    commands,
                    &mut self.screen_share_on,
                    self.config.screen_capture_wait(),
                )
                .await
                {
                    ScreenWait::Image(image) => screen_image = image,
                    ScreenWait::TimedOut => {
                        debug!(session_id, "pre-filter screen capture timed out")
                    }
                    ScreenWait::Superseded(next) => return JobExit::Next(next),
                    ScreenWait::Disconnected => return JobExit::Disconnected,
                }
            }
        }

        // Language model. Still cancellable.
        let memory_snapshot = self.memory.snapshot().await;
        let llm = Arc::clone(&self.llm);
        let request = RespondRequest {
            user_text: user_text.clone(),
            memory: memory_snapshot.clone(),
            screen_image: screen_image.clone(),
            session_hint: self.connection_id.clone(),
        };
        let llm_future = async move { llm.respond(request).await };
        let mut reply = match race_commands(commands, &mut self.screen_share_on, llm_future).await {
            Raced::Done(Ok(reply)) => reply,
            Raced::Done(Err(err)) => {
                warn!(session_id, error = %err, "language model failed");
                self.events.emit(ServerEvent::error(
                    ErrorKind::LlmFailed,
                    format!("response generation failed: {err}"),
                ));
                return JobExit::Idle;
            }
            Raced::Superseded(next) => {
                info!(session_id, "superseded during response generation");
                return JobExit::Next(next);
            }
            Raced::Disconnected => return JobExit::Disconnected,
        };

        // Screen-capture-on-demand: the model asked for a current screen
        // image. A session that already carried one is never re-asked.
        if reply.needs_screen && screen_image.is_none() {
            self.events.emit(ServerEvent::ScreenCaptureRequest {
                reason: "model_request".to_string(),
                original_text: user_text.clone(),
                timestamp: now_unix_millis(),
            });
            match await_screen_capture(
                commands,
                &mut self.screen_share_on,
                self.config.screen_capture_wait(),
            )
            .await
            {
                ScreenWait::Image(Some(image)) => {
                    let llm = Arc::clone(&self.llm);
                    let request = RespondRequest {
                        user_text: user_text.clone(),
                        memory: memory_snapshot,
                        screen_image: Some(image),
                        session_hint: self.connection_id.clone(),
                    };
                    let llm_future = async move { llm.respond(request).await };
                    reply =
                        match race_commands(commands, &mut self.screen_share_on, llm_future).await {
                            Raced::Done(Ok(reply)) => reply,
                            Raced::Done(Err(err)) => {
                                warn!(session_id, error = %err, "language model failed with screen context");
                                self.events.emit(ServerEvent::error(
                                    ErrorKind::LlmFailed,
                                    format!("response generation failed: {err}"),
                                ));
                                return JobExit::Idle;
                            }
                            Raced::Superseded(next) => return JobExit::Next(next),
                            Raced::Disconnected => return JobExit::Disconnected,
                        };
                }
                ScreenWait::Image(None) | ScreenWait::TimedOut => {
                    if reply.text.trim().is_empty() {
                        self.events.emit(ServerEvent::error(
                            ErrorKind::ScreenUnavailable,
                            "no screen capture arrived within the deadline",
                        ));
                        return JobExit::Idle;
                    }
                    debug!(session_id, "screen capture unavailable, keeping provisional answer");
                }
                ScreenWait::Superseded(next) => return JobExit::Next(next),
                ScreenWait::Disconnected => return JobExit::Disconnected,
            }
        } else if reply.needs_screen && reply.text.trim().is_empty() {
            // The model saw the attached screen and still asked again.
            self.events.emit(ServerEvent::error(
                ErrorKind::ScreenUnavailable,
                "model requested a screen capture it already received",
            ));
            return JobExit::Idle;
        }

        let ai_text = reply.text.trim().to_string();
        self.events.emit(ServerEvent::AiResponse {
            text: ai_text.clone(),
            processing_time: reply.processing_ms as f64 / 1000.0,
            screen_context: reply.screen_summary.clone(),
            timestamp: now_unix_millis(),
        });

        // The AI text is committed: from here a newer session queues instead
        // of cancelling, and the turn is recorded whatever synthesis does.
        if ai_text.is_empty() {
            self.memory
                .append(ConversationTurn::new(user_text, ai_text, reply.screen_summary));
            return JobExit::Idle;
        }

        let tts = Arc::clone(&self.tts);
        let voice_preset = self.config.voice_preset.clone();
        let speak_text = ai_text.clone();
        let tts_future = async move { tts.synthesize(&speak_text, &voice_preset).await };
        let (finished, queued, displaced) =
            run_guarded_tts(commands, &mut self.screen_share_on, tts_future).await;
        match finished {
            Some(Ok(speech)) => {
                self.events.emit(ServerEvent::AudioResponse {
                    audio_data: speech.samples,
                    sample_rate: speech.sample_rate,
                    duration: speech.duration_s,
                    processing_time: speech.processing_ms as f64 / 1000.0,
                    timestamp: now_unix_millis(),
                });
            }
            Some(Err(err)) => {
                warn!(session_id, error = %err, "speech synthesis failed");
                self.events.emit(ServerEvent::error(
                    ErrorKind::TtsFailed,
                    format!("speech synthesis failed: {err}"),
                ));
            }
            None => return JobExit::Disconnected,
        }
        self.memory
            .append(ConversationTurn::new(user_text, ai_text, reply.screen_summary));
        // Diagnostics for displaced queue entries go out after the finished
        // session's events so its triple stays contiguous.
        for dropped_id in displaced {
            self.events.emit(ServerEvent::error(
                ErrorKind::SessionDropped,
                format!("utterance {dropped_id} superseded before processing"),
            ));
        }
        match queued {
            Some(next) => JobExit::Next(next),
            None => JobExit::Idle,
        }
    }
}

/// Await a stage future while keeping the command channel responsive. A new
/// session cancels the stage by dropping its future.
async fn race_commands<F: Future>(
    commands: &mut mpsc::Receiver<Command>,
    screen_share_on: &mut bool,
    future: F,
) -> Raced<F::Output> {
    tokio::pin!(future);
    loop {
        tokio::select! {
            output = &mut future => return Raced::Done(output),
            command = commands.recv() => match command {
                Some(Command::Session(session)) => return Raced::Superseded(Box::new(session)),
                Some(Command::ScreenShare(on)) => *screen_share_on = on,
                Some(Command::ScreenCaptureResponse { .. }) => {
                    debug!("ignoring stale screen capture response");
                }
                Some(Command::Shutdown) | None => return Raced::Disconnected,
            },
        }
    }
}

async fn await_screen_capture(
    commands: &mut mpsc::Receiver<Command>,
    screen_share_on: &mut bool,
    wait: std::time::Duration,
) -> ScreenWait {
    let deadline = tokio::time::sleep(wait);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => return ScreenWait::TimedOut,
            command = commands.recv() => match command {
                Some(Command::ScreenCaptureResponse { image }) => return ScreenWait::Image(image),
                Some(Command::Session(session)) => return ScreenWait::Superseded(Box::new(session)),
                Some(Command::ScreenShare(on)) => *screen_share_on = on,
                Some(Command::Shutdown) | None => return ScreenWait::Disconnected,
            },
        }
    }
}

/// Run synthesis to completion, queueing at most one newer session. The first
/// element is `None` on disconnect; the third lists displaced session ids.
async fn run_guarded_tts<F>(
    commands: &mut mpsc::Receiver<Command>,
    screen_share_on: &mut bool,
    future: F,
) -> (Option<F::Output>, Option<Box<SpeechSession>>, Vec<u64>)
where
    F: Future,
{
    tokio::pin!(future);
    let mut queued: Option<Box<SpeechSession>> = None;
    let mut displaced = Vec::new();
    loop {
        tokio::select! {
            output = &mut future => return (Some(output), queued, displaced),
            command = commands.recv() => match command {
                Some(Command::Session(session)) => {
                    if let Some(dropped) = queued.replace(Box::new(session)) {
                        warn!(session_id = dropped.id, "queued utterance displaced by a newer one");
                        displaced.push(dropped.id);
                    }
                }
                Some(Command::ScreenShare(on)) => *screen_share_on = on,
                Some(Command::ScreenCaptureResponse { .. }) => {}
                Some(Command::Shutdown) | None => return (None, queued, displaced),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{LlmReply, SynthesizedSpeech, Transcription};
    use crate::errors::{Result as StageResult, StageError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct VecSink(Mutex<Vec<ServerEvent>>);

    impl VecSink {
        fn new() -> Arc<Self> {
            Arc::new(Self(Mutex::new(Vec::new())))
        }

        fn events(&self) -> Vec<ServerEvent> {
            self.0.lock().expect("sink lock").clone()
        }

        fn kinds(&self) -> Vec<&'static str> {
            self.events().iter().map(ServerEvent::kind_name).collect()
        }
    }

    impl EventSink for VecSink {
        fn emit(&self, event: ServerEvent) {
            self.0.lock().expect("sink lock").push(event);
        }
    }

    #[derive(Default)]
    struct FakeStt {
        delay_ms: u64,
        fixed_text: Option<String>,
        fail: Option<StageError>,
    }

    #[async_trait]
    impl SpeechToText for FakeStt {
        async fn transcribe(&self, samples: &[f32], _rate: u32) -> StageResult<Transcription> {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            if let Some(err) = &self.fail {
                return Err(err.clone());
            }
            let text = self
                .fixed_text
                .clone()
                .unwrap_or_else(|| format!("utterance of {} samples", samples.len()));
            Ok(Transcription {
                text,
                confidence: Some(0.92),
                processing_ms: 4,
            })
        }
    }

    #[derive(Default)]
    struct FakeLlm {
        delay_ms: u64,
        fail: Option<StageError>,
        /// Ask for a screen capture whenever none is attached.
        wants_screen: bool,
        /// Text returned alongside the screen request.
        provisional_text: String,
        saw_image: AtomicBool,
        snapshot_turn_counts: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl LanguageModel for FakeLlm {
        async fn respond(&self, request: RespondRequest) -> StageResult<LlmReply> {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            if let Some(err) = &self.fail {
                return Err(err.clone());
            }
            self.snapshot_turn_counts
                .lock()
                .expect("lock")
                .push(request.memory.turns.len());
            if request.screen_image.is_some() {
                self.saw_image.store(true, Ordering::SeqCst);
                Ok(LlmReply {
                    text: format!("Looking at your screen: {}", request.user_text),
                    needs_screen: false,
                    screen_summary: Some("a code editor with a failing build".to_string()),
                    processing_ms: 7,
                })
            } else if self.wants_screen {
                Ok(LlmReply {
                    text: self.provisional_text.clone(),
                    needs_screen: true,
                    screen_summary: None,
                    processing_ms: 7,
                })
            } else {
                Ok(LlmReply {
                    text: format!("You said: {}", request.user_text),
                    needs_screen: false,
                    screen_summary: None,
                    processing_ms: 7,
                })
            }
        }

        async fn summarize(
            &self,
            _turns: &[ConversationTurn],
            _existing_summary: Option<&str>,
        ) -> StageResult<String> {
            Ok("summary".to_string())
        }
    }

    #[derive(Default)]
    struct FakeTts {
        delay_ms: u64,
        fail: Option<StageError>,
    }

    #[async_trait]
    impl SpeechSynthesis for FakeTts {
        async fn synthesize(&self, _text: &str, _voice: &str) -> StageResult<SynthesizedSpeech> {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            if let Some(err) = &self.fail {
                return Err(err.clone());
            }
            Ok(SynthesizedSpeech {
                samples: vec![0.0; 1_600],
                sample_rate: 16_000,
                duration_s: 0.1,
                processing_ms: 9,
            })
        }
    }

    fn session(id: u64, sample_count: usize) -> SpeechSession {
        SpeechSession {
            id,
            samples: vec![0.1; sample_count],
            sample_rate: 16_000,
            started_at_ms: 0,
            last_speech_ms: 0,
            screen_image: None,
        }
    }

    fn spawn_with(
        stt: FakeStt,
        llm: FakeLlm,
        tts: FakeTts,
        config: OrchestratorConfig,
    ) -> (
        mpsc::Sender<Command>,
        JoinHandle<ConversationMemory>,
        Arc<VecSink>,
        Arc<FakeLlm>,
    ) {
        let llm = Arc::new(llm);
        let sink = VecSink::new();
        let memory = ConversationMemory::new(
            llm.clone(),
            config.memory_max_tokens,
            config.summarize_wait(),
        );
        let coordinator = PipelineCoordinator::new(
            Arc::new(stt),
            llm.clone(),
            Arc::new(tts),
            memory,
            sink.clone(),
            config,
            "conn-test",
        );
        let (tx, handle) = coordinator.spawn();
        (tx, handle, sink, llm)
    }

    async fn finish(
        tx: mpsc::Sender<Command>,
        handle: JoinHandle<ConversationMemory>,
    ) -> ConversationMemory {
        let _ = tx.send(Command::Shutdown).await;
        handle.await.expect("coordinator task should not panic")
    }

    #[tokio::test]
    async fn completed_session_produces_ordered_triple_and_memory_turn() {
        let (tx, handle, sink, _llm) = spawn_with(
            FakeStt::default(),
            FakeLlm::default(),
            FakeTts::default(),
            OrchestratorConfig::default(),
        );
        tx.send(Command::Session(session(1, 16_000))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let memory = finish(tx, handle).await;

        assert_eq!(
            sink.kinds(),
            vec!["transcription_result", "ai_response", "audio_response"]
        );
        assert_eq!(memory.turn_count(), 1);
        let turn = memory.turns().next().unwrap();
        assert_eq!(turn.user_text, "utterance of 16000 samples");
        assert_eq!(turn.assistant_text, "You said: utterance of 16000 samples");
    }

    #[tokio::test]
    async fn same_utterance_twice_produces_two_independent_triples() {
        let (tx, handle, sink, llm) = spawn_with(
            FakeStt::default(),
            FakeLlm::default(),
            FakeTts::default(),
            OrchestratorConfig::default(),
        );
        tx.send(Command::Session(session(1, 16_000))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(Command::Session(session(2, 16_000))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let memory = finish(tx, handle).await;

        assert_eq!(
            sink.kinds(),
            vec![
                "transcription_result",
                "ai_response",
                "audio_response",
                "transcription_result",
                "ai_response",
                "audio_response",
            ]
        );
        assert_eq!(memory.turn_count(), 2);
        // The first turn was in memory before the second model call began.
        assert_eq!(
            *llm.snapshot_turn_counts.lock().expect("lock"),
            vec![0, 1]
        );
    }

    #[tokio::test]
    async fn empty_transcription_is_dropped_silently() {
        let (tx, handle, sink, _llm) = spawn_with(
            FakeStt {
                fixed_text: Some("   ".to_string()),
                ..Default::default()
            },
            FakeLlm::default(),
            FakeTts::default(),
            OrchestratorConfig::default(),
        );
        tx.send(Command::Session(session(1, 16_000))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let memory = finish(tx, handle).await;

        assert!(sink.kinds().is_empty());
        assert_eq!(memory.turn_count(), 0);
    }

    #[tokio::test]
    async fn transcription_failure_emits_single_error_and_drops_session() {
        let (tx, handle, sink, _llm) = spawn_with(
            FakeStt {
                fail: Some(StageError::UpstreamUnavailable("down".into())),
                ..Default::default()
            },
            FakeLlm::default(),
            FakeTts::default(),
            OrchestratorConfig::default(),
        );
        tx.send(Command::Session(session(1, 16_000))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let memory = finish(tx, handle).await;

        assert_eq!(sink.kinds(), vec!["error"]);
        match &sink.events()[0] {
            ServerEvent::Error { kind, .. } => assert_eq!(*kind, ErrorKind::SttFailed),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(memory.turn_count(), 0);
    }

    #[tokio::test]
    async fn model_failure_emits_error_and_records_nothing() {
        let (tx, handle, sink, _llm) = spawn_with(
            FakeStt::default(),
            FakeLlm {
                fail: Some(StageError::UpstreamRejected("quota".into())),
                ..Default::default()
            },
            FakeTts::default(),
            OrchestratorConfig::default(),
        );
        tx.send(Command::Session(session(1, 16_000))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let memory = finish(tx, handle).await;

        assert_eq!(sink.kinds(), vec!["transcription_result", "error"]);
        match &sink.events()[1] {
            ServerEvent::Error { kind, .. } => assert_eq!(*kind, ErrorKind::LlmFailed),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(memory.turn_count(), 0);
    }

    #[tokio::test]
    async fn synthesis_failure_still_commits_the_turn() {
        let (tx, handle, sink, _llm) = spawn_with(
            FakeStt::default(),
            FakeLlm::default(),
            FakeTts {
                fail: Some(StageError::Timeout),
                ..Default::default()
            },
            OrchestratorConfig::default(),
        );
        tx.send(Command::Session(session(1, 16_000))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let memory = finish(tx, handle).await;

        assert_eq!(
            sink.kinds(),
            vec!["transcription_result", "ai_response", "error"]
        );
        assert_eq!(memory.turn_count(), 1);
    }

    #[tokio::test]
    async fn new_session_preempts_inflight_transcription() {
        let (tx, handle, sink, _llm) = spawn_with(
            FakeStt {
                delay_ms: 300,
                ..Default::default()
            },
            FakeLlm::default(),
            FakeTts::default(),
            OrchestratorConfig::default(),
        );
        tx.send(Command::Session(session(1, 16_000))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(Command::Session(session(2, 32_000))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        let memory = finish(tx, handle).await;

        // No events for the preempted session; a full triple for the new one.
        assert_eq!(
            sink.kinds(),
            vec!["transcription_result", "ai_response", "audio_response"]
        );
        match &sink.events()[0] {
            ServerEvent::TranscriptionResult { text, .. } => {
                assert_eq!(text, "utterance of 32000 samples")
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(memory.turn_count(), 1);
        assert_eq!(
            memory.turns().next().unwrap().user_text,
            "utterance of 32000 samples"
        );
    }

    #[tokio::test]
    async fn session_arriving_during_synthesis_is_queued_not_cancelled() {
        let (tx, handle, sink, _llm) = spawn_with(
            FakeStt::default(),
            FakeLlm::default(),
            FakeTts {
                delay_ms: 200,
                ..Default::default()
            },
            OrchestratorConfig::default(),
        );
        tx.send(Command::Session(session(1, 16_000))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(Command::Session(session(2, 32_000))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        let memory = finish(tx, handle).await;

        assert_eq!(
            sink.kinds(),
            vec![
                "transcription_result",
                "ai_response",
                "audio_response",
                "transcription_result",
                "ai_response",
                "audio_response",
            ]
        );
        assert_eq!(memory.turn_count(), 2);
        let users: Vec<_> = memory.turns().map(|t| t.user_text.clone()).collect();
        assert_eq!(
            users,
            vec!["utterance of 16000 samples", "utterance of 32000 samples"]
        );
    }

    #[tokio::test]
    async fn third_session_displaces_the_queued_one_with_a_diagnostic() {
        let (tx, handle, sink, _llm) = spawn_with(
            FakeStt::default(),
            FakeLlm::default(),
            FakeTts {
                delay_ms: 300,
                ..Default::default()
            },
            OrchestratorConfig::default(),
        );
        tx.send(Command::Session(session(1, 16_000))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(Command::Session(session(2, 32_000))).await.unwrap();
        tx.send(Command::Session(session(3, 48_000))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        let memory = finish(tx, handle).await;

        let kinds = sink.kinds();
        assert_eq!(
            kinds,
            vec![
                "transcription_result",
                "ai_response",
                "audio_response",
                "error",
                "transcription_result",
                "ai_response",
                "audio_response",
            ]
        );
        match &sink.events()[3] {
            ServerEvent::Error { kind, message, .. } => {
                assert_eq!(*kind, ErrorKind::SessionDropped);
                assert!(message.contains('2'));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        let users: Vec<_> = memory.turns().map(|t| t.user_text.clone()).collect();
        assert_eq!(
            users,
            vec!["utterance of 16000 samples", "utterance of 48000 samples"]
        );
    }

    #[tokio::test]
    async fn model_screen_request_roundtrips_through_the_client() {
        let (tx, handle, sink, llm) = spawn_with(
            FakeStt::default(),
            FakeLlm {
                wants_screen: true,
                provisional_text: String::new(),
                ..Default::default()
            },
            FakeTts::default(),
            OrchestratorConfig::default(),
        );
        tx.send(Command::Session(session(1, 16_000))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(Command::ScreenCaptureResponse {
            image: Some("data:image/jpeg;base64,xyz".to_string()),
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let memory = finish(tx, handle).await;

        assert_eq!(
            sink.kinds(),
            vec![
                "transcription_result",
                "screen_capture_request",
                "ai_response",
                "audio_response",
            ]
        );
        assert!(llm.saw_image.load(Ordering::SeqCst));
        match &sink.events()[2] {
            ServerEvent::AiResponse { screen_context, .. } => {
                assert!(screen_context.is_some())
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(memory.turn_count(), 1);
    }

    #[tokio::test]
    async fn screen_timeout_keeps_the_provisional_answer() {
        let config = OrchestratorConfig {
            screen_capture_wait_s: 0,
            ..Default::default()
        };
        let (tx, handle, sink, _llm) = spawn_with(
            FakeStt::default(),
            FakeLlm {
                wants_screen: true,
                provisional_text: "Best guess without the screen".to_string(),
                ..Default::default()
            },
            FakeTts::default(),
            config,
        );
        tx.send(Command::Session(session(1, 16_000))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let memory = finish(tx, handle).await;

        assert_eq!(
            sink.kinds(),
            vec![
                "transcription_result",
                "screen_capture_request",
                "ai_response",
                "audio_response",
            ]
        );
        match &sink.events()[2] {
            ServerEvent::AiResponse { text, .. } => {
                assert_eq!(text, "Best guess without the screen")
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(memory.turn_count(), 1);
    }

    #[tokio::test]
    async fn screen_timeout_without_provisional_text_fails_the_job() {
        let config = OrchestratorConfig {
            screen_capture_wait_s: 0,
            ..Default::default()
        };
        let (tx, handle, sink, _llm) = spawn_with(
            FakeStt::default(),
            FakeLlm {
                wants_screen: true,
                provisional_text: String::new(),
                ..Default::default()
            },
            FakeTts::default(),
            config,
        );
        tx.send(Command::Session(session(1, 16_000))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let memory = finish(tx, handle).await;

        assert_eq!(
            sink.kinds(),
            vec!["transcription_result", "screen_capture_request", "error"]
        );
        match &sink.events()[2] {
            ServerEvent::Error { kind, .. } => assert_eq!(*kind, ErrorKind::ScreenUnavailable),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(memory.turn_count(), 0);
    }

    #[tokio::test]
    async fn attached_screen_image_suppresses_capture_requests() {
        let (tx, handle, sink, llm) = spawn_with(
            FakeStt::default(),
            FakeLlm {
                wants_screen: true,
                ..Default::default()
            },
            FakeTts::default(),
            OrchestratorConfig::default(),
        );
        let mut with_image = session(1, 16_000);
        with_image.screen_image = Some("data:image/jpeg;base64,abc".to_string());
        tx.send(Command::Session(with_image)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let memory = finish(tx, handle).await;

        assert_eq!(
            sink.kinds(),
            vec!["transcription_result", "ai_response", "audio_response"]
        );
        assert!(llm.saw_image.load(Ordering::SeqCst));
        assert_eq!(memory.turn_count(), 1);
    }

    #[tokio::test]
    async fn trigger_phrase_fetches_the_screen_before_the_model_call() {
        let (tx, handle, sink, llm) = spawn_with(
            FakeStt {
                fixed_text: Some("what is on my screen".to_string()),
                ..Default::default()
            },
            FakeLlm::default(),
            FakeTts::default(),
            OrchestratorConfig::default(),
        );
        tx.send(Command::ScreenShare(true)).await.unwrap();
        tx.send(Command::Session(session(1, 16_000))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(Command::ScreenCaptureResponse {
            image: Some("data:image/jpeg;base64,xyz".to_string()),
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let memory = finish(tx, handle).await;

        assert_eq!(
            sink.kinds(),
            vec![
                "transcription_result",
                "screen_capture_request",
                "ai_response",
                "audio_response",
            ]
        );
        assert!(llm.saw_image.load(Ordering::SeqCst));
        assert_eq!(memory.turn_count(), 1);
    }
}
