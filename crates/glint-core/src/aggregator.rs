//! Speech session aggregation.
//!
//! Consumes per-frame audio and voice-activity verdicts and groups speech into
//! sessions bounded by silence or by the maximum utterance duration. The state
//! machine is a pure function of (state, frame) so it can be driven in tests
//! without a transport: callers pass the frame clock in explicitly and act on
//! the returned outputs.

use crate::audio;
use crate::config::OrchestratorConfig;
use crate::events::VadVerdict;

/// At most one silence notice every this many milliseconds.
const INACTIVE_NOTICE_INTERVAL_MS: u64 = 2_000;
/// After this much continuous silence, notices stop until speech resumes.
const INACTIVE_SUPPRESS_AFTER_MS: u64 = 5_000;

/// One maximal contiguous span of speech, delivered to transcription as a
/// single buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechSession {
    /// Unique per connection, monotonically increasing.
    pub id: u64,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub started_at_ms: u64,
    pub last_speech_ms: u64,
    /// Screen capture delivered alongside the audio, if any.
    pub screen_image: Option<String>,
}

impl SpeechSession {
    pub fn duration_s(&self) -> f32 {
        audio::duration_s(self.samples.len(), self.sample_rate)
    }
}

/// What the caller should do after feeding a frame.
#[derive(Debug, PartialEq)]
pub enum AggregatorOutput {
    /// Speech began on an idle stream; notify the client.
    SpeechStarted,
    /// Rate-limited silence notice; notify the client.
    SilenceNoted,
    /// A session closed with enough audio; hand it to the pipeline.
    SessionComplete(SpeechSession),
    /// A session closed below the minimum duration; nothing downstream.
    SessionDiscarded { duration_s: f32 },
}

#[derive(Debug)]
enum State {
    Idle,
    Capturing(SpeechSession),
}

#[derive(Debug)]
pub struct SessionAggregator {
    sample_rate: u32,
    min_samples: usize,
    max_samples: usize,
    state: State,
    next_session_id: u64,
    enabled: bool,
    silence_since_ms: Option<u64>,
    last_inactive_notice_ms: Option<u64>,
}

impl SessionAggregator {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            min_samples: config.min_speech_samples(),
            max_samples: config.max_speech_samples(),
            state: State::Idle,
            next_session_id: 0,
            enabled: true,
            silence_since_ms: None,
            last_inactive_notice_ms: None,
        }
    }

    /// Enable or disable ingest. Disabling discards any open session.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.state = State::Idle;
            self.silence_since_ms = None;
            self.last_inactive_notice_ms = None;
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Feed one `audio_data` frame.
    pub fn handle_frame(
        &mut self,
        data: &[f32],
        sample_rate: u32,
        vad: &VadVerdict,
        screen_image: Option<String>,
        now_ms: u64,
    ) -> Vec<AggregatorOutput> {
        let mut outputs = Vec::new();
        if !self.enabled {
            return outputs;
        }
        let samples = audio::resample_linear(data, sample_rate, self.sample_rate);
        if vad.is_speaking {
            self.on_speech(samples, screen_image, now_ms, &mut outputs);
        } else {
            self.on_silence(samples, screen_image, now_ms, &mut outputs);
        }
        outputs
    }

    /// Feed a `vad_state` silence-only signal (no samples).
    pub fn handle_silence(&mut self, vad: &VadVerdict, now_ms: u64) -> Vec<AggregatorOutput> {
        self.handle_frame(&[], self.sample_rate, vad, None, now_ms)
    }

    fn on_speech(
        &mut self,
        samples: Vec<f32>,
        mut screen_image: Option<String>,
        now_ms: u64,
        outputs: &mut Vec<AggregatorOutput>,
    ) {
        self.silence_since_ms = None;
        self.last_inactive_notice_ms = None;

        let mut remaining = samples;
        loop {
            if matches!(self.state, State::Idle) {
                let session = self.open_session(now_ms, screen_image.take());
                outputs.push(AggregatorOutput::SpeechStarted);
                self.state = State::Capturing(session);
            }
            let max_samples = self.max_samples;
            let State::Capturing(session) = &mut self.state else {
                unreachable!("state set to Capturing above");
            };
            session.last_speech_ms = now_ms;
            if screen_image.is_some() {
                session.screen_image = screen_image.take();
            }
            let room = max_samples.saturating_sub(session.samples.len());
            if remaining.len() < room {
                session.samples.append(&mut remaining);
                return;
            }
            // Forced closure at the maximum duration. Any overflow seeds the
            // next session so no speech is lost.
            let overflow = remaining.split_off(room);
            session.samples.append(&mut remaining);
            let completed = match std::mem::replace(&mut self.state, State::Idle) {
                State::Capturing(s) => s,
                State::Idle => unreachable!("session checked above"),
            };
            outputs.push(AggregatorOutput::SessionComplete(completed));
            if overflow.is_empty() {
                return;
            }
            remaining = overflow;
        }
    }

    fn on_silence(
        &mut self,
        samples: Vec<f32>,
        screen_image: Option<String>,
        now_ms: u64,
        outputs: &mut Vec<AggregatorOutput>,
    ) {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Capturing(session) => {
                // Samples on a closing silence marker are not speech; the
                // verdict wins and they are not appended.
                self.silence_since_ms = Some(now_ms);
                self.finish_session(session, outputs);
            }
            State::Idle => {
                if !samples.is_empty() {
                    // Client-side VAD protocol: a whole utterance delivered in
                    // one silent frame completes atomically.
                    let mut session = self.open_session(now_ms, screen_image);
                    session.samples = samples;
                    session.samples.truncate(self.max_samples);
                    self.silence_since_ms = Some(now_ms);
                    self.last_inactive_notice_ms = None;
                    self.finish_session(session, outputs);
                } else {
                    self.maybe_notice_silence(now_ms, outputs);
                }
            }
        }
    }

    fn finish_session(&mut self, session: SpeechSession, outputs: &mut Vec<AggregatorOutput>) {
        if session.samples.len() >= self.min_samples {
            outputs.push(AggregatorOutput::SessionComplete(session));
        } else {
            outputs.push(AggregatorOutput::SessionDiscarded {
                duration_s: session.duration_s(),
            });
        }
    }

    fn maybe_notice_silence(&mut self, now_ms: u64, outputs: &mut Vec<AggregatorOutput>) {
        let since = *self.silence_since_ms.get_or_insert(now_ms);
        if now_ms.saturating_sub(since) >= INACTIVE_SUPPRESS_AFTER_MS {
            return;
        }
        let due = match self.last_inactive_notice_ms {
            Some(last) => now_ms.saturating_sub(last) >= INACTIVE_NOTICE_INTERVAL_MS,
            None => true,
        };
        if due {
            self.last_inactive_notice_ms = Some(now_ms);
            outputs.push(AggregatorOutput::SilenceNoted);
        }
    }

    fn open_session(&mut self, now_ms: u64, screen_image: Option<String>) -> SpeechSession {
        self.next_session_id += 1;
        SpeechSession {
            id: self.next_session_id,
            samples: Vec::new(),
            sample_rate: self.sample_rate,
            started_at_ms: now_ms,
            last_speech_ms: now_ms,
            screen_image,
        }
    }
}
