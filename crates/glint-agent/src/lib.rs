pub mod clients;
pub mod coordinator;
pub mod errors;
pub mod http;
pub mod memory;
pub mod screen_triggers;

pub use clients::{
    LanguageModel, LlmReply, RespondRequest, SpeechSynthesis, SpeechToText, SynthesizedSpeech,
    Transcription,
};
pub use coordinator::{Command, EventSink, PipelineCoordinator};
pub use errors::{Result, StageError};
pub use memory::{estimate_tokens, ConversationMemory, ConversationTurn, MemorySnapshot};
